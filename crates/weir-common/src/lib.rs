// Shared identifiers, channel options, and the process health signal.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
}

/// Channel names carrying this suffix skip the durable backend and are
/// deleted automatically when their last consumer leaves.
pub const EPHEMERAL_SUFFIX: &str = "#ephemeral";

pub mod ids {
    // Process-unique message ids plus the integer consumer id.
    use super::{Error, Result};
    use std::fmt;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Fixed-width message identifier: the lower-case hex form of a
    /// process-unique 64-bit sequence number. The hex form is also the wire
    /// representation, so the id can be embedded in frames verbatim.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
    pub struct MessageId([u8; Self::LEN]);

    impl MessageId {
        pub const LEN: usize = 16;

        pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
            Self(bytes)
        }

        pub fn as_bytes(&self) -> &[u8; Self::LEN] {
            &self.0
        }
    }

    impl fmt::Display for MessageId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            // The id is hex by construction; lossy conversion never triggers.
            write!(f, "{}", String::from_utf8_lossy(&self.0))
        }
    }

    impl FromStr for MessageId {
        type Err = Error;

        fn from_str(input: &str) -> Result<Self> {
            let bytes: [u8; Self::LEN] = input
                .as_bytes()
                .try_into()
                .map_err(|_| Error::InvalidId(input.into()))?;
            if !bytes.iter().all(u8::is_ascii_hexdigit) {
                return Err(Error::InvalidId(input.into()));
            }
            Ok(Self(bytes))
        }
    }

    /// Hands out process-unique message ids from an atomic sequence.
    #[derive(Debug, Default)]
    pub struct IdFactory {
        sequence: AtomicU64,
    }

    impl IdFactory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn next_id(&self) -> MessageId {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
            let mut id = [0u8; MessageId::LEN];
            let hex = format!("{seq:016x}");
            id.copy_from_slice(hex.as_bytes());
            MessageId(id)
        }
    }

    /// Identifier of a connected consumer, assigned by the session layer.
    #[derive(
        Clone,
        Copy,
        Debug,
        Default,
        Eq,
        PartialEq,
        Hash,
        PartialOrd,
        Ord,
        serde::Serialize,
        serde::Deserialize,
    )]
    pub struct ClientId(i64);

    impl ClientId {
        pub fn new(id: i64) -> Self {
            Self(id)
        }

        pub fn value(self) -> i64 {
            self.0
        }
    }

    impl fmt::Display for ClientId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }
}

/// Per-channel tunables, shared by every channel of a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Backlog capacity in messages. Zero disables the in-memory backlog for
    /// durable channels, forcing every put through the backend for strict
    /// FIFO ordering.
    pub mem_queue_size: usize,
    /// Hard cap on touch-extended deadlines, counted from initial delivery.
    pub max_msg_timeout: Duration,
    /// Per-channel consumer cap. Zero means unlimited.
    pub max_channel_consumers: usize,
    /// Payload bound, enforced by the backend queue.
    pub max_msg_size: usize,
    /// Sample window for the end-to-end latency estimator. Zero disables it.
    pub e2e_latency_window: usize,
    /// Directory for durable backend files.
    pub data_path: PathBuf,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            mem_queue_size: 10_000,
            max_msg_timeout: Duration::from_secs(15 * 60),
            max_channel_consumers: 0,
            max_msg_size: 1024 * 1024,
            e2e_latency_window: 0,
            data_path: PathBuf::from("."),
        }
    }
}

pub mod health {
    // Process-wide health flag fed by backend append results.
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Latest backend health, shared across every channel of a process.
    /// Healthy until the first failed append; healthy again once an append
    /// succeeds.
    #[derive(Debug)]
    pub struct Health {
        healthy: AtomicBool,
        error: Mutex<Option<String>>,
    }

    impl Health {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_ok(&self) {
            self.healthy.store(true, Ordering::Release);
            *self.error.lock().expect("health lock") = None;
        }

        pub fn set_error(&self, message: impl Into<String>) {
            *self.error.lock().expect("health lock") = Some(message.into());
            self.healthy.store(false, Ordering::Release);
        }

        pub fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::Acquire)
        }

        /// The error behind the current unhealthy state, if any.
        pub fn error(&self) -> Option<String> {
            self.error.lock().expect("health lock").clone()
        }
    }

    impl Default for Health {
        fn default() -> Self {
            Self {
                healthy: AtomicBool::new(true),
                error: Mutex::new(None),
            }
        }
    }
}

pub use health::Health;

#[cfg(test)]
mod tests {
    use super::ids::{ClientId, IdFactory, MessageId};
    use super::*;
    use std::str::FromStr;

    #[test]
    fn message_ids_are_unique_and_hex() {
        let factory = IdFactory::new();
        let a = factory.next_id();
        let b = factory.next_id();
        assert_ne!(a, b);
        assert!(a.to_string().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.to_string().len(), MessageId::LEN);
    }

    #[test]
    fn message_id_round_trips_through_display() {
        let id = IdFactory::new().next_id();
        let parsed = MessageId::from_str(&id.to_string()).expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn message_id_rejects_bad_input() {
        assert!(MessageId::from_str("short").is_err());
        assert!(MessageId::from_str("zzzzzzzzzzzzzzzz").is_err());
    }

    #[test]
    fn client_id_preserves_value() {
        let id = ClientId::new(42);
        assert_eq!(id.value(), 42);
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn options_defaults_are_sane() {
        let opts = ChannelOptions::default();
        assert!(opts.mem_queue_size > 0);
        assert!(opts.max_msg_timeout > Duration::ZERO);
        assert_eq!(opts.max_channel_consumers, 0);
        assert!(opts.max_msg_size > 0);
    }

    #[test]
    fn health_tracks_latest_result() {
        let health = Health::new();
        assert!(health.is_healthy());
        health.set_error("disk full");
        assert!(!health.is_healthy());
        assert_eq!(health.error().as_deref(), Some("disk full"));
        health.set_ok();
        assert!(health.is_healthy());
        assert!(health.error().is_none());
    }
}
