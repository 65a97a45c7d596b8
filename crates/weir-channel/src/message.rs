// Message record and its backend wire form.
use crate::{ChannelError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};
use weir_common::ids::{ClientId, MessageId};

/// Encoded size of a message with an empty body: timestamp, attempts, id.
pub const MIN_ENCODED_LEN: usize = 8 + 2 + MessageId::LEN;

/// One message as the channel tracks it. The owner and delivery timestamp
/// are only meaningful while the message is in flight.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub body: Bytes,
    /// Nanoseconds since epoch at original publication.
    pub timestamp: i64,
    /// Times this message has been handed to any consumer.
    pub attempts: u16,
    pub(crate) owner: Option<ClientId>,
    /// Wall time of the most recent delivery; caps touch extensions.
    pub(crate) delivery_ts: i64,
}

impl Message {
    pub fn new(id: MessageId, body: Bytes) -> Self {
        Self {
            id,
            body,
            timestamp: now_nanos(),
            attempts: 0,
            owner: None,
            delivery_ts: 0,
        }
    }

    /// The consumer currently holding this message, while in flight.
    pub fn owner(&self) -> Option<ClientId> {
        self.owner
    }

    pub fn encoded_len(&self) -> usize {
        MIN_ENCODED_LEN + self.body.len()
    }

    /// Writes the backend wire form: big-endian timestamp and attempts,
    /// then the raw id and body.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_i64(self.timestamp);
        buf.put_u16(self.attempts);
        buf.put_slice(self.id.as_bytes());
        buf.put_slice(&self.body);
    }

    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < MIN_ENCODED_LEN {
            return Err(ChannelError::InvalidMessage(format!(
                "buffer of {} bytes below minimum of {MIN_ENCODED_LEN}",
                data.len()
            )));
        }
        let timestamp = data.get_i64();
        let attempts = data.get_u16();
        let mut id = [0u8; MessageId::LEN];
        data.copy_to_slice(&mut id);
        Ok(Self {
            id: MessageId::from_bytes(id),
            body: data,
            timestamp,
            attempts,
            owner: None,
            delivery_ts: 0,
        })
    }
}

/// Current wall time in nanoseconds since epoch.
pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as i64
}
