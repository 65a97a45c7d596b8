// Per-channel delivery engine of a topic/channel message broker.
//
// A topic fans out each published message to every subscribed channel; a
// channel is an independent consumption stream with its own consumers, its
// own durable backlog, and its own in-flight / deferred redelivery state.
use weir_common::ids::MessageId;
use weir_storage::StorageError;

mod backlog;
pub mod channel;
pub mod consumer;
pub mod latency;
pub mod message;
mod tracker;

pub use channel::{Channel, ChannelContext, DeleteCallback, Notifier};
pub use consumer::{Consumer, ConsumerStats};
pub use message::Message;

pub type Result<T> = std::result::Result<T, ChannelError>;

#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    /// Operation attempted during or after shutdown.
    #[error("exiting")]
    Exiting,
    /// The id is not in the requested tracker; the client may simply have
    /// raced a timeout.
    #[error("message not tracked")]
    NotFound,
    #[error("client does not own message")]
    WrongOwner,
    /// The id is already tracked. Non-fatal, but it points at a bug in the
    /// caller's id handling.
    #[error("message {0} already tracked")]
    Duplicate(MessageId),
    #[error("consumers for {topic}:{channel} exceeds limit of {max}")]
    TooManyConsumers {
        topic: String,
        channel: String,
        max: usize,
    },
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error(transparent)]
    Backend(#[from] StorageError),
}
