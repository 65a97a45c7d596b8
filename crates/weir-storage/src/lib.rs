// Durable FIFO collaborator behind each channel's in-memory backlog.
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;

pub mod ephemeral;
pub mod file;

pub use ephemeral::EphemeralBackend;
pub use file::FileBackend;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("backend queue is closed")]
    Closed,
    #[error("record of {size} bytes outside bounds [{min}, {max}]")]
    InvalidRecordSize { size: usize, min: usize, max: usize },
    #[error("corrupt record at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable FIFO the channel engine spills into when its in-memory backlog is
/// full, and drains from once the backlog is empty. Implementations handle
/// their own synchronisation.
#[async_trait]
pub trait BackendQueue: Debug + Send + Sync {
    /// Appends one opaque record at the tail.
    async fn put(&self, data: Bytes) -> Result<()>;

    /// The read stream: pops the next unread record, `None` once drained.
    async fn read_next(&self) -> Result<Option<Bytes>>;

    /// Appended-but-unread record count.
    fn depth(&self) -> i64;

    /// Discards every record.
    async fn empty(&self) -> Result<()>;

    /// Persists state and stops accepting traffic.
    async fn close(&self) -> Result<()>;

    /// Closes and removes all on-disk state.
    async fn delete(&self) -> Result<()>;
}
