use crate::{BackendQueue, Result};
use async_trait::async_trait;
use bytes::Bytes;

/// No-op backend for ephemeral channels: writes are discarded, reads yield
/// nothing, and the depth is always zero.
#[derive(Debug, Default)]
pub struct EphemeralBackend;

impl EphemeralBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BackendQueue for EphemeralBackend {
    async fn put(&self, _data: Bytes) -> Result<()> {
        // Ephemeral channels trade durability for zero disk traffic.
        Ok(())
    }

    async fn read_next(&self) -> Result<Option<Bytes>> {
        Ok(None)
    }

    fn depth(&self) -> i64 {
        0
    }

    async fn empty(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discards_writes_and_reports_empty() {
        let backend = EphemeralBackend::new();
        backend.put(Bytes::from_static(b"gone")).await.expect("put");
        assert_eq!(backend.depth(), 0);
        assert!(backend.read_next().await.expect("read").is_none());
        backend.empty().await.expect("empty");
        backend.close().await.expect("close");
        backend.delete().await.expect("delete");
    }
}
