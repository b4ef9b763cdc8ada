use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::session::protocol::Outbound;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Single slot through which every outbound message is written.
///
/// A sender holds the slot from its first line until the terminator has been
/// flushed, so messages from the read loop, the event forwarder and the log
/// forwarder never interleave. Waiting senders are served in FIFO order.
#[derive(Clone, Default)]
pub struct OutboundSlot {
    writer: Arc<Mutex<Option<Writer>>>,
}

impl OutboundSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach<W>(&self, writer: W)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        *self.writer.lock().await = Some(Box::new(writer));
    }

    /// Drops the writer. Messages sent afterwards fail with `NotConnected`.
    pub async fn detach(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    pub async fn send(&self, message: &Outbound) -> std::io::Result<()> {
        let encoded = message.encode();
        let mut slot = self.writer.lock().await;
        let writer = slot.as_mut().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "not connected to the control server",
            )
        })?;
        writer.write_all(encoded.as_bytes()).await?;
        writer.flush().await
    }
}

impl std::fmt::Debug for OutboundSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundSlot").finish_non_exhaustive()
    }
}
