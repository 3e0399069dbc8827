use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("network error: {0}")]
    Network(String),
    #[error("handshake rejected with HTTP status {0}")]
    HttpStatus(u16),
    #[error("channel is closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

impl ChannelError {
    /// Network failures and transient HTTP statuses are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::HttpStatus(status) => matches!(status, 408 | 500 | 501 | 502 | 503 | 504),
            Self::Closed | Self::Other(_) => false,
        }
    }
}

/// Events produced by an open secure channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// One complete, decrypted frame.
    Frame(Bytes),
    /// The channel is gone. `remote` is false when we stopped it ourselves.
    Closed { remote: bool },
}

/// An authenticated, framed, encrypted connection to the server.
#[async_trait]
pub trait SecureChannel: Send + Sync {
    async fn send_frame(&self, frame: Bytes) -> Result<(), ChannelError>;

    fn is_connected(&self) -> bool;

    /// Closes the channel. Implementations must follow up with
    /// `ChannelEvent::Closed { remote: false }` on the event stream.
    async fn stop(&self);
}

/// Opens a channel and completes the handshake.
#[async_trait]
pub trait SecureChannelFactory: Send + Sync {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn SecureChannel>, mpsc::Receiver<ChannelEvent>), ChannelError>;
}
