use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid live endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("failed to open live connection: {0}")]
    Connect(String),
    #[error("live connection closed")]
    Closed,
    #[error("live connection dropped: {0}")]
    Dropped(String),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("attachment '{file_name}' is {size} bytes; the limit is {limit} bytes")]
    AttachmentTooLarge {
        file_name: String,
        size: usize,
        limit: usize,
    },
    #[error("message has neither content nor attachment")]
    Empty,
    #[error("messaging session has been shut down")]
    ShutDown,
    #[error("failed to send message: {source}")]
    Request { source: anyhow::Error },
}
