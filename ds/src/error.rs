#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to station {0}")]
    ConnectFailed(String),
    #[error("Connection to station lost")]
    ConnectionLost,
    #[error("Transport already closed")]
    Closed,
}
