//! Network error types.

use thiserror::Error;

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Message too large.
    #[error("Message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// The SOCKS5 proxy itself could not be reached or misbehaved.
    #[error("Proxy failed: {0}")]
    ProxyFailed(String),

    /// The proxy worked but could not reach the destination.
    #[error("Proxy could not reach destination: {0}")]
    ProxyTargetUnreachable(String),

    /// Operation interrupted by shutdown.
    #[error("Interrupted")]
    Interrupted,

    /// Write-once field set a second time.
    #[error("{field} already set for peer {peer}")]
    AlreadySet { field: &'static str, peer: u64 },

    /// Listener could not be bound.
    #[error("Bind failed: {0}")]
    BindFailed(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Address could not be parsed or resolved.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl NetworkError {
    /// Whether the failure happened while talking to the proxy rather than the target.
    ///
    /// Such failures must not be charged against the target address.
    pub fn is_proxy_failure(&self) -> bool {
        matches!(self, NetworkError::ProxyFailed(_))
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(e: serde_json::Error) -> Self {
        NetworkError::Serialization(e.to_string())
    }
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
