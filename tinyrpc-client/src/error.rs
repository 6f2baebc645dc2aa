//! Client error types.

use tinyrpc_protocol::CodecType;
use tinyrpc_registry::RegistryError;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] tinyrpc_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid rpc address {0:?}")]
    InvalidAddress(String),

    #[error("unsupported codec type {0}")]
    UnknownCodec(CodecType),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection is shut down")]
    Shutdown,

    #[error("request timeout")]
    Timeout,

    #[error("{0}")]
    Server(String),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("call task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ClientError {
    /// Returns whether retrying on a fresh connection may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Timeout
                | ClientError::ConnectionClosed
                | ClientError::Shutdown
        )
    }
}

/// Discovery errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("rpc discovery: no available servers")]
    NoAvailableServers,

    #[error("rpc discovery: not supported select mode {0:?}")]
    UnsupportedMode(String),

    #[error("rpc discovery: {0}")]
    Registry(#[from] RegistryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            DiscoveryError::NoAvailableServers.to_string(),
            "rpc discovery: no available servers"
        );
        let err: ClientError = DiscoveryError::UnsupportedMode("weighted".into()).into();
        assert!(err.to_string().contains("weighted"));
        assert!(!err.is_retryable());

        let err = ClientError::Server("rpc server: can't find method Foo.Bar".into());
        assert_eq!(err.to_string(), "rpc server: can't find method Foo.Bar");
        assert!(ClientError::ConnectionClosed.is_retryable());
    }
}
