//! Server error types.

use tinyrpc_protocol::CodecType;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] tinyrpc_protocol::ProtocolError),

    #[error("invalid magic number {0:#x}")]
    InvalidMagic(u32),

    #[error("invalid codec type {0}")]
    UnknownCodec(CodecType),
}

impl ServerError {
    /// Returns whether the connection was rejected during the handshake.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidMagic(_) | ServerError::UnknownCodec(_) | ServerError::Protocol(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = ServerError::InvalidMagic(0x1234);
        assert_eq!(err.to_string(), "invalid magic number 0x1234");

        let err = ServerError::UnknownCodec(CodecType::new("application/gob"));
        assert!(err.to_string().contains("application/gob"));
        assert!(err.is_handshake());

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(!ServerError::Io(io).is_handshake());
    }
}
