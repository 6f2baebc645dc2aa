//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame magic: expected 'TRPC', got {0:?}")]
    InvalidFrameMagic([u8; 4]),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("payload contains a line separator")]
    EmbeddedNewline,

    #[error("connection option exceeds {max} bytes")]
    OptionTooLarge { max: usize },

    #[error("invalid body: {0}")]
    Body(#[source] serde_json::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Eof,

    #[error("connection closed mid-message with {buffered} bytes buffered")]
    UnexpectedEof { buffered: usize },
}

impl ProtocolError {
    /// Returns whether the peer closed the stream, cleanly or mid-message.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Eof | ProtocolError::UnexpectedEof { .. })
    }

    /// Returns whether a message was consumed in full but its payload was
    /// unusable, either failing its checksum or failing to decode.
    ///
    /// The stream is still aligned on a message boundary after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Body(_) | ProtocolError::CrcMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::InvalidFrameMagic(*b"XXXX");
        assert!(err.to_string().contains("magic"));

        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::CrcMismatch {
            expected: 0xABC,
            actual: 0xDEF,
        };
        let msg = err.to_string();
        assert!(msg.contains("abc") || msg.contains("ABC"));

        let err = ProtocolError::OptionTooLarge { max: 4096 };
        assert!(err.to_string().contains("4096"));

        let err = ProtocolError::UnexpectedEof { buffered: 7 };
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn test_error_classification() {
        assert!(ProtocolError::Eof.is_eof());
        assert!(ProtocolError::UnexpectedEof { buffered: 3 }.is_eof());
        assert!(!ProtocolError::EmbeddedNewline.is_eof());

        let json_err = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        assert!(ProtocolError::Body(json_err).is_recoverable());
        assert!(ProtocolError::CrcMismatch {
            expected: 1,
            actual: 2
        }
        .is_recoverable());

        let json_err = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        assert!(!ProtocolError::Json(json_err).is_recoverable());
        assert!(!ProtocolError::InvalidFrameMagic(*b"XXXX").is_recoverable());
    }
}
