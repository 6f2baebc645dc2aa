//! Registry error types.

use thiserror::Error;

/// Registry client and server errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid registry url {0:?}")]
    InvalidUrl(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("request build error: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("registry responded with status {0}")]
    Status(u16),

    #[error("registry request timed out")]
    Timeout,
}
