//! Relay error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid backend URL: {0}")]
    InvalidBackendUrl(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
