//! Error types for dnsmapper.

use thiserror::Error;

/// Errors that can occur while configuring or running the mapper.
#[derive(Debug, Error)]
pub enum MapperError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// DNS protocol error (malformed zone names and the like)
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    /// HTTP client error talking to the aggregator
    #[error("Report error: {0}")]
    Report(#[from] reqwest::Error),

    /// A correlation token already has a live observation
    #[error("token {0} already has a live observation")]
    TokenInUse(String),
}
