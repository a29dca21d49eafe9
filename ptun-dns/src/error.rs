//! Error types for DNS forwarding

use thiserror::Error;

/// Result type alias for DNS forwarding operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while forwarding DNS queries
#[derive(Debug, Error)]
pub enum Error {
    /// DNS message error
    #[error("DNS error: {0}")]
    Dns(String),

    /// SOCKS5 exchange error
    #[error("SOCKS5 error: {0}")]
    Socks(String),

    /// Forwarder configuration error
    #[error("DNS forwarder configuration error: {0}")]
    Config(String),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
