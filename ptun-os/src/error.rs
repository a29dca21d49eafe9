//! Error types for OS binding operations

use thiserror::Error;

/// Result type alias for OS binding operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while touching OS networking state
#[derive(Debug, Error)]
pub enum Error {
    /// A shell command (netsh, ipconfig, taskkill, ...) exited non-zero
    #[error("{op} failed with code {code}: {detail}")]
    Command {
        /// The operation that was attempted
        op: String,
        /// Exit code reported by the command
        code: i32,
        /// Captured stderr (or stdout when stderr was empty)
        detail: String,
    },

    /// Routing table error
    #[error("route error: {0}")]
    Route(String),

    /// Per-adapter DNS configuration error
    #[error("DNS configuration error: {0}")]
    Dns(String),

    /// Firewall rule error
    #[error("firewall error: {0}")]
    Firewall(String),

    /// Interface inventory error
    #[error("interface error: {0}")]
    Interface(String),

    /// Process control error
    #[error("process error: {0}")]
    Process(String),

    /// Operation requires privileges the process does not hold
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Operation is not available on this platform
    #[error("not supported: {0}")]
    NotSupported(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a `Command` error from a finished process
    pub fn from_output(op: impl Into<String>, output: &std::process::Output) -> Self {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stderr.trim().is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        Error::Command {
            op: op.into(),
            code: output.status.code().unwrap_or(-1),
            detail,
        }
    }
}
