//! Error types for the connection supervisor

use std::path::PathBuf;

use thiserror::Error;

use crate::event::ConnectionState;

/// Result type alias for supervisor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while supervising a connection
#[derive(Debug, Error)]
pub enum Error {
    /// The process does not hold administrative privileges
    #[error("administrator privileges are required")]
    NotElevated,

    /// A helper binary is missing from the resource directory
    #[error("helper binary not found: {0}")]
    MissingBinary(PathBuf),

    /// The server host did not resolve to an IPv4 address
    #[error("could not resolve server host '{0}' to an IPv4 address")]
    DnsResolutionFailed(String),

    /// No usable default route exists
    #[error("default gateway could not be determined")]
    DefaultGatewayUnknown,

    /// The tunnel client never opened its local SOCKS5 port
    #[error("SOCKS proxy did not start in time")]
    SocksPortTimeout,

    /// The TUN interface never appeared after starting the router
    #[error("TUN interface did not appear in time")]
    TunInterfaceMissing,

    /// A helper process exited while it was still needed
    #[error("helper process {name} exited with code {code:?}")]
    HelperProcessExited {
        name: &'static str,
        code: Option<i32>,
    },

    /// The SOCKS5 exchange with the tunnel client failed
    #[error("SOCKS5 handshake failed: {0}")]
    SocksHandshakeFailed(String),

    /// An OS binding operation failed
    #[error(transparent)]
    Os(#[from] ptun_os::Error),

    /// The DNS forwarder failed
    #[error(transparent)]
    Forwarder(#[from] ptun_dns::Error),

    /// A configuration snapshot failed validation
    #[error("invalid configuration: {}", .0.join("; "))]
    ConfigInvalid(Vec<String>),

    /// The requested transition is not legal from the current state
    #[error("cannot {action} while {state}")]
    AlreadyInState {
        state: ConnectionState,
        action: &'static str,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted-document (de)serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether a fast restart of the helper processes can plausibly clear
    /// this error without tearing the session down.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::SocksPortTimeout
                | Error::SocksHandshakeFailed(_)
                | Error::HelperProcessExited { .. }
        )
    }
}
