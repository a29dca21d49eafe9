//! Well-known per-user filesystem locations

use std::path::PathBuf;

/// Directory name under the per-user data root
const PRODUCT_DIR: &str = "PingTunnelVPN";

/// Per-user data directory, created on first use
///
/// Falls back to the current directory when the platform reports no data
/// root (containers, stripped-down service accounts).
pub fn data_dir() -> PathBuf {
    let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join(PRODUCT_DIR)
}

/// Path of the recovery journal
pub fn journal_path() -> PathBuf {
    data_dir().join("state.json")
}

/// Path of the crash log
pub fn crash_log_path() -> PathBuf {
    data_dir().join("crash.log")
}

/// Directory the helper binaries ship in: next to our own executable
pub fn resource_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}
