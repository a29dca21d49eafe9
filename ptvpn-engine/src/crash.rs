//! Crash handling: single-instance guard and the global panic trap
//!
//! A leaked route or firewall rule is a user-visible failure, so even a
//! panicking process runs the full disconnect sequence — bounded by a hard
//! cap so a wedged OS call cannot keep the process alive forever.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::supervisor::VpnSupervisor;

/// Hard cap on emergency cleanup
pub const EMERGENCY_CLEANUP_CAP: Duration = Duration::from_secs(5);

/// Exit code for emergency shutdown and startup failure
pub const EXIT_FAILURE: i32 = 1;

#[cfg(windows)]
const MUTEX_NAME: &str = "Global\\PingTunnelVPN_SingleInstance";

/// System-wide single-instance guard
///
/// Windows uses a named mutex; elsewhere a lock file under the data
/// directory stands in. Dropping the guard releases it.
pub struct SingleInstance {
    #[cfg(windows)]
    handle: isize,
    #[cfg(not(windows))]
    lock_path: PathBuf,
}

// SAFETY: the mutex handle is only closed once, on drop
unsafe impl Send for SingleInstance {}

impl SingleInstance {
    /// Acquire the guard; fails when another instance already holds it
    #[cfg(windows)]
    pub fn acquire() -> Result<Self> {
        use windows_sys::Win32::Foundation::{GetLastError, ERROR_ALREADY_EXISTS};
        use windows_sys::Win32::System::Threading::CreateMutexW;

        let name: Vec<u16> = MUTEX_NAME.encode_utf16().chain(std::iter::once(0)).collect();
        // SAFETY: name is a valid NUL-terminated UTF-16 string
        let handle = unsafe { CreateMutexW(std::ptr::null(), 1, name.as_ptr()) };
        if handle.is_null() {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let already = unsafe { GetLastError() } == ERROR_ALREADY_EXISTS;
        if already {
            unsafe { windows_sys::Win32::Foundation::CloseHandle(handle) };
            return Err(Error::AlreadyInState {
                state: crate::event::ConnectionState::Disconnected,
                action: "start a second instance",
            });
        }
        Ok(Self {
            handle: handle as isize,
        })
    }

    #[cfg(not(windows))]
    pub fn acquire() -> Result<Self> {
        Self::acquire_at(crate::paths::data_dir().join("instance.lock"))
    }

    /// Lock-file variant with an explicit path (used by tests)
    #[cfg(not(windows))]
    pub fn acquire_at(lock_path: PathBuf) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut file) => {
                use std::io::Write;
                let _ = write!(file, "{}", std::process::id());
                Ok(Self { lock_path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::AlreadyInState {
                    state: crate::event::ConnectionState::Disconnected,
                    action: "start a second instance",
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for SingleInstance {
    fn drop(&mut self) {
        #[cfg(windows)]
        // SAFETY: handle came from CreateMutexW and is closed exactly once
        unsafe {
            windows_sys::Win32::Foundation::CloseHandle(self.handle as _);
        }
        #[cfg(not(windows))]
        {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

/// Install the one-shot panic trap
///
/// The first panic anywhere in the process writes the crash log, runs the
/// emergency disconnect with a hard cap, and exits with code 1. Later
/// panics fall through to the default behavior while the first one is
/// already shutting down.
pub fn install_panic_trap(supervisor: Arc<VpnSupervisor>, crash_log: PathBuf) {
    static TRIGGERED: AtomicBool = AtomicBool::new(false);

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);

        if TRIGGERED.swap(true, Ordering::SeqCst) {
            return;
        }

        write_crash_log(&crash_log, &info.to_string());

        let supervisor = supervisor.clone();
        // A fresh thread with its own runtime: the panicking thread may be
        // inside (or may BE) the main runtime
        let cleanup = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build();
            if let Ok(runtime) = runtime {
                runtime.block_on(supervisor.emergency_shutdown(EMERGENCY_CLEANUP_CAP));
            }
        });
        let _ = cleanup.join();
        std::process::exit(EXIT_FAILURE);
    }));
}

fn write_crash_log(path: &std::path::Path, message: &str) {
    let backtrace = std::backtrace::Backtrace::force_capture();
    let entry = format!(
        "==== {} ====\n{}\n{}\n",
        chrono::Utc::now().to_rfc3339(),
        message,
        backtrace
    );
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    use std::io::Write;
    if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
        let _ = file.write_all(entry.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(windows))]
    #[test]
    fn test_single_instance_excludes_second() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.lock");

        let first = SingleInstance::acquire_at(path.clone()).unwrap();
        assert!(SingleInstance::acquire_at(path.clone()).is_err());

        drop(first);
        let second = SingleInstance::acquire_at(path).unwrap();
        drop(second);
    }

    #[test]
    fn test_crash_log_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.log");
        write_crash_log(&path, "panic one");
        write_crash_log(&path, "panic two");
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("panic one"));
        assert!(content.contains("panic two"));
    }
}
