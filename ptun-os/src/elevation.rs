//! Elevation detection and self-relaunch

use crate::error::Result;

/// Check whether the current process holds administrative privileges.
#[cfg(windows)]
pub fn is_elevated() -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::Security::{
        GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
    };
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    unsafe {
        let mut token: HANDLE = std::ptr::null_mut();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
            return false;
        }

        let mut elevation = TOKEN_ELEVATION { TokenIsElevated: 0 };
        let mut len: u32 = 0;
        let ok = GetTokenInformation(
            token,
            TokenElevation,
            &mut elevation as *mut _ as *mut _,
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut len,
        );
        CloseHandle(token);

        ok != 0 && elevation.TokenIsElevated != 0
    }
}

#[cfg(not(windows))]
pub fn is_elevated() -> bool {
    // SAFETY: geteuid has no failure modes
    unsafe { libc::geteuid() == 0 }
}

/// Relaunch the current executable elevated, passing argv through.
///
/// On success the caller is expected to exit; the elevated process takes
/// over the single-instance guard.
pub fn relaunch_elevated() -> Result<()> {
    use crate::error::Error;

    let exe = std::env::current_exe()
        .map_err(|e| Error::PermissionDenied(format!("cannot locate own executable: {}", e)))?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    #[cfg(windows)]
    {
        let arg_list = args.join(" ").replace('\'', "''");
        let script = format!(
            "Start-Process -FilePath '{}' -ArgumentList '{}' -Verb RunAs",
            exe.display(),
            arg_list
        );
        let status = std::process::Command::new("powershell")
            .args(["-NoProfile", "-Command", &script])
            .status()
            .map_err(|e| Error::PermissionDenied(format!("elevation request failed: {}", e)))?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::PermissionDenied(
                "elevation was declined or failed".into(),
            ))
        }
    }

    #[cfg(not(windows))]
    {
        let _ = (exe, args);
        Err(Error::NotSupported(
            "elevated relaunch is only implemented for Windows".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_elevated_does_not_panic() {
        let _ = is_elevated();
    }
}
