//! Process control: spawn with captured output, tree-kill, orphan discovery
//!
//! Tree-kill goes through `taskkill /T` so grandchildren spawned by a helper
//! cannot outlive it. Orphan discovery only ever matches processes whose
//! image path lies inside the product's own resource directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::error::{Error, Result};
use crate::shell::{quiet_command, run_raw};

/// A running process discovered by image name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// OS process id
    pub pid: u32,
    /// Full path of the process image, when the OS reports one
    pub path: Option<PathBuf>,
}

/// Process enumeration and termination capability
#[async_trait]
pub trait ProcessOps: Send + Sync {
    /// List running processes whose image name equals `image`
    async fn list_by_image(&self, image: &str) -> Result<Vec<ProcessInfo>>;

    /// Kill a process tree rooted at `pid`
    async fn kill_tree(&self, pid: u32) -> Result<()>;
}

/// Spawn a child with piped stdout/stderr and no console window.
///
/// The child is configured with `kill_on_drop` so a panicking supervisor
/// cannot leak it.
pub fn spawn_captured(program: &Path, args: &[String]) -> Result<Child> {
    let mut cmd = quiet_command(&program.to_string_lossy());
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.spawn()
        .map_err(|e| Error::Process(format!("failed to spawn {}: {}", program.display(), e)))
}

/// Kill a child's process tree and wait for it, bounded by `wait`.
pub async fn terminate_tree(child: &mut Child, wait: Duration) -> Result<()> {
    let Some(pid) = child.id() else {
        // Already reaped
        return Ok(());
    };

    kill_tree_by_pid(pid).await?;

    match tokio::time::timeout(wait, child.wait()).await {
        Ok(Ok(status)) => {
            log::debug!("Process {} exited with {:?}", pid, status.code());
            Ok(())
        }
        Ok(Err(e)) => Err(Error::Process(format!("wait for {} failed: {}", pid, e))),
        Err(_) => {
            // Tree-kill did not land in time; fall back to a direct kill
            log::warn!("Process {} did not exit within {:?}, killing", pid, wait);
            child
                .kill()
                .await
                .map_err(|e| Error::Process(format!("kill of {} failed: {}", pid, e)))
        }
    }
}

/// Tree-kill by pid.
pub async fn kill_tree_by_pid(pid: u32) -> Result<()> {
    #[cfg(windows)]
    {
        let pid_arg = pid.to_string();
        let output = run_raw("taskkill", "taskkill", &["/PID", &pid_arg, "/T", "/F"]).await?;
        // Exit code 128 means the process was already gone
        if !output.status.success() && output.status.code() != Some(128) {
            return Err(Error::from_output("taskkill", &output));
        }
        Ok(())
    }

    #[cfg(not(windows))]
    {
        // SAFETY: plain signal send; an ESRCH result means the process is gone
        let rc = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(Error::Process(format!("kill({}) failed: {}", pid, err)));
            }
        }
        Ok(())
    }
}

/// Production process enumeration
pub struct NativeProcesses;

#[async_trait]
impl ProcessOps for NativeProcesses {
    async fn list_by_image(&self, image: &str) -> Result<Vec<ProcessInfo>> {
        let filter = format!("Name='{}'", image);
        let script = format!(
            "Get-CimInstance Win32_Process -Filter \"{}\" | ForEach-Object {{ \"$($_.ProcessId)|$($_.ExecutablePath)\" }}",
            filter
        );
        let output = run_raw(
            "list processes",
            "powershell",
            &["-NoProfile", "-Command", &script],
        )
        .await?;

        if !output.status.success() {
            return Ok(Vec::new());
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_process_list(&text))
    }

    async fn kill_tree(&self, pid: u32) -> Result<()> {
        kill_tree_by_pid(pid).await
    }
}

/// Parse `pid|path` lines emitted by the enumeration script
pub fn parse_process_list(output: &str) -> Vec<ProcessInfo> {
    let mut processes = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        let Some((pid_str, path_str)) = line.split_once('|') else {
            continue;
        };
        let Ok(pid) = pid_str.trim().parse::<u32>() else {
            continue;
        };
        let path = path_str.trim();
        processes.push(ProcessInfo {
            pid,
            path: if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            },
        });
    }
    processes
}

/// Kill every process in `candidates` whose image path lies under
/// `resource_dir`. Returns the number of processes killed.
///
/// Processes installed elsewhere are never touched, even when the image name
/// matches.
pub async fn kill_orphans_under(
    ops: &dyn ProcessOps,
    resource_dir: &Path,
    images: &[&str],
) -> usize {
    let mut killed = 0;
    for image in images {
        let found = match ops.list_by_image(image).await {
            Ok(list) => list,
            Err(e) => {
                log::debug!("Orphan scan for {} failed: {}", image, e);
                continue;
            }
        };
        for info in found {
            if !path_is_under(info.path.as_deref(), resource_dir) {
                continue;
            }
            log::warn!("Killing orphaned helper {} (pid {})", image, info.pid);
            match ops.kill_tree(info.pid).await {
                Ok(()) => killed += 1,
                Err(e) => log::warn!("Failed to kill orphan {}: {}", info.pid, e),
            }
        }
    }
    killed
}

fn path_is_under(path: Option<&Path>, dir: &Path) -> bool {
    path.is_some_and(|p| p.starts_with(dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_process_list() {
        let text = "1234|C:\\ProgramData\\PingTunnelVPN\\bin\\pingtunnel.exe\r\n777|\r\nnot-a-line\r\n";
        let processes = parse_process_list(text);
        assert_eq!(processes.len(), 2);
        assert_eq!(processes[0].pid, 1234);
        assert!(processes[0]
            .path
            .as_ref()
            .unwrap()
            .ends_with("pingtunnel.exe"));
        assert_eq!(processes[1].pid, 777);
        assert!(processes[1].path.is_none());
    }

    #[test]
    fn test_path_is_under() {
        let dir = Path::new("/opt/ptvpn/bin");
        assert!(path_is_under(
            Some(Path::new("/opt/ptvpn/bin/tun2socks")),
            dir
        ));
        assert!(!path_is_under(Some(Path::new("/usr/bin/tun2socks")), dir));
        assert!(!path_is_under(None, dir));
    }
}
