//! Shared helper for running netsh-style configuration commands

use std::process::Output;

use tokio::process::Command;

use crate::error::{Error, Result};

/// Build a command that never pops a console window on Windows.
pub fn quiet_command(program: &str) -> Command {
    let cmd = Command::new(program);
    #[cfg(windows)]
    let cmd = {
        let mut cmd = cmd;
        // CREATE_NO_WINDOW
        cmd.creation_flags(0x0800_0000);
        cmd
    };
    cmd
}

/// Run a command to completion, failing on a non-zero exit status.
///
/// `op` is a short human-readable label used in error messages and logs.
pub async fn run_checked(op: &str, program: &str, args: &[&str]) -> Result<String> {
    let output = run_raw(op, program, args).await?;
    if !output.status.success() {
        return Err(Error::from_output(op, &output));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a command and hand back the raw output regardless of exit status.
pub async fn run_raw(op: &str, program: &str, args: &[&str]) -> Result<Output> {
    log::debug!("{}: {} {}", op, program, args.join(" "));
    let mut cmd = quiet_command(program);
    cmd.args(args);
    cmd.output()
        .await
        .map_err(|e| Error::Command {
            op: op.to_string(),
            code: -1,
            detail: format!("failed to launch {}: {}", program, e),
        })
}
