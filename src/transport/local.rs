//! Local execution via tokio child processes.

use super::{ExecOptions, ExecOutput};
use crate::core::error::{Error, Result};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Execute a shell script locally via `bash`.
/// Uses bash (not sh/dash) because recipe commands may use `set -o pipefail`.
pub async fn exec_local(
    script: &str,
    opts: &ExecOptions,
    cancel: &CancellationToken,
) -> Result<ExecOutput> {
    let mut cmd = Command::new("bash");
    cmd.stdin(Stdio::piped());
    configure(&mut cmd, opts);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::action("exec", format!("failed to spawn bash: {}", e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|e| Error::action("exec", format!("stdin write error: {}", e)))?;
    }

    wait(child, cancel).await
}

/// Run a program with arguments, no shell involved.
pub async fn run_program(
    program: &str,
    args: &[String],
    opts: &ExecOptions,
    cancel: &CancellationToken,
) -> Result<ExecOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null());
    configure(&mut cmd, opts);

    let child = cmd
        .spawn()
        .map_err(|e| Error::action("exec", format!("failed to spawn {}: {}", program, e)))?;
    wait(child, cancel).await
}

fn configure(cmd: &mut Command, opts: &ExecOptions) {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &opts.env {
        cmd.env(key, value);
    }
}

async fn wait(child: tokio::process::Child, cancel: &CancellationToken) -> Result<ExecOutput> {
    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        out = child.wait_with_output() => {
            out.map_err(|e| Error::action("exec", format!("wait error: {}", e)))?
        }
    };

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}
