use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Captured output is cut beyond this many bytes per stream.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Result of a shell command execution.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// SIGKILLs a process group when dropped, unless disarmed.
struct GroupKill {
    pgid: Option<Pid>,
}

impl GroupKill {
    fn disarm(mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }
}

/// Run `command` via `sh -c` in `dir`.
///
/// The shell runs in its own process group. On timeout, or when the returned
/// future is dropped before completion, the whole group is killed with
/// SIGKILL, so background children do not outlive the call.
pub async fn execute_shell(
    command: &str,
    dir: &Path,
    timeout_secs: u64,
) -> std::io::Result<ExecResult> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let group = GroupKill {
        pgid: child.id().map(|pid| Pid::from_raw(pid as i32)),
    };

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(out) = stdout.as_mut() {
            let _ = out.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(err) = stderr.as_mut() {
            let _ = err.read_to_end(&mut buf).await;
        }
        buf
    });

    let waited = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()).await;
    let (exit_code, timed_out) = match waited {
        Ok(status) => (status?.code(), false),
        Err(_) => {
            if let Some(pgid) = group.pgid {
                let _ = killpg(pgid, Signal::SIGKILL);
            }
            // Reap the child to prevent zombies.
            let _ = child.wait().await;
            (None, true)
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    group.disarm();

    Ok(ExecResult {
        stdout: lossy_truncated(&stdout),
        stderr: lossy_truncated(&stderr),
        exit_code,
        timed_out,
    })
}

fn lossy_truncated(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_OUTPUT_BYTES {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut text = String::from_utf8_lossy(&bytes[..MAX_OUTPUT_BYTES]).into_owned();
    text.push_str(&format!(
        "\n...[truncated {} bytes]",
        bytes.len() - MAX_OUTPUT_BYTES
    ));
    text
}
