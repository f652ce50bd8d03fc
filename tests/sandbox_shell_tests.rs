use std::time::{Duration, Instant};

use serde_json::Value;
use tempfile::TempDir;

use agentmesh::sandbox::{SandboxWorker, execute_shell};
use agentmesh::tools::SandboxCommand;

// ─── Helper ───────────────────────────────────────────────────────────

fn setup_workspace() -> TempDir {
    tempfile::tempdir().expect("failed to create temp dir")
}

/// Whether `pid` is a live (non-zombie) process.
fn alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // The state field follows the parenthesised command name.
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| !rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}

async fn shell(worker: &SandboxWorker, command: &str, timeout_secs: Option<u64>) -> Value {
    let out = worker
        .execute(SandboxCommand::ShellExec {
            command: command.into(),
            timeout_secs,
        })
        .await
        .unwrap();
    serde_json::from_str(&out).unwrap()
}

// ============================================================
// Shell runner
// ============================================================

#[tokio::test]
async fn test_exit_code_and_streams_are_captured() {
    let ws = setup_workspace();
    let result = execute_shell("echo out; echo err >&2; exit 3", ws.path(), 5)
        .await
        .unwrap();
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "err\n");
    assert_eq!(result.exit_code, Some(3));
    assert!(!result.timed_out);
}

#[tokio::test]
async fn test_large_output_is_truncated() {
    let ws = setup_workspace();
    let result = execute_shell("head -c 200000 /dev/zero | tr '\\0' a", ws.path(), 10)
        .await
        .unwrap();
    assert!(result.stdout.len() < 200_000);
    assert!(result.stdout.contains("...[truncated"));
}

#[tokio::test]
async fn test_timeout_kills_background_children() {
    let ws = setup_workspace();
    let start = Instant::now();
    let result = execute_shell("sleep 60 & sleep 60 & wait", ws.path(), 1)
        .await
        .unwrap();

    assert!(result.timed_out);
    assert_eq!(result.exit_code, None);
    assert!(start.elapsed() < Duration::from_secs(5), "took {:?}", start.elapsed());
}

// ============================================================
// Worker tools
// ============================================================

#[tokio::test]
async fn test_shell_exec_runs_in_workspace_root() {
    let ws = setup_workspace();
    let worker = SandboxWorker::new(ws.path(), Duration::from_secs(5)).unwrap();

    let result = shell(&worker, "pwd", None).await;
    assert_eq!(
        result["stdout"].as_str().unwrap().trim(),
        worker.root().to_str().unwrap()
    );
    assert_eq!(result["exit_code"], 0);
}

#[tokio::test]
async fn test_shell_exec_honours_per_call_timeout() {
    let ws = setup_workspace();
    let worker = SandboxWorker::new(ws.path(), Duration::from_secs(60)).unwrap();

    let result = shell(&worker, "sleep 30", Some(1)).await;
    assert_eq!(result["timed_out"], true);
}

#[tokio::test]
async fn test_bounded_execution_reports_timeout() {
    let ws = setup_workspace();
    let worker = SandboxWorker::new(ws.path(), Duration::from_secs(60)).unwrap();

    let err = worker
        .execute_bounded(
            SandboxCommand::ShellExec {
                command: "sleep 30".into(),
                timeout_secs: None,
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Tool timed out after 1s");
}

#[tokio::test]
async fn test_hard_timeout_kills_background_children() {
    let ws = setup_workspace();
    let worker = SandboxWorker::new(ws.path(), Duration::from_secs(60)).unwrap();

    let err = worker
        .execute_bounded(
            SandboxCommand::ShellExec {
                command: "sleep 30 & echo $! > bg.pid; wait".into(),
                timeout_secs: None,
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Tool timed out after 1s");

    let pid: u32 = std::fs::read_to_string(worker.root().join("bg.pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(3);
    while alive(pid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!alive(pid), "background child {pid} outlived the hard timeout");
}

#[tokio::test]
async fn test_file_write_cannot_escape_workspace() {
    let ws = setup_workspace();
    let worker = SandboxWorker::new(&ws.path().join("inner"), Duration::from_secs(5)).unwrap();

    let out = worker
        .execute(SandboxCommand::FileWrite {
            path: "../escaped.txt".into(),
            content: "nope".into(),
        })
        .await
        .unwrap();
    let parsed: Value = serde_json::from_str(&out).unwrap();
    assert!(parsed["error"].as_str().unwrap().contains("file_write"));
    assert!(!ws.path().join("escaped.txt").exists());
}
