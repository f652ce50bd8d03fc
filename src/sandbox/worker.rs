//! Execution of sandbox-bound tools inside the worker's workspace.
//!
//! Results are JSON strings the model reads directly. Failures that are the
//! model's to fix (missing file, path escape, unreachable URL) are returned
//! as `Ok` JSON with an `error` field; only infrastructure faults become
//! [`ToolError::Execution`].

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde_json::json;

use super::shell::execute_shell;
use crate::error::ToolError;
use crate::tools::SandboxCommand;

/// Response bodies are cut beyond this many characters.
const MAX_BODY_CHARS: usize = 20_000;

#[derive(Debug, Clone)]
pub struct SandboxWorker {
    /// Canonical (absolute, symlinks resolved) workspace root.
    root: PathBuf,
    default_shell_timeout: Duration,
    http: reqwest::Client,
}

impl SandboxWorker {
    /// Create a worker for `workspace`, creating the directory if needed.
    pub fn new(workspace: &Path, default_shell_timeout: Duration) -> std::io::Result<Self> {
        std::fs::create_dir_all(workspace)?;
        let root = std::fs::canonicalize(workspace)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(std::io::Error::other)?;
        Ok(Self {
            root,
            default_shell_timeout,
            http,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn execute(&self, command: SandboxCommand) -> Result<String, ToolError> {
        match command {
            SandboxCommand::ShellExec {
                command,
                timeout_secs,
            } => self.shell_exec(&command, timeout_secs).await,
            SandboxCommand::FileRead { path } => Ok(self.file_read(&path).await),
            SandboxCommand::FileWrite { path, content } => Ok(self.file_write(&path, &content).await),
            SandboxCommand::HttpRequest { url, method } => {
                Ok(self.http_request(&url, method.as_deref()).await)
            }
        }
    }

    /// Run `command` on a separate task bounded by `timeout`. Panics and
    /// aborts surface as [`ToolError::Unexpected`] / [`ToolError::Cancelled`].
    pub async fn execute_bounded(
        &self,
        command: SandboxCommand,
        timeout: Duration,
    ) -> Result<String, ToolError> {
        let worker = self.clone();
        let mut task = tokio::spawn(async move { worker.execute(command).await });

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) if join_err.is_cancelled() => Err(ToolError::Cancelled),
            Ok(Err(join_err)) => Err(ToolError::Unexpected(join_err.to_string())),
            Err(_) => {
                task.abort();
                Err(ToolError::Timeout(timeout.as_secs()))
            }
        }
    }

    async fn shell_exec(&self, command: &str, timeout_secs: Option<u64>) -> Result<String, ToolError> {
        let timeout = timeout_secs
            .filter(|t| *t > 0)
            .unwrap_or(self.default_shell_timeout.as_secs().max(1));
        let result = execute_shell(command, &self.root, timeout)
            .await
            .map_err(|e| ToolError::Execution(format!("shell_exec failed: {e}")))?;
        serde_json::to_string(&result).map_err(|e| ToolError::Unexpected(e.to_string()))
    }

    async fn file_read(&self, path: &str) -> String {
        let target = match self.confine(path) {
            Ok(p) => p,
            Err(msg) => return json!({ "error": format!("file_read: {msg}") }).to_string(),
        };
        match tokio::fs::read_to_string(&target).await {
            Ok(content) => content,
            Err(e) => json!({ "error": format!("file_read: {e}") }).to_string(),
        }
    }

    async fn file_write(&self, path: &str, content: &str) -> String {
        let target = match self.confine(path) {
            Ok(p) => p,
            Err(msg) => return json!({ "error": format!("file_write: {msg}") }).to_string(),
        };

        if let Some(parent) = target.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return json!({ "error": format!("file_write: failed to create directories: {e}") })
                    .to_string();
            }
        }

        // Re-check after directory creation: a symlinked parent could escape.
        let canonical_parent = match target.parent() {
            Some(parent) => match tokio::fs::canonicalize(parent).await {
                Ok(p) => p,
                Err(e) => {
                    return json!({ "error": format!("file_write: failed to resolve path: {e}") })
                        .to_string();
                }
            },
            None => return json!({ "error": "file_write: path has no parent directory" }).to_string(),
        };
        if !canonical_parent.starts_with(&self.root) {
            return json!({
                "error": format!("file_write: path '{path}' is outside the workspace directory")
            })
            .to_string();
        }

        match tokio::fs::write(&target, content).await {
            Ok(()) => json!({ "written_bytes": content.len(), "path": path }).to_string(),
            Err(e) => json!({ "error": format!("file_write: {e}") }).to_string(),
        }
    }

    async fn http_request(&self, url: &str, method: Option<&str>) -> String {
        let method = method.unwrap_or("GET").to_ascii_uppercase();
        let method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return json!({ "error": format!("http_request: invalid method '{method}'") })
                    .to_string();
            }
        };

        let response = match self.http.request(method, url).send().await {
            Ok(r) => r,
            Err(e) => return json!({ "error": format!("http_request: {e}") }).to_string(),
        };

        let status = response.status().as_u16();
        let headers: serde_json::Map<String, serde_json::Value> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    json!(String::from_utf8_lossy(v.as_bytes())),
                )
            })
            .collect();
        let body = response.text().await.unwrap_or_default();
        let truncated = body.chars().count() > MAX_BODY_CHARS;
        let body: String = body.chars().take(MAX_BODY_CHARS).collect();

        json!({
            "status": status,
            "headers": headers,
            "body": body,
            "truncated": truncated,
        })
        .to_string()
    }

    /// Resolve `path` against the workspace root, rejecting absolute paths
    /// and `..` escapes.
    fn confine(&self, path: &str) -> Result<PathBuf, String> {
        let relative = Path::new(path);
        let relative = if relative.is_absolute() {
            relative
                .strip_prefix(&self.root)
                .map_err(|_| format!("path '{path}' is outside the workspace directory"))?
        } else {
            relative
        };

        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !resolved.pop() || !resolved.starts_with(&self.root) {
                        return Err(format!("path '{path}' is outside the workspace directory"));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(format!("path '{path}' is outside the workspace directory"));
                }
            }
        }
        if !resolved.starts_with(&self.root) {
            return Err(format!("path '{path}' is outside the workspace directory"));
        }
        Ok(resolved)
    }
}
