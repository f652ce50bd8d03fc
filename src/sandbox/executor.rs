use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};

use super::client::SandboxClient;
use super::worker::SandboxWorker;
use crate::error::{SandboxError, ToolError};
use crate::scope::ScopePolicy;
use crate::tools::SandboxCommand;

enum Backend {
    InProcess {
        worker: SandboxWorker,
        timeout: Duration,
    },
    Remote(SandboxClient),
}

/// Runs sandbox-bound commands for agents.
///
/// Every tool-level failure is folded into the returned observation; only
/// transport failures that survive the retry budget come back as `Err`.
pub struct SandboxExecutor {
    backend: Backend,
    scope: Arc<dyn ScopePolicy>,
}

impl SandboxExecutor {
    pub fn in_process(worker: SandboxWorker, timeout: Duration, scope: Arc<dyn ScopePolicy>) -> Self {
        Self {
            backend: Backend::InProcess { worker, timeout },
            scope,
        }
    }

    pub fn remote(client: SandboxClient, scope: Arc<dyn ScopePolicy>) -> Self {
        Self {
            backend: Backend::Remote(client),
            scope,
        }
    }

    /// Best-effort registration of a new agent with a remote worker.
    pub async fn register_agent(&self, agent_id: &str) {
        if let Backend::Remote(client) = &self.backend {
            if let Err(e) = client.register_agent(agent_id).await {
                tracing::warn!(agent_id, error = %e, "Sandbox agent registration failed");
            }
        }
    }

    pub async fn execute(&self, agent_id: &str, command: SandboxCommand) -> Result<String, SandboxError> {
        if let Some(target) = command.network_target() {
            if !self.scope.allows(target) {
                tracing::info!(agent_id, target, "Refused out-of-scope target");
                return Ok(error_observation(&ToolError::OutOfScope(target.to_string()).to_string()));
            }
        }

        match &self.backend {
            Backend::InProcess { worker, timeout } => {
                Ok(match worker.execute_bounded(command, *timeout).await {
                    Ok(result) => result,
                    Err(e) => error_observation(&e.to_string()),
                })
            }
            Backend::Remote(client) => {
                let name = command.name();
                let kwargs = command_kwargs(&command);
                Ok(match client.execute(agent_id, name, &kwargs).await? {
                    Ok(result) => result,
                    Err(e) => error_observation(&e),
                })
            }
        }
    }
}

pub(crate) fn error_observation(message: &str) -> String {
    json!({ "error": message }).to_string()
}

/// The command's arguments as the wire-level kwargs object.
fn command_kwargs(command: &SandboxCommand) -> Map<String, Value> {
    match serde_json::to_value(command) {
        Ok(Value::Object(mut tagged)) => match tagged.remove("args") {
            Some(Value::Object(args)) => args
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .collect(),
            _ => Map::new(),
        },
        _ => Map::new(),
    }
}
