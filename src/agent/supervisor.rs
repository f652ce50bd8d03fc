//! Orchestrator: owns the shared collaborators and supervises one tokio task
//! per agent.
//!
//! Every agent task follows the same lifecycle: seed history (compacting the
//! parent's history when the child inherits context), `start`, run the loop
//! under `catch_unwind`, then settle the terminal transition. Settling posts
//! the completion report to the parent through the registry.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;

use super::agent_loop::{AgentExit, run_agent};
use super::compactor::ContextCompactor;
use super::registry::{AgentRegistry, SpawnedAgent};
use super::state::AgentState;
use super::system_prompt::{PromptContext, build_system_prompt};
use super::types::{AgentId, AgentResult, AgentStatus, MessageSender};
use crate::config::AppConfig;
use crate::error::{AgentError, RegistryError};
use crate::gate::CompletionGate;
use crate::llm::ModelClient;
use crate::protocol::Message;
use crate::sandbox::SandboxExecutor;
use crate::telemetry::{RunEvent, Telemetry};

/// How long straggling agents get to reach a loop boundary after shutdown
/// before their tasks are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Loop limits shared by every agent.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_iterations: u64,
    pub model_max_retries: u32,
    /// Delay before the second model attempt; doubles per attempt.
    pub model_retry_backoff: Duration,
    pub waiting_timeout: Duration,
    pub whitebox: bool,
}

impl LoopSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            model_max_retries: config.model_max_retries,
            model_retry_backoff: Duration::from_secs(2),
            waiting_timeout: config.waiting_timeout,
            whitebox: config.whitebox,
        }
    }
}

/// Collaborators handed to [`Orchestrator::new`].
pub struct OrchestratorParts {
    pub registry: AgentRegistry,
    pub model: Arc<dyn ModelClient>,
    pub executor: Arc<SandboxExecutor>,
    pub compactor: ContextCompactor,
    pub gate: CompletionGate,
    pub telemetry: Arc<dyn Telemetry>,
    pub settings: LoopSettings,
    pub operator_prompt: Option<String>,
}

/// Final state of the root agent.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub root_id: AgentId,
    pub status: AgentStatus,
    pub result: Option<AgentResult>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == AgentStatus::Finished
    }
}

/// What a newly launched agent starts from.
struct AgentSeed {
    name: String,
    task: String,
    parent_id: Option<AgentId>,
    skills: Vec<String>,
    /// Parent history to compact into the child's first message.
    inherited: Option<Vec<Message>>,
}

struct Inner {
    registry: AgentRegistry,
    model: Arc<dyn ModelClient>,
    executor: Arc<SandboxExecutor>,
    compactor: ContextCompactor,
    gate: CompletionGate,
    telemetry: Arc<dyn Telemetry>,
    settings: LoopSettings,
    operator_prompt: Option<String>,
    children: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: parts.registry,
                model: parts.model,
                executor: parts.executor,
                compactor: parts.compactor,
                gate: parts.gate,
                telemetry: parts.telemetry,
                settings: parts.settings,
                operator_prompt: parts.operator_prompt,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    pub(crate) fn model(&self) -> &dyn ModelClient {
        self.inner.model.as_ref()
    }

    pub(crate) fn executor(&self) -> &SandboxExecutor {
        &self.inner.executor
    }

    pub(crate) fn gate(&self) -> &CompletionGate {
        &self.inner.gate
    }

    pub(crate) fn telemetry(&self) -> &dyn Telemetry {
        self.inner.telemetry.as_ref()
    }

    pub(crate) fn settings(&self) -> &LoopSettings {
        &self.inner.settings
    }

    /// Run a root agent on `task` until it reaches a terminal status, then
    /// stop whatever is still running.
    pub async fn run(&self, task: &str) -> Result<RunOutcome, AgentError> {
        let spawned = self.inner.registry.spawn(None, "Root Agent", task, Vec::new())?;
        let root_id = spawned.id.clone();
        self.record_created(&root_id, "Root Agent", None, task);

        let seed = AgentSeed {
            name: "Root Agent".to_string(),
            task: task.to_string(),
            parent_id: None,
            skills: Vec::new(),
            inherited: None,
        };
        let this = self.clone();
        let root = tokio::spawn(async move { this.drive(spawned, seed).await });
        if let Err(e) = root.await {
            tracing::error!(agent_id = %root_id, error = %e, "Root agent task did not complete");
        }

        self.shutdown().await;

        let node = self
            .inner
            .registry
            .snapshot(&root_id)
            .ok_or_else(|| RegistryError::UnknownAgent(root_id.clone()))?;
        self.inner.telemetry.record(RunEvent::RunEnd {
            outcome: node.status.to_string(),
        });
        Ok(RunOutcome {
            root_id,
            status: node.status,
            result: node.result,
        })
    }

    /// Register a child of `parent` and start it in the background.
    ///
    /// Context compaction runs inside the child's task, so this returns as
    /// soon as the node exists.
    pub(crate) fn spawn_child(
        &self,
        parent: &AgentState,
        name: &str,
        task: &str,
        skills: Vec<String>,
        inherit_context: bool,
    ) -> Result<AgentId, RegistryError> {
        let spawned =
            self.inner
                .registry
                .spawn(Some(parent.agent_id.as_str()), name, task, skills.clone())?;
        let id = spawned.id.clone();
        self.record_created(&id, name, Some(&parent.agent_id), task);

        let seed = AgentSeed {
            name: name.to_string(),
            task: task.to_string(),
            parent_id: Some(parent.agent_id.clone()),
            skills,
            inherited: inherit_context.then(|| parent.messages().to_vec()),
        };
        let this = self.clone();
        let handle = tokio::spawn(async move { this.drive(spawned, seed).await });
        self.lock_children().push(handle);
        Ok(id)
    }

    /// Post an operator message to an agent.
    pub fn post_user_message(&self, agent_id: &str, content: &str) -> Result<(), RegistryError> {
        self.inner
            .registry
            .post_message(MessageSender::User, agent_id, content)
    }

    /// Cancel every agent and wait (bounded) for their tasks to exit.
    pub async fn shutdown(&self) {
        self.inner.registry.shutdown_all();
        let handles: Vec<JoinHandle<()>> = self.lock_children().drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                tracing::warn!("Agent task did not stop within grace period; aborting");
                handle.abort();
            }
        }
    }

    fn lock_children(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.inner.children.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record_created(&self, agent_id: &str, name: &str, parent_id: Option<&str>, task: &str) {
        self.inner.telemetry.record(RunEvent::AgentCreated {
            agent_id: agent_id.to_string(),
            name: name.to_string(),
            parent_id: parent_id.map(str::to_string),
            task: task.to_string(),
        });
    }

    pub(crate) fn record_status(&self, agent_id: &str, status: AgentStatus, detail: Option<&str>) {
        self.inner.telemetry.record(RunEvent::AgentStatus {
            agent_id: agent_id.to_string(),
            status: status.to_string(),
            detail: detail.map(str::to_string),
        });
    }

    async fn drive(self, spawned: SpawnedAgent, seed: AgentSeed) {
        let SpawnedAgent {
            id,
            mut mailbox,
            stop,
        } = spawned;

        let mut state = AgentState::new(id.clone(), seed.name, seed.parent_id, seed.task, stop);
        if let Some(parent_history) = seed.inherited {
            let inherited = self
                .inner
                .compactor
                .compact(&parent_history, &state.task)
                .await;
            state.extend_messages(inherited.into_messages());
        }
        state.add_message(Message::user(task_message(&state.task)));

        if let Err(e) = self.inner.registry.start(&id) {
            tracing::warn!(agent_id = %id, error = %e, "Agent could not start");
            self.settle(&id, Err(AgentError::Stopped));
            return;
        }
        self.record_status(&id, AgentStatus::Running, None);
        self.inner.executor.register_agent(&id).await;

        let system_prompt = build_system_prompt(&PromptContext {
            agent_id: &id,
            name: &state.name,
            parent_id: state.parent_id.as_deref(),
            skills: &seed.skills,
            whitebox: self.inner.settings.whitebox,
            operator_prompt: self.inner.operator_prompt.as_deref(),
        });

        tracing::info!(agent_id = %id, name = %state.name, "Agent started");
        let outcome = AssertUnwindSafe(run_agent(&self, &mut state, &mut mailbox, &system_prompt))
            .catch_unwind()
            .await;

        let outcome = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(agent_id = %id, panic = %message, "Agent loop panicked");
                self.fail(&id, "Agent crashed", &format!("agent loop panicked: {message}"));
                return;
            }
        };
        self.settle(&id, outcome);
    }

    fn settle(&self, id: &str, outcome: Result<AgentExit, AgentError>) {
        match outcome {
            Ok(AgentExit::Finished { summary }) => {
                tracing::info!(agent_id = id, "Agent finished");
                match self.inner.registry.finish(id, &summary) {
                    Ok(()) => self.record_status(id, AgentStatus::Finished, Some(&summary)),
                    Err(e) => tracing::warn!(agent_id = id, error = %e, "Finish transition rejected"),
                }
            }
            Ok(AgentExit::Failed { summary }) => {
                self.fail(id, &summary, "agent reported its task as unsuccessful");
            }
            Err(e) => {
                tracing::warn!(agent_id = id, error = %e, "Agent failed");
                let summary = match &e {
                    AgentError::Stopped => "Agent was stopped before completing its task",
                    _ => "Agent terminated with an error",
                };
                self.fail(id, summary, &e.to_string());
            }
        }
    }

    fn fail(&self, id: &str, summary: &str, error: &str) {
        match self.inner.registry.fail(id, summary, error) {
            Ok(()) => self.record_status(id, AgentStatus::Failed, Some(error)),
            Err(e) => tracing::warn!(agent_id = id, error = %e, "Fail transition rejected"),
        }
    }
}

fn task_message(task: &str) -> String {
    format!("<task>\n{task}\n</task>")
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_rendered() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }

    #[test]
    fn task_is_wrapped() {
        assert_eq!(task_message("scan it"), "<task>\nscan it\n</task>");
    }
}
