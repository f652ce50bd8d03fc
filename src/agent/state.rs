//! Per-agent session state, owned by the task running the agent.

use tokio_util::sync::CancellationToken;

use super::types::{AgentId, WaitReason};
use crate::protocol::Message;

#[derive(Debug)]
pub struct AgentState {
    pub agent_id: AgentId,
    pub name: String,
    pub parent_id: Option<AgentId>,
    pub task: String,
    messages: Vec<Message>,
    stop: CancellationToken,
    waiting: Option<WaitReason>,
    iteration: u64,
    last_model_error: Option<String>,
}

impl AgentState {
    pub fn new(
        agent_id: AgentId,
        name: impl Into<String>,
        parent_id: Option<AgentId>,
        task: impl Into<String>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            agent_id,
            name: name.into(),
            parent_id,
            task: task.into(),
            messages: Vec::new(),
            stop,
            waiting: None,
            iteration: 0,
            last_model_error: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn extend_messages(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn waiting(&self) -> Option<WaitReason> {
        self.waiting
    }

    pub fn set_waiting(&mut self, reason: WaitReason) {
        self.waiting = Some(reason);
    }

    pub fn clear_waiting(&mut self) {
        self.waiting = None;
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Advance and return the iteration counter.
    pub fn next_iteration(&mut self) -> u64 {
        self.iteration += 1;
        self.iteration
    }

    pub fn last_model_error(&self) -> Option<&str> {
        self.last_model_error.as_deref()
    }

    pub fn set_last_model_error(&mut self, error: Option<String>) {
        self.last_model_error = error;
    }
}
