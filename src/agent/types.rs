//! Shared vocabulary of the agent graph.
//!
//! These types flow between the [`super::registry::AgentRegistry`], the
//! agent loop, the agent-graph tools and the completion gate. Nodes derive
//! [`serde::Serialize`] so they can be returned in tool observations.

use std::fmt;

use serde::Serialize;

/// Agent identifier, e.g. `agent_3f2a91c0`.
pub type AgentId = String;

/// Lifecycle status of an agent.
///
/// `queued`, `running`, `waiting` and `stopping` are active; `finished` and
/// `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Queued,
    Running,
    Waiting,
    Stopping,
    Finished,
    Failed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Queued => "queued",
            AgentStatus::Running => "running",
            AgentStatus::Waiting => "waiting",
            AgentStatus::Stopping => "stopping",
            AgentStatus::Finished => "finished",
            AgentStatus::Failed => "failed",
        }
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Finished | AgentStatus::Failed)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded when an agent reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentResult {
    pub success: bool,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot of one node in the agent forest.
#[derive(Debug, Clone, Serialize)]
pub struct AgentNode {
    pub id: AgentId,
    pub name: String,
    pub task: String,
    pub status: AgentStatus,
    /// `None` only for the root.
    pub parent_id: Option<AgentId>,
    /// Root = 0.
    pub depth: usize,
    pub skills: Vec<String>,
    /// RFC 3339.
    pub created_at: String,
    pub finished_at: Option<String>,
    pub result: Option<AgentResult>,
}

/// Who posted a mailbox message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSender {
    /// The operator driving the run.
    User,
    Agent(AgentId),
}

impl MessageSender {
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            MessageSender::User => None,
            MessageSender::Agent(id) => Some(id),
        }
    }
}

/// An entry in an agent's mailbox. `content` is already rendered for the
/// recipient's history.
#[derive(Debug, Clone)]
pub struct MailboxMessage {
    pub sender: MessageSender,
    pub content: String,
}

/// Why an agent is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// Any incoming message resumes the agent.
    Plain,
    /// Entered after exhausting model retries; only the user, the agent
    /// itself or its parent may resume it.
    ModelFailure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_and_terminal_partition_statuses() {
        let all = [
            AgentStatus::Queued,
            AgentStatus::Running,
            AgentStatus::Waiting,
            AgentStatus::Stopping,
            AgentStatus::Finished,
            AgentStatus::Failed,
        ];
        let active: Vec<_> = all.iter().filter(|s| s.is_active()).collect();
        assert_eq!(active.len(), 4);
        for s in all {
            assert_ne!(s.is_active(), s.is_terminal());
        }
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(AgentStatus::Stopping).unwrap(),
            serde_json::json!("stopping")
        );
    }
}
