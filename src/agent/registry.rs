//! Central registry for the agent forest.
//!
//! [`AgentRegistry`] is the single source of truth for agent nodes, parent
//! edges, statuses, mailboxes and stop tokens. It wraps its state in
//! `Arc<Mutex<..>>` and is cloned into every component that needs it; every
//! mutation goes through one lock.
//!
//! **Cancellation model:** each agent owns a [`CancellationToken`] derived
//! from the registry's root token. `request_stop` cancels only that agent's
//! token; `shutdown_all` cancels the root and with it every agent. The token
//! is advisory: the agent loop checks it at turn boundaries.
//!
//! **Mailboxes:** operator and inter-agent messages travel over a bounded
//! channel and are refused when it is full. Completion reports travel over
//! a separate unbounded channel so a terminal transition always reaches the
//! parent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::mpsc::{
    self, Receiver, Sender, UnboundedReceiver, UnboundedSender, error::TryRecvError,
    error::TrySendError,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::types::{
    AgentId, AgentNode, AgentResult, AgentStatus, MailboxMessage, MessageSender, WaitReason,
};
use crate::error::RegistryError;

/// Structural limits enforced on spawn.
#[derive(Debug, Clone, Copy)]
pub struct RegistryLimits {
    pub max_agents: usize,
    pub max_depth: usize,
    pub mailbox_capacity: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_agents: 50,
            max_depth: 5,
            mailbox_capacity: 64,
        }
    }
}

/// Receiving end of an agent's mailbox. Completion reports are always
/// handed out before ordinary messages.
#[derive(Debug)]
pub struct Mailbox {
    reports: UnboundedReceiver<MailboxMessage>,
    messages: Receiver<MailboxMessage>,
}

impl Mailbox {
    /// Next queued message without waiting.
    pub fn try_recv(&mut self) -> Option<MailboxMessage> {
        match self.reports.try_recv() {
            Ok(report) => return Some(report),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }
        self.messages.try_recv().ok()
    }

    /// Wait for the next message. `None` once both channels are closed.
    pub async fn recv(&mut self) -> Option<MailboxMessage> {
        tokio::select! {
            biased;
            Some(report) = self.reports.recv() => Some(report),
            Some(message) = self.messages.recv() => Some(message),
            else => None,
        }
    }
}

/// Handles returned to the caller of [`AgentRegistry::spawn`]; the new
/// agent's task owns them.
#[derive(Debug)]
pub struct SpawnedAgent {
    pub id: AgentId,
    pub mailbox: Mailbox,
    pub stop: CancellationToken,
}

struct AgentEntry {
    node: AgentNode,
    mailbox: Sender<MailboxMessage>,
    reports: UnboundedSender<MailboxMessage>,
    stop: CancellationToken,
    wait_reason: Option<WaitReason>,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<AgentId, AgentEntry>,
    /// Creation order, for stable listings.
    order: Vec<AgentId>,
    root: Option<AgentId>,
}

#[derive(Clone)]
pub struct AgentRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    root_token: CancellationToken,
    limits: RegistryLimits,
}

fn invalid(agent_id: &str, from: AgentStatus, to: AgentStatus) -> RegistryError {
    RegistryError::InvalidTransition {
        agent_id: agent_id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

fn new_agent_id() -> AgentId {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("agent_{}", &uuid[..8])
}

impl AgentRegistry {
    pub fn new(limits: RegistryLimits, root_token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            root_token,
            limits,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create a queued node under `parent_id` (or the root when `None`).
    pub fn spawn(
        &self,
        parent_id: Option<&str>,
        name: &str,
        task: &str,
        skills: Vec<String>,
    ) -> Result<SpawnedAgent, RegistryError> {
        let mut inner = self.lock();

        let depth = match parent_id {
            Some(pid) => match inner.entries.get(pid) {
                Some(parent) => parent.node.depth + 1,
                None => return Err(RegistryError::ParentNotFound(pid.to_string())),
            },
            None => {
                if let Some(root) = &inner.root {
                    return Err(RegistryError::RootAlreadyExists(root.clone()));
                }
                0
            }
        };

        if inner.entries.len() >= self.limits.max_agents {
            return Err(RegistryError::TooManyAgents {
                current: inner.entries.len(),
                max: self.limits.max_agents,
            });
        }
        if depth > self.limits.max_depth {
            return Err(RegistryError::TooDeep {
                depth,
                max: self.limits.max_depth,
            });
        }

        let mut id = new_agent_id();
        while inner.entries.contains_key(&id) {
            id = new_agent_id();
        }

        let (tx, rx) = mpsc::channel(self.limits.mailbox_capacity.max(1));
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let stop = self.root_token.child_token();
        let node = AgentNode {
            id: id.clone(),
            name: name.to_string(),
            task: task.to_string(),
            status: AgentStatus::Queued,
            parent_id: parent_id.map(str::to_string),
            depth,
            skills,
            created_at: Utc::now().to_rfc3339(),
            finished_at: None,
            result: None,
        };

        inner.entries.insert(
            id.clone(),
            AgentEntry {
                node,
                mailbox: tx,
                reports: report_tx,
                stop: stop.clone(),
                wait_reason: None,
            },
        );
        inner.order.push(id.clone());
        if parent_id.is_none() {
            inner.root = Some(id.clone());
        }

        tracing::debug!(agent_id = %id, parent_id = ?parent_id, name, depth, "Agent registered");
        Ok(SpawnedAgent {
            id,
            mailbox: Mailbox {
                reports: report_rx,
                messages: rx,
            },
            stop,
        })
    }

    /// queued -> running
    pub fn start(&self, agent_id: &str) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let entry = entry_mut(&mut inner, agent_id)?;
        match entry.node.status {
            AgentStatus::Queued => {
                entry.node.status = AgentStatus::Running;
                Ok(())
            }
            other => Err(invalid(agent_id, other, AgentStatus::Running)),
        }
    }

    /// Ask an agent to stop at its next loop boundary.
    pub fn request_stop(&self, agent_id: &str) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let entry = entry_mut(&mut inner, agent_id)?;
        if entry.node.status.is_terminal() {
            return Err(invalid(agent_id, entry.node.status, AgentStatus::Stopping));
        }
        entry.node.status = AgentStatus::Stopping;
        entry.stop.cancel();
        Ok(())
    }

    /// running -> waiting
    pub fn enter_waiting(
        &self,
        agent_id: &str,
        caused_by_model_failure: bool,
    ) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let entry = entry_mut(&mut inner, agent_id)?;
        if entry.node.status != AgentStatus::Running {
            return Err(invalid(agent_id, entry.node.status, AgentStatus::Waiting));
        }
        entry.node.status = AgentStatus::Waiting;
        entry.wait_reason = Some(if caused_by_model_failure {
            WaitReason::ModelFailure
        } else {
            WaitReason::Plain
        });
        Ok(())
    }

    /// waiting -> running
    pub fn resume(&self, agent_id: &str) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let entry = entry_mut(&mut inner, agent_id)?;
        if entry.node.status != AgentStatus::Waiting {
            return Err(invalid(agent_id, entry.node.status, AgentStatus::Running));
        }
        entry.node.status = AgentStatus::Running;
        entry.wait_reason = None;
        Ok(())
    }

    /// Whether a message from `sender` may resume `agent_id`.
    ///
    /// After a model failure only the user, the agent itself or its parent
    /// can resume it (any agent, for the root); plain waits resume on any
    /// message.
    pub fn should_resume(&self, agent_id: &str, sender: &MessageSender) -> bool {
        let inner = self.lock();
        let Some(entry) = inner.entries.get(agent_id) else {
            return false;
        };
        match entry.wait_reason {
            Some(WaitReason::ModelFailure) => match sender {
                MessageSender::User => true,
                MessageSender::Agent(from) => match entry.node.parent_id.as_deref() {
                    // The root has no parent; its children are the only agents that can reach it.
                    None => true,
                    Some(parent) => from == agent_id || parent == from.as_str(),
                },
            },
            Some(WaitReason::Plain) | None => true,
        }
    }

    pub fn wait_reason(&self, agent_id: &str) -> Option<WaitReason> {
        self.lock().entries.get(agent_id).and_then(|e| e.wait_reason)
    }

    /// running/stopping -> finished, reporting to the parent.
    pub fn finish(&self, agent_id: &str, summary: &str) -> Result<(), RegistryError> {
        self.terminate(
            agent_id,
            AgentResult {
                success: true,
                summary: summary.to_string(),
                error: None,
            },
        )
    }

    /// Any active status -> failed, reporting to the parent.
    pub fn fail(&self, agent_id: &str, summary: &str, error: &str) -> Result<(), RegistryError> {
        self.terminate(
            agent_id,
            AgentResult {
                success: false,
                summary: summary.to_string(),
                error: Some(error.to_string()),
            },
        )
    }

    fn terminate(&self, agent_id: &str, result: AgentResult) -> Result<(), RegistryError> {
        let target = if result.success {
            AgentStatus::Finished
        } else {
            AgentStatus::Failed
        };

        let mut inner = self.lock();
        let entry = entry_mut(&mut inner, agent_id)?;
        let allowed = match target {
            AgentStatus::Finished => {
                matches!(entry.node.status, AgentStatus::Running | AgentStatus::Stopping)
            }
            _ => entry.node.status.is_active(),
        };
        if !allowed {
            return Err(invalid(agent_id, entry.node.status, target));
        }

        entry.node.status = target;
        entry.node.finished_at = Some(Utc::now().to_rfc3339());
        entry.wait_reason = None;
        let report = completion_report(&entry.node, &result);
        entry.node.result = Some(result);
        let parent_id = entry.node.parent_id.clone();

        if let Some(parent_id) = parent_id {
            if let Some(parent) = inner.entries.get(&parent_id) {
                let message = MailboxMessage {
                    sender: MessageSender::Agent(agent_id.to_string()),
                    content: report,
                };
                // Only fails once the parent's task has dropped its mailbox.
                if parent.reports.send(message).is_err() {
                    tracing::warn!(agent_id, parent_id = %parent_id, "Parent mailbox closed; completion report dropped");
                }
            }
        }
        Ok(())
    }

    /// Deliver a message to `to`'s mailbox. It is observed at the
    /// recipient's next poll point.
    pub fn post_message(
        &self,
        from: MessageSender,
        to: &str,
        content: &str,
    ) -> Result<(), RegistryError> {
        let inner = self.lock();
        let target = inner
            .entries
            .get(to)
            .ok_or_else(|| RegistryError::UnknownAgent(to.to_string()))?;
        if target.node.status.is_terminal() {
            return Err(RegistryError::MailboxClosed(to.to_string()));
        }

        let sender_label = match &from {
            MessageSender::User => "user".to_string(),
            MessageSender::Agent(id) => match inner.entries.get(id) {
                Some(e) => format!("{} ({id})", e.node.name),
                None => id.clone(),
            },
        };
        let rendered = format!(
            "<inter_agent_message>\n<sender>{sender_label}</sender>\n<content>{content}</content>\n</inter_agent_message>"
        );

        match target.mailbox.try_send(MailboxMessage {
            sender: from,
            content: rendered,
        }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RegistryError::MailboxFull(to.to_string())),
            Err(TrySendError::Closed(_)) => Err(RegistryError::MailboxClosed(to.to_string())),
        }
    }

    pub fn snapshot(&self, agent_id: &str) -> Option<AgentNode> {
        self.lock().entries.get(agent_id).map(|e| e.node.clone())
    }

    /// All nodes in creation order.
    pub fn nodes(&self) -> Vec<AgentNode> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .map(|e| e.node.clone())
            .collect()
    }

    pub fn children_of(&self, parent_id: &str) -> Vec<AgentNode> {
        self.nodes()
            .into_iter()
            .filter(|n| n.parent_id.as_deref() == Some(parent_id))
            .collect()
    }

    /// Active nodes other than `agent_id`.
    pub fn active_others(&self, agent_id: &str) -> Vec<AgentNode> {
        self.nodes()
            .into_iter()
            .filter(|n| n.id != agent_id && n.status.is_active())
            .collect()
    }

    /// Finished agents whose name contains `marker` (case-insensitive).
    pub fn count_finished_matching(&self, marker: &str) -> usize {
        let marker = marker.to_lowercase();
        self.lock()
            .entries
            .values()
            .filter(|e| e.node.status == AgentStatus::Finished)
            .filter(|e| e.node.name.to_lowercase().contains(&marker))
            .count()
    }

    pub fn root_id(&self) -> Option<AgentId> {
        self.lock().root.clone()
    }

    pub fn stop_token(&self, agent_id: &str) -> Option<CancellationToken> {
        self.lock().entries.get(agent_id).map(|e| e.stop.clone())
    }

    /// Render the forest as an indented tree. `viewer` is marked.
    pub fn render_tree(&self, viewer: Option<&str>) -> String {
        let nodes = self.nodes();
        let mut out = String::from("=== AGENT GRAPH ===\n");
        let roots: Vec<&AgentNode> = nodes.iter().filter(|n| n.parent_id.is_none()).collect();
        if roots.is_empty() {
            out.push_str("(no agents)\n");
            return out;
        }
        for root in roots {
            render_node(&nodes, root, 0, viewer, &mut out);
        }

        let active = nodes.iter().filter(|n| n.status.is_active()).count();
        out.push_str(&format!(
            "\nTotal agents: {} ({} active, {} done)\n",
            nodes.len(),
            active,
            nodes.len() - active
        ));
        out
    }

    /// Cancel every agent's stop token.
    pub fn shutdown_all(&self) {
        self.root_token.cancel();
        let mut inner = self.lock();
        for entry in inner.entries.values_mut() {
            if matches!(
                entry.node.status,
                AgentStatus::Running | AgentStatus::Waiting | AgentStatus::Queued
            ) {
                entry.node.status = AgentStatus::Stopping;
            }
        }
    }
}

fn entry_mut<'a>(
    inner: &'a mut RegistryInner,
    agent_id: &str,
) -> Result<&'a mut AgentEntry, RegistryError> {
    inner
        .entries
        .get_mut(agent_id)
        .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))
}

fn render_node(
    nodes: &[AgentNode],
    node: &AgentNode,
    indent: usize,
    viewer: Option<&str>,
    out: &mut String,
) {
    let marker = if viewer == Some(node.id.as_str()) {
        " <- you"
    } else {
        ""
    };
    out.push_str(&format!(
        "{}* {} ({}) [{}]{}\n",
        "  ".repeat(indent),
        node.name,
        node.id,
        node.status,
        marker
    ));
    for child in nodes
        .iter()
        .filter(|n| n.parent_id.as_deref() == Some(node.id.as_str()))
    {
        render_node(nodes, child, indent + 1, viewer, out);
    }
}

fn completion_report(node: &AgentNode, result: &AgentResult) -> String {
    let status = if result.success { "FINISHED" } else { "FAILED" };
    let mut report = format!(
        "<agent_completion_report>\n<agent_name>{}</agent_name>\n<agent_id>{}</agent_id>\n<status>{status}</status>\n<summary>{}</summary>\n",
        node.name, node.id, result.summary
    );
    if let Some(error) = &result.error {
        report.push_str(&format!("<error>{error}</error>\n"));
    }
    report.push_str("</agent_completion_report>");
    report
}
