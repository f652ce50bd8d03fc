//! Execution of resolved tool invocations on behalf of one agent.
//!
//! Agent-graph tools run in-process against the registry, completion gate
//! and telemetry; sandbox-bound tools go through the sandbox executor. Every
//! tool failure becomes a JSON observation. Only sandbox transport failures
//! that survive the retry budget escape as [`AgentError`].

use serde_json::{Value, json};

use super::state::AgentState;
use super::supervisor::Orchestrator;
use super::types::MessageSender;
use crate::error::AgentError;
use crate::protocol::ToolInvocation;
use crate::sandbox::executor::error_observation;
use crate::telemetry::{RunEvent, ScanSummary};
use crate::tools::{self, AgentCommand, ToolCommand};

const SEVERITIES: &[&str] = &["critical", "high", "medium", "low", "info"];

/// Longest tool result copied into the run log.
const LOGGED_RESULT_CHARS: usize = 2_000;

/// What the loop does after a tool has run.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Control {
    Continue,
    /// Enter a plain wait until a message arrives.
    Wait,
    /// Terminate this agent.
    Finish { summary: String, success: bool },
}

impl Control {
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, Control::Finish { .. })
    }
}

/// Resolve and run one invocation.
pub(crate) async fn dispatch(
    orch: &Orchestrator,
    state: &AgentState,
    invocation: &ToolInvocation,
) -> Result<(String, Control), AgentError> {
    orch.telemetry().record(RunEvent::ToolCall {
        agent_id: state.agent_id.clone(),
        tool: invocation.name.clone(),
        arguments: Value::Object(invocation.args.clone()),
    });

    let (output, control) = match tools::resolve(invocation) {
        Err(e) => {
            tracing::debug!(agent_id = %state.agent_id, tool = %invocation.name, error = %e, "Invocation rejected");
            (error_observation(&e.to_string()), Control::Continue)
        }
        Ok(ToolCommand::Agent(command)) => run_agent_command(orch, state, command),
        Ok(ToolCommand::Sandbox(command)) => {
            let output = orch.executor().execute(&state.agent_id, command).await?;
            (output, Control::Continue)
        }
    };

    orch.telemetry().record(RunEvent::ToolResult {
        agent_id: state.agent_id.clone(),
        tool: invocation.name.clone(),
        result: output.chars().take(LOGGED_RESULT_CHARS).collect(),
    });
    Ok((output, control))
}

fn observe(value: Value) -> (String, Control) {
    (value.to_string(), Control::Continue)
}

fn failure(message: impl Into<String>) -> (String, Control) {
    observe(json!({ "success": false, "error": message.into() }))
}

pub(crate) fn run_agent_command(
    orch: &Orchestrator,
    state: &AgentState,
    command: AgentCommand,
) -> (String, Control) {
    let registry = orch.registry();
    let me = state.agent_id.as_str();

    match command {
        AgentCommand::CreateAgent {
            name,
            task,
            skills,
            inherit_context,
        } => {
            let skills = parse_skills(skills.as_deref());
            match orch.spawn_child(state, &name, &task, skills, inherit_context) {
                Ok(agent_id) => {
                    tracing::info!(parent_id = me, %agent_id, name = %name, "Child agent created");
                    observe(json!({
                        "success": true,
                        "agent_id": agent_id,
                        "message": format!(
                            "Agent '{name}' created and running in the background. \
                             Its completion report will arrive as a message."
                        ),
                        "agent_info": { "id": agent_id, "name": name, "parent_id": me },
                    }))
                }
                Err(e) => failure(format!("Failed to create agent: {e}")),
            }
        }

        AgentCommand::SendMessageToAgent {
            target_agent_id,
            message,
        } => {
            if target_agent_id == me {
                return failure("Cannot send a message to yourself");
            }
            match registry.post_message(
                MessageSender::Agent(me.to_string()),
                &target_agent_id,
                &message,
            ) {
                Ok(()) => observe(json!({
                    "success": true,
                    "message_sent": true,
                    "target_agent_id": target_agent_id,
                })),
                Err(e) => failure(e.to_string()),
            }
        }

        AgentCommand::WaitForMessage { reason } => {
            let reason = reason.unwrap_or_else(|| "Waiting for messages".to_string());
            (
                json!({
                    "success": true,
                    "status": "waiting",
                    "message": "Agent is now waiting for messages",
                    "reason": reason,
                })
                .to_string(),
                Control::Wait,
            )
        }

        AgentCommand::AgentFinish {
            result_summary,
            success,
        } => {
            if state.is_root() {
                return observe(json!({
                    "success": false,
                    "error": "agent_finish_root",
                    "message": "The root agent cannot use agent_finish",
                    "suggestion": "Use finish_scan to complete the run",
                }));
            }
            let active: Vec<Value> = registry
                .children_of(me)
                .into_iter()
                .filter(|n| n.status.is_active())
                .map(|n| json!({ "id": n.id, "name": n.name, "status": n.status }))
                .collect();
            if !active.is_empty() {
                return observe(json!({
                    "success": false,
                    "error": "children_still_active",
                    "message": "Cannot finish while child agents are still active",
                    "active_children": active,
                    "suggestion": "Use wait_for_message until their completion reports arrive",
                }));
            }
            (
                json!({
                    "success": true,
                    "agent_completed": true,
                    "parent_notified": true,
                })
                .to_string(),
                Control::Finish {
                    summary: result_summary,
                    success,
                },
            )
        }

        AgentCommand::FinishScan {
            executive_summary,
            methodology,
            technical_analysis,
            recommendations,
        } => {
            let summary = ScanSummary {
                executive_summary,
                methodology,
                technical_analysis,
                recommendations,
            };
            let outcome = orch.gate().finish(me, registry, orch.telemetry(), summary.clone());
            if outcome.completed {
                (
                    outcome.response.to_string(),
                    Control::Finish {
                        summary: summary.executive_summary.trim().to_string(),
                        success: true,
                    },
                )
            } else {
                observe(outcome.response)
            }
        }

        AgentCommand::ViewAgentGraph {} => (registry.render_tree(Some(me)), Control::Continue),

        AgentCommand::StopAgent { agent_id } => {
            if agent_id == me {
                return failure("Cannot stop yourself; use agent_finish instead");
            }
            match registry.request_stop(&agent_id) {
                Ok(()) => {
                    tracing::info!(requested_by = me, %agent_id, "Stop requested");
                    observe(json!({
                        "success": true,
                        "message": format!(
                            "Stop requested for {agent_id}; it stops at its next loop boundary"
                        ),
                    }))
                }
                Err(e) => failure(e.to_string()),
            }
        }

        AgentCommand::ReportVulnerability {
            title,
            severity,
            description,
        } => {
            let severity = severity.trim().to_ascii_lowercase();
            if !SEVERITIES.contains(&severity.as_str()) {
                return failure(format!(
                    "Invalid severity '{severity}'; expected one of: {}",
                    SEVERITIES.join(", ")
                ));
            }
            if title.trim().is_empty() {
                return failure("Title cannot be empty");
            }
            let id = orch
                .telemetry()
                .add_vulnerability(me, &title, &severity, &description);
            tracing::info!(agent_id = me, vulnerability_id = %id, %severity, "Vulnerability reported");
            observe(json!({
                "success": true,
                "vulnerability_id": id,
                "message": format!("Vulnerability '{}' recorded", title.trim()),
            }))
        }
    }
}

fn parse_skills(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skills_are_split_and_trimmed() {
        assert_eq!(
            parse_skills(Some(" remediation, sqli ,,")),
            vec!["remediation".to_string(), "sqli".to_string()]
        );
        assert!(parse_skills(None).is_empty());
    }

    #[test]
    fn only_finish_is_terminal() {
        assert!(!Control::Continue.is_terminal());
        assert!(!Control::Wait.is_terminal());
        assert!(
            Control::Finish {
                summary: String::new(),
                success: true
            }
            .is_terminal()
        );
    }
}
