//! Per-agent conversation loop.
//!
//! One turn:
//!
//! 1. Check the stop token
//! 2. Drain the mailbox into history (messages may resume a waiting agent)
//! 3. While waiting, block on the mailbox under the resume policy
//! 4. Paced model call over the normalized history, with retries
//! 5. Parse invocations, dispatch the batch, append the assembled turn
//!
//! Exhausting model retries parks the agent in a model-failure wait instead
//! of failing it outright; only an eligible message brings it back.

use super::registry::Mailbox;
use super::state::AgentState;
use super::supervisor::Orchestrator;
use super::toolbox::{Control, dispatch};
use super::types::{AgentStatus, MailboxMessage, WaitReason};
use crate::error::AgentError;
use crate::llm::{ModelRequest, ModelResponse};
use crate::protocol::invocation::repair_truncated_call;
use crate::protocol::{
    DispatchMode, Message, ToolReply, assemble_turn, clean_content, extract_invocations,
    normalize_messages,
};
use crate::tools::CATALOGUE;

const CONTINUATION_NUDGE: &str = "You responded without calling a tool. Continue working on \
     your task using the available tools. When you are done, call agent_finish (or finish_scan \
     if you are the root agent).";

/// How an agent loop ended without an error.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentExit {
    Finished { summary: String },
    /// The agent itself reported its task as unsuccessful.
    Failed { summary: String },
}

pub(crate) async fn run_agent(
    orch: &Orchestrator,
    state: &mut AgentState,
    mailbox: &mut Mailbox,
    system_prompt: &str,
) -> Result<AgentExit, AgentError> {
    let max_iterations = orch.settings().max_iterations;

    loop {
        if state.stop_requested() {
            return Err(AgentError::Stopped);
        }

        drain_mailbox(orch, state, mailbox)?;
        if let Some(reason) = state.waiting() {
            await_resume(orch, state, mailbox, reason).await?;
            continue;
        }

        let iteration = state.next_iteration();
        if iteration > max_iterations {
            return Err(AgentError::MaxIterations(max_iterations));
        }

        let Some(response) = call_model(orch, state, system_prompt).await? else {
            orch.registry().enter_waiting(&state.agent_id, true)?;
            state.set_waiting(WaitReason::ModelFailure);
            orch.record_status(
                &state.agent_id,
                AgentStatus::Waiting,
                state.last_model_error(),
            );
            continue;
        };

        let invocations = extract_invocations(&response.content, &response.tool_calls);
        if invocations.is_empty() {
            let text = response.content.trim();
            if !text.is_empty() {
                state.add_message(Message::assistant(text));
            }
            state.add_message(Message::user(CONTINUATION_NUDGE));
            continue;
        }

        let mode = DispatchMode::for_batch(&invocations);
        tracing::debug!(
            agent_id = %state.agent_id,
            iteration,
            calls = invocations.len(),
            ?mode,
            "Dispatching tool batch"
        );

        let mut replies = Vec::with_capacity(invocations.len());
        let mut control = Control::Continue;
        for invocation in invocations {
            let (output, next) = dispatch(orch, state, &invocation).await?;
            replies.push(ToolReply { invocation, output });
            if next != Control::Continue {
                control = next;
            }
            if control.is_terminal() {
                break;
            }
        }

        let assistant_text = match mode {
            DispatchMode::Native => clean_content(&response.content),
            DispatchMode::Legacy => repair_truncated_call(&response.content),
        };
        state.extend_messages(assemble_turn(&assistant_text, &replies));

        match control {
            Control::Finish { summary, success } => {
                return Ok(if success {
                    AgentExit::Finished { summary }
                } else {
                    AgentExit::Failed { summary }
                });
            }
            _ if state.stop_requested() => return Err(AgentError::Stopped),
            Control::Wait => {
                orch.registry().enter_waiting(&state.agent_id, false)?;
                state.set_waiting(WaitReason::Plain);
                orch.record_status(&state.agent_id, AgentStatus::Waiting, None);
            }
            Control::Continue => {}
        }
    }
}

/// Paced model call with retries. `Ok(None)` means every attempt failed.
async fn call_model(
    orch: &Orchestrator,
    state: &mut AgentState,
    system_prompt: &str,
) -> Result<Option<ModelResponse>, AgentError> {
    let settings = orch.settings();
    let attempts = settings.model_max_retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        if state.stop_requested() {
            return Err(AgentError::Stopped);
        }

        let request = ModelRequest::new(system_prompt, normalize_messages(state.messages()))
            .with_tools(CATALOGUE.iter().collect());
        match orch.model().complete(request).await {
            Ok(response) => {
                state.set_last_model_error(None);
                return Ok(Some(response));
            }
            Err(e) => {
                tracing::warn!(agent_id = %state.agent_id, attempt, attempts, error = %e, "LLM request failed");
                last_error = e.to_string();
            }
        }

        if attempt < attempts {
            let delay = settings
                .model_retry_backoff
                .saturating_mul(2u32.saturating_pow(attempt - 1));
            tokio::select! {
                _ = state.stop_token().cancelled() => return Err(AgentError::Stopped),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    tracing::error!(agent_id = %state.agent_id, attempts, error = %last_error, "LLM retries exhausted; agent waiting");
    state.set_last_model_error(Some(last_error));
    Ok(None)
}

fn drain_mailbox(
    orch: &Orchestrator,
    state: &mut AgentState,
    mailbox: &mut Mailbox,
) -> Result<(), AgentError> {
    while let Some(message) = mailbox.try_recv() {
        absorb(orch, state, message)?;
    }
    Ok(())
}

/// Append a mailbox message to history and resume the agent if the sender
/// is eligible. Returns whether it resumed.
fn absorb(
    orch: &Orchestrator,
    state: &mut AgentState,
    message: MailboxMessage,
) -> Result<bool, AgentError> {
    let resumes = state.waiting().is_some()
        && orch
            .registry()
            .should_resume(&state.agent_id, &message.sender);
    state.add_message(Message::user(message.content));

    if resumes {
        orch.registry().resume(&state.agent_id)?;
        state.clear_waiting();
        orch.record_status(&state.agent_id, AgentStatus::Running, Some("resumed"));
        tracing::info!(agent_id = %state.agent_id, sender = ?message.sender, "Agent resumed");
    } else if state.waiting().is_some() {
        tracing::debug!(agent_id = %state.agent_id, sender = ?message.sender, "Message did not resume waiting agent");
    }
    Ok(resumes)
}

async fn await_resume(
    orch: &Orchestrator,
    state: &mut AgentState,
    mailbox: &mut Mailbox,
    reason: WaitReason,
) -> Result<(), AgentError> {
    let timeout = orch.settings().waiting_timeout;
    let deadline = tokio::time::Instant::now() + timeout;
    let stop = state.stop_token().clone();

    while state.waiting().is_some() {
        let received = tokio::select! {
            _ = stop.cancelled() => return Err(AgentError::Stopped),
            received = tokio::time::timeout_at(deadline, mailbox.recv()) => received,
        };
        match received {
            Ok(Some(message)) => {
                absorb(orch, state, message)?;
            }
            Ok(None) => return Err(AgentError::MailboxClosed),
            Err(_) => {
                return Err(match reason {
                    WaitReason::Plain => AgentError::WaitingTimedOut(timeout),
                    WaitReason::ModelFailure => AgentError::ModelExhausted {
                        attempts: orch.settings().model_max_retries.max(1),
                        last: state
                            .last_model_error()
                            .unwrap_or("unknown model error")
                            .to_string(),
                    },
                });
            }
        }
    }
    Ok(())
}
