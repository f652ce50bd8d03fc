//! Dispatch-mode selection and turn assembly.
//!
//! A batch whose invocations all carry identifiers is answered per call
//! (native mode). If any invocation lacks an identifier the whole batch
//! falls back to legacy mode: results are concatenated into one user
//! message.

use serde_json::Value;

use super::invocation::{ToolInvocation, format_tag_invocation};
use super::message::{DeclaredToolCall, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Native,
    Legacy,
}

impl DispatchMode {
    pub fn for_batch(batch: &[ToolInvocation]) -> Self {
        let has_id = |inv: &ToolInvocation| inv.id.as_deref().is_some_and(|id| !id.is_empty());
        if !batch.is_empty() && batch.iter().all(has_id) {
            DispatchMode::Native
        } else {
            DispatchMode::Legacy
        }
    }
}

/// Result of one invocation, ready to be written into history.
#[derive(Debug, Clone)]
pub struct ToolReply {
    pub invocation: ToolInvocation,
    pub output: String,
}

/// Build the assistant message and reply messages for one executed batch.
pub fn assemble_turn(assistant_text: &str, replies: &[ToolReply]) -> Vec<Message> {
    let batch: Vec<ToolInvocation> = replies.iter().map(|r| r.invocation.clone()).collect();

    match DispatchMode::for_batch(&batch) {
        DispatchMode::Native => {
            let calls = batch
                .iter()
                .map(|inv| DeclaredToolCall {
                    id: inv.id.clone().unwrap_or_default(),
                    name: inv.name.clone(),
                    arguments: Value::Object(inv.args.clone()),
                })
                .collect();
            let mut turn = Vec::with_capacity(replies.len() + 1);
            turn.push(Message::assistant_with_calls(assistant_text, calls));
            for reply in replies {
                let id = reply.invocation.id.clone().unwrap_or_default();
                turn.push(Message::tool(id, &reply.output).with_name(&reply.invocation.name));
            }
            turn
        }
        DispatchMode::Legacy => {
            // Keep the calls visible in the transcript when they arrived natively.
            let mut assistant = assistant_text.to_string();
            if !assistant.contains("<function=") {
                for inv in &batch {
                    if !assistant.is_empty() {
                        assistant.push('\n');
                    }
                    assistant.push_str(&format_tag_invocation(&inv.name, &inv.args));
                }
            }
            vec![
                Message::assistant(assistant),
                Message::user(merge_legacy_results(replies)),
            ]
        }
    }
}

/// Concatenate results into `<tool_result>` blocks.
pub fn merge_legacy_results(replies: &[ToolReply]) -> String {
    replies
        .iter()
        .map(|r| {
            format!(
                "<tool_result>\n<tool_name>{}</tool_name>\n<result>{}</result>\n</tool_result>",
                r.invocation.name, r.output
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
