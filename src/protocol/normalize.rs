//! Message-sequence normalization.
//!
//! Providers reject histories where an assistant message declares tool calls
//! that are not answered, immediately and exactly, by tool-role messages with
//! the same identifiers. [`normalize_messages`] rewrites any such shape:
//! the assistant keeps its text but loses its call metadata, and orphaned
//! tool replies become user messages carrying an explanatory notice.

use std::collections::HashSet;

use super::message::{Message, Role};

/// Prefix placed in front of a tool result that had to be downgraded.
pub const DOWNGRADE_NOTICE: &str =
    "Tool result replayed as context because tool metadata was incomplete.\n";

/// Return a provider-valid copy of `messages`.
pub fn normalize_messages(messages: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    let mut i = 0;

    while i < messages.len() {
        let msg = &messages[i];

        if msg.role == Role::Tool {
            tracing::debug!(
                tool_call_id = ?msg.tool_call_id,
                "Downgrading orphaned tool message"
            );
            out.push(downgrade_tool_message(msg));
            i += 1;
            continue;
        }

        if msg.role != Role::Assistant || msg.declared_calls().is_empty() {
            out.push(msg.clone());
            i += 1;
            continue;
        }

        // Gather the tool messages that immediately follow.
        let mut end = i + 1;
        while end < messages.len() && messages[end].role == Role::Tool {
            end += 1;
        }
        let replies = &messages[i + 1..end];

        if pairing_is_valid(msg, replies) {
            out.extend(messages[i..end].iter().cloned());
        } else {
            tracing::debug!(
                declared = msg.declared_calls().len(),
                replies = replies.len(),
                "Stripping tool-call metadata from assistant message"
            );
            out.push(strip_tool_calls(msg));
            out.extend(replies.iter().map(downgrade_tool_message));
        }
        i = end;
    }

    out
}

/// True when `replies` answers exactly the calls declared by `assistant`,
/// each one exactly once.
fn pairing_is_valid(assistant: &Message, replies: &[Message]) -> bool {
    let declared = assistant.declared_calls();
    if declared.iter().any(|c| c.id.is_empty()) || replies.len() != declared.len() {
        return false;
    }
    let declared_ids: HashSet<&str> = declared.iter().map(|c| c.id.as_str()).collect();
    if declared_ids.len() != declared.len() {
        return false;
    }

    let mut answered: HashSet<&str> = HashSet::new();
    for reply in replies {
        match reply.tool_call_id.as_deref() {
            Some(id) if declared_ids.contains(id) && answered.insert(id) => {}
            _ => return false,
        }
    }
    answered == declared_ids
}

fn strip_tool_calls(msg: &Message) -> Message {
    Message {
        tool_calls: None,
        ..msg.clone()
    }
}

fn downgrade_tool_message(msg: &Message) -> Message {
    Message::user(format!("{DOWNGRADE_NOTICE}{}", msg.content))
}
