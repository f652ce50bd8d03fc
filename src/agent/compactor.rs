//! Condenses a parent's history before it seeds a new child agent.
//!
//! Short histories are passed through verbatim after normalization. Longer
//! ones are split into an old segment and the last `keep_recent` messages.
//! The old segment is summarized by one model call (falling back to a
//! deterministic brief rendering); the recent tail is always carried over as
//! a literal transcript.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::CompactorSettings;
use crate::llm::{ModelClient, ModelRequest};
use crate::protocol::{Message, Role, normalize_messages};

const TRUNCATION_MARKER: &str = "...[truncated]...";

const SUMMARY_PROMPT: &str = "\
You condense conversation history for a child agent that will continue part of \
the work. Preserve concrete facts: targets, endpoints, credentials found, \
commands run and their notable results, confirmed and suspected findings, and \
open leads. Omit pleasantries and repeated tool noise. Reply with the summary \
only.";

/// Result of a summarization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryOutcome {
    Summary(String),
    Failed(String),
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `transcript` for a child working on `child_task`.
    async fn summarize(&self, transcript: &str, child_task: &str) -> SummaryOutcome;
}

/// Summarizer backed by a (paced) model client.
pub struct ModelSummarizer {
    client: Arc<dyn ModelClient>,
}

impl ModelSummarizer {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Summarizer for ModelSummarizer {
    async fn summarize(&self, transcript: &str, child_task: &str) -> SummaryOutcome {
        let prompt = format!(
            "The child agent's task:\n{child_task}\n\nConversation to summarize:\n\n{transcript}"
        );
        let request = ModelRequest::new(SUMMARY_PROMPT, vec![Message::user(prompt)]);
        match self.client.complete(request).await {
            Ok(response) if !response.content.trim().is_empty() => {
                SummaryOutcome::Summary(response.content.trim().to_string())
            }
            Ok(_) => SummaryOutcome::Failed("empty summary".into()),
            Err(e) => SummaryOutcome::Failed(e.to_string()),
        }
    }
}

/// What a child inherits from its parent.
#[derive(Debug, Clone, PartialEq)]
pub enum InheritedContext {
    /// Normalized messages, carried over as-is.
    Verbatim(Vec<Message>),
    /// Summary section followed by the recent transcript.
    Compacted(String),
}

impl InheritedContext {
    /// Messages to place at the start of the child's history.
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            InheritedContext::Verbatim(messages) => messages,
            InheritedContext::Compacted(text) => vec![Message::user(format!(
                "<inherited_context_from_parent>\n{text}\n</inherited_context_from_parent>"
            ))],
        }
    }
}

pub struct ContextCompactor {
    settings: CompactorSettings,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl ContextCompactor {
    pub fn new(settings: CompactorSettings, summarizer: Option<Arc<dyn Summarizer>>) -> Self {
        Self {
            settings,
            summarizer,
        }
    }

    pub async fn compact(&self, history: &[Message], child_task: &str) -> InheritedContext {
        let history: Vec<Message> = history
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();

        let split = history.len().saturating_sub(self.settings.keep_recent);
        if history.len() <= self.settings.threshold || split == 0 {
            return InheritedContext::Verbatim(normalize_messages(&history));
        }

        let (old, recent) = history.split_at(split);
        let (summary, source) = match self.summarize_old(old, child_task).await {
            Some(summary) => (summary, "summary"),
            None => (format_brief(old, self.settings.brief_char_budget), "brief"),
        };

        tracing::debug!(
            old = old.len(),
            recent = recent.len(),
            source,
            "Compacted inherited context"
        );

        InheritedContext::Compacted(format!(
            "<earlier_context_summary message_count=\"{}\" source=\"{source}\">\n{summary}\n</earlier_context_summary>\n\n<recent_parent_activity>\n{}\n</recent_parent_activity>",
            old.len(),
            format_as_text(recent),
        ))
    }

    async fn summarize_old(&self, old: &[Message], child_task: &str) -> Option<String> {
        if !self.settings.summarize {
            return None;
        }
        let summarizer = self.summarizer.as_ref()?;
        let transcript = format_as_text(old);

        let outcome = match tokio::time::timeout(
            self.settings.timeout,
            summarizer.summarize(&transcript, child_task),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                SummaryOutcome::Failed(format!("timed out after {:?}", self.settings.timeout))
            }
        };

        match outcome {
            SummaryOutcome::Summary(text) if !text.trim().is_empty() && !echoes_first(&text, old) => {
                Some(text.trim().to_string())
            }
            SummaryOutcome::Summary(_) => {
                tracing::warn!("Summary was empty or echoed its input; using brief rendering");
                None
            }
            SummaryOutcome::Failed(reason) => {
                tracing::warn!(%reason, "Context summarization failed; using brief rendering");
                None
            }
        }
    }
}

/// A summary identical to the first old message is treated as a failure.
fn echoes_first(summary: &str, old: &[Message]) -> bool {
    let Some(first) = old.first() else {
        return false;
    };
    let summary = summary.trim();
    summary == first.content.trim() || summary == format_as_text(&old[..1]).trim()
}

/// Role-prefixed transcript, one message per paragraph.
pub fn format_as_text(messages: &[Message]) -> String {
    messages
        .iter()
        .filter_map(|m| {
            let content = m.content.trim();
            match m.role {
                Role::Tool => {
                    if content.is_empty() {
                        return None;
                    }
                    let id = m.tool_call_id.as_deref().unwrap_or("?");
                    Some(format!("tool_result({id}): {content}"))
                }
                Role::Assistant if !m.declared_calls().is_empty() => {
                    let names: Vec<&str> =
                        m.declared_calls().iter().map(|c| c.name.as_str()).collect();
                    Some(format!("assistant [called: {}]: {content}", names.join(", ")))
                }
                role => {
                    if content.is_empty() {
                        return None;
                    }
                    Some(format!("{}: {content}", role.as_str()))
                }
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Deterministic fallback: each message role-prefixed and cut at `budget`
/// characters.
pub fn format_brief(messages: &[Message], budget: usize) -> String {
    messages
        .iter()
        .filter_map(|m| {
            let content = m.content.trim();
            if content.is_empty() {
                return None;
            }
            let body = if content.chars().count() > budget {
                let head: String = content.chars().take(budget).collect();
                format!("{head}{TRUNCATION_MARKER}")
            } else {
                content.to_string()
            };
            Some(format!("{}: {body}", m.role.as_str()))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeclaredToolCall;
    use std::sync::Mutex;

    struct RecordingSummarizer {
        outcome: SummaryOutcome,
        seen: Mutex<Vec<String>>,
    }

    impl RecordingSummarizer {
        fn new(outcome: SummaryOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Summarizer for RecordingSummarizer {
        async fn summarize(&self, transcript: &str, _child_task: &str) -> SummaryOutcome {
            self.seen.lock().unwrap().push(transcript.to_string());
            self.outcome.clone()
        }
    }

    fn history(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("message {i}"))
                } else {
                    Message::assistant(format!("message {i}"))
                }
            })
            .collect()
    }

    fn compactor(summarizer: Arc<RecordingSummarizer>) -> ContextCompactor {
        ContextCompactor::new(CompactorSettings::default(), Some(summarizer))
    }

    #[tokio::test]
    async fn history_at_threshold_is_verbatim() {
        let summarizer = RecordingSummarizer::new(SummaryOutcome::Summary("s".into()));
        let result = compactor(summarizer.clone()).compact(&history(15), "task").await;
        assert_eq!(result, InheritedContext::Verbatim(history(15)));
        assert!(summarizer.calls().is_empty());
    }

    #[tokio::test]
    async fn one_above_threshold_compacts_and_keeps_recent_verbatim() {
        let summarizer = RecordingSummarizer::new(SummaryOutcome::Summary("the gist".into()));
        let result = compactor(summarizer.clone()).compact(&history(16), "task").await;

        let InheritedContext::Compacted(text) = result else {
            panic!("expected compaction");
        };
        assert_eq!(summarizer.calls().len(), 1);
        assert!(text.contains("<earlier_context_summary message_count=\"6\" source=\"summary\">"));
        assert!(text.contains("the gist"));
        for i in 6..16 {
            assert!(text.contains(&format!("message {i}")), "missing message {i}");
        }
        let seen = &summarizer.calls()[0];
        assert!(seen.contains("message 5"));
        assert!(!seen.contains("message 6"));
    }

    #[tokio::test]
    async fn failed_summary_falls_back_to_brief() {
        let summarizer = RecordingSummarizer::new(SummaryOutcome::Failed("boom".into()));
        let result = compactor(summarizer).compact(&history(20), "task").await;
        let InheritedContext::Compacted(text) = result else {
            panic!("expected compaction");
        };
        assert!(text.contains("source=\"brief\""));
        assert!(text.contains("user: message 0"));
        assert!(text.contains("assistant: message 1"));
    }

    #[tokio::test]
    async fn echoed_first_message_is_treated_as_failure() {
        let summarizer = RecordingSummarizer::new(SummaryOutcome::Summary("message 0".into()));
        let result = compactor(summarizer).compact(&history(20), "task").await;
        let InheritedContext::Compacted(text) = result else {
            panic!("expected compaction");
        };
        assert!(text.contains("source=\"brief\""));
        assert!(text.contains("message 0"));
        assert!(text.contains("message 1"));
    }

    #[tokio::test]
    async fn empty_summary_falls_back_to_brief() {
        let summarizer = RecordingSummarizer::new(SummaryOutcome::Summary("   ".into()));
        let result = compactor(summarizer).compact(&history(20), "task").await;
        let InheritedContext::Compacted(text) = result else {
            panic!("expected compaction");
        };
        assert!(text.contains("source=\"brief\""));
    }

    #[tokio::test]
    async fn summarization_disabled_uses_brief_without_calling() {
        let summarizer = RecordingSummarizer::new(SummaryOutcome::Summary("x".into()));
        let settings = CompactorSettings {
            summarize: false,
            ..CompactorSettings::default()
        };
        let result = ContextCompactor::new(settings, Some(summarizer.clone()))
            .compact(&history(20), "task")
            .await;
        assert!(matches!(result, InheritedContext::Compacted(_)));
        assert!(summarizer.calls().is_empty());
    }

    #[tokio::test]
    async fn verbatim_path_sanitizes_broken_pairs() {
        let mut messages = history(3);
        messages.push(Message::assistant_with_calls(
            "",
            vec![
                DeclaredToolCall {
                    id: "a".into(),
                    name: "shell_exec".into(),
                    arguments: serde_json::json!({}),
                },
                DeclaredToolCall {
                    id: "b".into(),
                    name: "shell_exec".into(),
                    arguments: serde_json::json!({}),
                },
            ],
        ));
        messages.push(Message::tool("a", "only one"));

        let summarizer = RecordingSummarizer::new(SummaryOutcome::Summary("s".into()));
        let InheritedContext::Verbatim(out) = compactor(summarizer).compact(&messages, "t").await
        else {
            panic!("expected verbatim");
        };
        assert!(out.iter().all(|m| m.role != Role::Tool));
        assert!(out.iter().all(|m| m.declared_calls().is_empty()));
    }

    #[test]
    fn text_format_prefixes_roles_and_calls() {
        let messages = vec![
            Message::user("scan it"),
            Message::user("   "),
            Message::assistant_with_calls(
                "running",
                vec![DeclaredToolCall {
                    id: "c1".into(),
                    name: "shell_exec".into(),
                    arguments: serde_json::json!({"command": "nmap"}),
                }],
            ),
            Message::tool("c1", "22/tcp open"),
        ];
        assert_eq!(
            format_as_text(&messages),
            "user: scan it\n\nassistant [called: shell_exec]: running\n\ntool_result(c1): 22/tcp open"
        );
    }

    #[test]
    fn brief_format_truncates_long_messages() {
        let long = "x".repeat(600);
        let brief = format_brief(&[Message::user("short"), Message::assistant(long)], 500);
        let lines: Vec<&str> = brief.lines().collect();
        assert_eq!(lines[0], "user: short");
        assert!(lines[1].ends_with(TRUNCATION_MARKER));
        assert_eq!(lines[1].len(), "assistant: ".len() + 500 + TRUNCATION_MARKER.len());
    }

    #[test]
    fn compacted_context_becomes_one_user_message() {
        let messages = InheritedContext::Compacted("body".into()).into_messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.starts_with("<inherited_context_from_parent>"));
    }
}
