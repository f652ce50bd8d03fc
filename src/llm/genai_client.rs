//! [`ModelClient`] backed by the `genai` crate.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use genai::Client;
use genai::chat::{ChatMessage, ChatOptions, ChatRequest, ChatStreamEvent, Tool, ToolCall, ToolResponse};
use regex::Regex;
use serde_json::json;

use super::{ModelClient, ModelRequest, ModelResponse};
use crate::error::ModelError;
use crate::protocol::{DeclaredToolCall, Message, Role};
use crate::tools::catalogue::ToolSpec;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(360);

static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b429\b|rate[ _-]?limit|too many requests|resource[ _]exhausted")
        .expect("static regex")
});

static RETRY_AFTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)retry[-_ ]?after["':=\s]*([0-9]+(?:\.[0-9]+)?)"#).expect("static regex")
});

static TRY_AGAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)try again in ([0-9]+(?:\.[0-9]+)?)\s*(ms|s)\b").expect("static regex")
});

pub struct GenaiModelClient {
    client: Client,
    model: String,
    request_timeout: Duration,
}

impl GenaiModelClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: Client::default(),
            model: model.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    async fn stream_completion(&self, chat_req: ChatRequest) -> Result<ModelResponse, ModelError> {
        let options = ChatOptions::default()
            .with_capture_content(true)
            .with_capture_tool_calls(true);

        let stream_res = self
            .client
            .exec_chat_stream(&self.model, chat_req, Some(&options))
            .await
            .map_err(|e| classify_error(&e.to_string()))?;

        let mut stream = stream_res.stream;
        let mut last_error: Option<String> = None;
        while let Some(event) = stream.next().await {
            match event {
                Ok(ChatStreamEvent::End(end)) => {
                    let content = end
                        .captured_first_text()
                        .map(|t| t.to_string())
                        .unwrap_or_default();
                    let tool_calls = end
                        .captured_tool_calls()
                        .map(|calls| calls.into_iter().map(declared_from_genai).collect())
                        .unwrap_or_default();
                    return Ok(ModelResponse {
                        content,
                        tool_calls,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "Model stream error");
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(match last_error {
            Some(message) => classify_error(&message),
            None => ModelError::Request("stream ended without a response".into()),
        })
    }
}

#[async_trait]
impl ModelClient for GenaiModelClient {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let chat_req = build_chat_request(&request)?;
        match tokio::time::timeout(self.request_timeout, self.stream_completion(chat_req)).await {
            Ok(result) => result,
            Err(_) => Err(ModelError::Timeout(self.request_timeout)),
        }
    }
}

fn build_chat_request(request: &ModelRequest) -> Result<ChatRequest, ModelError> {
    let mut chat_req = ChatRequest::from_system(&request.system);
    if !request.tools.is_empty() {
        let tools: Vec<Tool> = request.tools.iter().map(|spec| genai_tool(spec)).collect();
        chat_req = chat_req.with_tools(tools);
    }
    for message in &request.messages {
        for converted in to_chat_messages(message)? {
            chat_req = chat_req.append_message(converted);
        }
    }
    Ok(chat_req)
}

fn genai_tool(spec: &ToolSpec) -> Tool {
    Tool::new(spec.name)
        .with_description(spec.description)
        .with_schema(spec.json_schema())
}

fn to_chat_messages(message: &Message) -> Result<Vec<ChatMessage>, ModelError> {
    Ok(match message.role {
        Role::System => vec![ChatMessage::system(&message.content)],
        Role::User => vec![ChatMessage::user(&message.content)],
        Role::Assistant if message.declared_calls().is_empty() => {
            vec![ChatMessage::assistant(&message.content)]
        }
        Role::Assistant => {
            let mut out = Vec::with_capacity(2);
            if !message.content.trim().is_empty() {
                out.push(ChatMessage::assistant(&message.content));
            }
            let calls = message
                .declared_calls()
                .iter()
                .map(genai_from_declared)
                .collect::<Result<Vec<ToolCall>, _>>()?;
            out.push(ChatMessage::from(calls));
            out
        }
        Role::Tool => {
            let call_id = message.tool_call_id.clone().unwrap_or_default();
            vec![ChatMessage::from(ToolResponse::new(call_id, message.content.clone()))]
        }
    })
}

fn declared_from_genai(call: &ToolCall) -> DeclaredToolCall {
    DeclaredToolCall {
        id: call.call_id.clone(),
        name: call.fn_name.clone(),
        arguments: call.fn_arguments.clone(),
    }
}

fn genai_from_declared(call: &DeclaredToolCall) -> Result<ToolCall, ModelError> {
    serde_json::from_value(json!({
        "call_id": call.id,
        "fn_name": call.name,
        "fn_arguments": call.arguments,
    }))
    .map_err(|e| ModelError::Request(format!("cannot encode tool call '{}': {e}", call.name)))
}

/// Map a provider error message to a [`ModelError`], recognising rate-limit
/// signals and any suggested retry delay.
pub fn classify_error(message: &str) -> ModelError {
    if !RATE_LIMIT_RE.is_match(message) {
        return ModelError::Request(message.to_string());
    }
    ModelError::RateLimited {
        retry_after: retry_after_hint(message),
        message: message.to_string(),
    }
}

fn retry_after_hint(message: &str) -> Option<Duration> {
    if let Some(caps) = RETRY_AFTER_RE.captures(message) {
        return caps[1].parse::<f64>().ok().map(Duration::from_secs_f64);
    }
    let caps = TRY_AGAIN_RE.captures(message)?;
    let value = caps[1].parse::<f64>().ok()?;
    Some(if caps[2].eq_ignore_ascii_case("ms") {
        Duration::from_secs_f64(value / 1000.0)
    } else {
        Duration::from_secs_f64(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_plain_errors_as_request() {
        assert!(matches!(
            classify_error("connection refused"),
            ModelError::Request(_)
        ));
    }

    #[test]
    fn classifies_429_with_retry_after() {
        match classify_error("HTTP 429 Too Many Requests; retry-after: 12") {
            ModelError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(12)));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classifies_try_again_hint_in_millis() {
        match classify_error("Rate limit reached. Please try again in 750ms.") {
            ModelError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_millis(750)));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rate_limit_without_hint_has_no_delay() {
        match classify_error("RESOURCE_EXHAUSTED: quota") {
            ModelError::RateLimited { retry_after, .. } => assert_eq!(retry_after, None),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn tool_messages_keep_their_call_id() {
        let converted = to_chat_messages(&Message::tool("call_7", "done")).unwrap();
        assert_eq!(converted.len(), 1);
    }

    #[test]
    fn assistant_with_calls_and_text_splits_in_two() {
        let message = Message::assistant_with_calls(
            "checking",
            vec![DeclaredToolCall {
                id: "c1".into(),
                name: "shell_exec".into(),
                arguments: json!({"command": "ls"}),
            }],
        );
        assert_eq!(to_chat_messages(&message).unwrap().len(), 2);
    }
}
