//! Outbound model calls.
//!
//! [`ModelClient`] is the seam every model call goes through. The production
//! adapter is [`GenaiModelClient`]; [`PacedModelClient`] layers the global
//! request pacer beneath any client.

pub mod genai_client;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ModelError;
use crate::pacer::{RequestPacer, WaitPhase};
use crate::protocol::{DeclaredToolCall, Message};
use crate::tools::catalogue::ToolSpec;

pub use genai_client::GenaiModelClient;

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<Message>,
    /// Tools advertised to the model; empty for plain completions.
    pub tools: Vec<&'static ToolSpec>,
}

impl ModelRequest {
    pub fn new(system: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            system: system.into(),
            messages,
            tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<&'static ToolSpec>) -> Self {
        self.tools = tools;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub tool_calls: Vec<DeclaredToolCall>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;
}

/// Wraps a client so that every call holds a pacer slot for its duration and
/// provider rate-limit signals cool the whole process down.
pub struct PacedModelClient {
    inner: Arc<dyn ModelClient>,
    pacer: Arc<RequestPacer>,
}

impl PacedModelClient {
    pub fn new(inner: Arc<dyn ModelClient>, pacer: Arc<RequestPacer>) -> Self {
        Self { inner, pacer }
    }

    pub fn pacer(&self) -> &Arc<RequestPacer> {
        &self.pacer
    }
}

#[async_trait]
impl ModelClient for PacedModelClient {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let _permit = self
            .pacer
            .acquire(|phase, waited| match phase {
                WaitPhase::Queue => {
                    tracing::debug!(waited_ms = waited.as_millis() as u64, "Waiting for model slot")
                }
                WaitPhase::Cooldown => {
                    tracing::info!(waited_ms = waited.as_millis() as u64, "Waiting out rate-limit cooldown")
                }
            })
            .await;

        let result = self.inner.complete(request).await;
        if let Err(ModelError::RateLimited { retry_after, .. }) = &result {
            self.pacer.register_rate_limit(*retry_after);
        }
        result
    }
}
