//! HTTP tool server hosted inside a sandbox.
//!
//! - `POST /execute {agent_id, tool_name, kwargs}` returns `{result}` or `{error}`
//! - `POST /register_agent {agent_id}` returns `{status, agent_id}`
//! - `GET /health` returns `{status, active_agent_count, agent_ids}`
//!
//! `/execute` and `/register_agent` require `Authorization: Bearer <token>`.
//! At most one call per agent id runs at a time; a concurrent second call is
//! answered immediately with [`BUSY_ERROR`]. Every call is bounded by a hard
//! timeout after which the task is aborted and reported as timed out.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::worker::SandboxWorker;
use crate::error::ToolError;
use crate::tools::{self, ToolCommand};

/// Retryable rejection for a second concurrent call from the same agent.
pub const BUSY_ERROR: &str = "Agent has an active tool request; retry shortly";

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub agent_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecuteResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecuteResponse {
    fn ok(result: String) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    fn err(error: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub agent_id: String,
}

/// Shared state of the tool server.
#[derive(Clone)]
pub struct ToolServerState {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    token: String,
    worker: SandboxWorker,
    timeout: Duration,
    in_flight: Mutex<HashSet<String>>,
    registered: Mutex<HashSet<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ToolServerState {
    pub fn new(token: impl Into<String>, worker: SandboxWorker, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                token: token.into(),
                worker,
                timeout,
                in_flight: Mutex::new(HashSet::new()),
                registered: Mutex::new(HashSet::new()),
            }),
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|t| t == self.inner.token)
    }

    /// Claim the per-agent execution slot.
    fn claim(&self, agent_id: &str) -> Option<InFlightGuard> {
        let mut in_flight = lock(&self.inner.in_flight);
        if !in_flight.insert(agent_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            state: self.clone(),
            agent_id: agent_id.to_string(),
        })
    }
}

/// Releases the agent's execution slot on drop.
struct InFlightGuard {
    state: ToolServerState,
    agent_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.state.inner.in_flight).remove(&self.agent_id);
    }
}

pub fn router(state: ToolServerState) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/register_agent", post(register_agent))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: ToolServerState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Invalid or missing bearer token" })),
    )
        .into_response()
}

async fn execute(
    State(state): State<ToolServerState>,
    headers: HeaderMap,
    Json(req): Json<ExecuteRequest>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }

    let command = match tools::resolve_parts(&req.tool_name, req.kwargs) {
        Ok(ToolCommand::Sandbox(cmd)) => cmd,
        Ok(ToolCommand::Agent(_)) => {
            return Json(ExecuteResponse::err(
                ToolError::NotFound(req.tool_name).to_string(),
            ))
            .into_response();
        }
        Err(e) => return Json(ExecuteResponse::err(e.to_string())).into_response(),
    };

    let Some(slot) = state.claim(&req.agent_id) else {
        tracing::debug!(agent_id = %req.agent_id, tool = %req.tool_name, "Rejected concurrent tool call");
        return Json(ExecuteResponse::err(BUSY_ERROR)).into_response();
    };

    // The slot is released when the work ends, not when the request does.
    let worker = state.inner.worker.clone();
    let timeout = state.inner.timeout;
    let agent_id = req.agent_id;
    let tool_name = req.tool_name;
    let work = tokio::spawn(async move {
        let _slot = slot;
        let started = Instant::now();
        let outcome = worker.execute_bounded(command, timeout).await;
        tracing::info!(
            agent_id = %agent_id,
            tool = %tool_name,
            duration_ms = started.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "Tool call"
        );
        outcome
    });
    let outcome = match work.await {
        Ok(outcome) => outcome,
        Err(e) => Err(ToolError::Unexpected(e.to_string())),
    };

    let body = match outcome {
        Ok(result) => ExecuteResponse::ok(result),
        Err(e) => ExecuteResponse::err(e.to_string()),
    };
    Json(body).into_response()
}

async fn register_agent(
    State(state): State<ToolServerState>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    lock(&state.inner.registered).insert(req.agent_id.clone());
    Json(json!({ "status": "registered", "agent_id": req.agent_id })).into_response()
}

async fn health(State(state): State<ToolServerState>) -> Json<Value> {
    let mut agent_ids: Vec<String> = lock(&state.inner.registered).iter().cloned().collect();
    agent_ids.sort();
    Json(json!({
        "status": "healthy",
        "active_agent_count": agent_ids.len(),
        "agent_ids": agent_ids,
    }))
}
