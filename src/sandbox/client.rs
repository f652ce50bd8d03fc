//! RPC client for a sandbox tool server.
//!
//! Transient failures are retried under a [`RetryPolicy`]:
//! - the retryable busy signal is retried as-is;
//! - network failures (timeouts, refused or reset connections) and 5xx
//!   responses first ask the [`SandboxRuntime`] to revive the worker, since
//!   the process may have been recycled with a new address or token.
//!
//! Credentials and other client errors are not retried.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value, json};

use super::retry::RetryPolicy;
use super::runtime::{CloudRuntime, SandboxEndpoint, SandboxRuntime, StaticRuntime};
use super::server::{BUSY_ERROR, ExecuteResponse};
use crate::config::SandboxSettings;
use crate::error::SandboxError;

/// Outcome of a tool call that reached the worker: the result text, or the
/// worker's error observation.
pub type RemoteOutcome = Result<String, String>;

/// Agent id sent to the control plane when provisioning the run's first sandbox.
const PROVISIONING_AGENT: &str = "orchestrator";

enum Attempt {
    Done(RemoteOutcome),
    Busy,
    Network(String),
}

pub struct SandboxClient {
    endpoint: Mutex<SandboxEndpoint>,
    runtime: Arc<dyn SandboxRuntime>,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl SandboxClient {
    /// `request_timeout` should exceed the server's hard timeout so the
    /// server's own timeout report wins.
    pub fn new(
        endpoint: SandboxEndpoint,
        runtime: Arc<dyn SandboxRuntime>,
        retry: RetryPolicy,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            endpoint: Mutex::new(endpoint),
            runtime,
            http,
            retry,
        }
    }

    /// Build the client `settings` describe, or `None` when tools should run
    /// in-process.
    ///
    /// A configured control plane takes precedence: it backs every revival,
    /// and provisions the first sandbox unless a static `url`/`token` pair is
    /// also given.
    pub async fn from_settings(settings: &SandboxSettings) -> Result<Option<Self>, SandboxError> {
        // Leave headroom over the server-side timeout so the server reports it.
        let request_timeout = settings.execution_timeout + Duration::from_secs(30);
        let fixed = match (&settings.url, &settings.token) {
            (Some(url), Some(token)) => Some(SandboxEndpoint::new(url.clone(), token.clone())),
            _ => None,
        };

        let (endpoint, runtime): (SandboxEndpoint, Arc<dyn SandboxRuntime>) =
            match (&settings.cloud_api_base, &settings.cloud_api_key) {
                (Some(api_base), Some(api_key)) => {
                    let cloud = CloudRuntime::new(api_base.clone(), api_key.clone(), request_timeout);
                    let endpoint = match fixed {
                        Some(endpoint) => endpoint,
                        None => cloud.revive(PROVISIONING_AGENT).await?,
                    };
                    (endpoint, Arc::new(cloud))
                }
                _ => match fixed {
                    Some(endpoint) => {
                        let runtime = StaticRuntime::new(endpoint.clone(), settings.connect_timeout);
                        (endpoint, Arc::new(runtime))
                    }
                    None => return Ok(None),
                },
            };

        Ok(Some(Self::new(
            endpoint,
            runtime,
            settings.retry.clone(),
            settings.connect_timeout,
            request_timeout,
        )))
    }

    pub fn endpoint(&self) -> SandboxEndpoint {
        match self.endpoint.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_endpoint(&self, endpoint: SandboxEndpoint) {
        match self.endpoint.lock() {
            Ok(mut guard) => *guard = endpoint,
            Err(poisoned) => *poisoned.into_inner() = endpoint,
        }
    }

    /// Announce an agent to the worker.
    pub async fn register_agent(&self, agent_id: &str) -> Result<(), SandboxError> {
        let endpoint = self.endpoint();
        let response = self
            .http
            .post(endpoint.url("register_agent"))
            .bearer_auth(&endpoint.token)
            .json(&json!({ "agent_id": agent_id }))
            .send()
            .await
            .map_err(|e| SandboxError::Network(e.to_string()))?;
        check_status(response).await.map(|_| ())
    }

    /// Run `tool_name` for `agent_id` on the worker.
    pub async fn execute(
        &self,
        agent_id: &str,
        tool_name: &str,
        kwargs: &Map<String, Value>,
    ) -> Result<RemoteOutcome, SandboxError> {
        let mut retries = 0u32;
        loop {
            let endpoint = self.endpoint();
            let (needs_revive, last) = match self.attempt(&endpoint, agent_id, tool_name, kwargs).await? {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::Busy => (false, BUSY_ERROR.to_string()),
                Attempt::Network(msg) => (true, msg),
            };

            let Some(delay) = self.retry.delay_for(retries) else {
                return Err(SandboxError::RetriesExhausted {
                    attempts: retries + 1,
                    last,
                });
            };
            retries += 1;
            tracing::warn!(
                agent_id,
                tool = tool_name,
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                error = %last,
                "Retrying sandbox call"
            );
            tokio::time::sleep(delay).await;

            if needs_revive {
                self.revive(agent_id).await;
            }
        }
    }

    async fn revive(&self, agent_id: &str) {
        match self.runtime.revive(agent_id).await {
            Ok(endpoint) => {
                tracing::warn!(agent_id, base_url = %endpoint.base_url, "Sandbox revived");
                self.set_endpoint(endpoint);
                if let Err(e) = self.register_agent(agent_id).await {
                    tracing::debug!(agent_id, error = %e, "Re-registration after revival failed");
                }
            }
            Err(e) => tracing::warn!(agent_id, error = %e, "Sandbox revival failed"),
        }
    }

    async fn attempt(
        &self,
        endpoint: &SandboxEndpoint,
        agent_id: &str,
        tool_name: &str,
        kwargs: &Map<String, Value>,
    ) -> Result<Attempt, SandboxError> {
        let sent = self
            .http
            .post(endpoint.url("execute"))
            .bearer_auth(&endpoint.token)
            .json(&json!({ "agent_id": agent_id, "tool_name": tool_name, "kwargs": kwargs }))
            .send()
            .await;

        let response = match sent {
            Ok(r) => r,
            Err(e) => return Ok(Attempt::Network(e.to_string())),
        };

        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Ok(Attempt::Network(format!(
                "tool server returned HTTP {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }
        let response = check_status(response).await?;

        let body: ExecuteResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => return Ok(Attempt::Network(format!("unreadable response: {e}"))),
        };
        Ok(match (body.result, body.error) {
            (_, Some(err)) if err == BUSY_ERROR => Attempt::Busy,
            (_, Some(err)) => Attempt::Done(Err(err)),
            (Some(result), None) => Attempt::Done(Ok(result)),
            (None, None) => Attempt::Done(Ok(String::new())),
        })
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SandboxError> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(SandboxError::Unauthorized);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SandboxError::Http {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}
