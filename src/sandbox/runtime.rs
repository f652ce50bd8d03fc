//! Hosting runtimes that can (re)provision a sandbox worker.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::SandboxError;

/// Address and credentials of a live tool server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxEndpoint {
    pub base_url: String,
    pub token: String,
}

impl SandboxEndpoint {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Return a usable endpoint for `agent_id`, reprovisioning the worker if
    /// the hosting side supports it.
    async fn revive(&self, agent_id: &str) -> Result<SandboxEndpoint, SandboxError>;
}

/// A fixed, externally managed tool server. Revival only confirms it is up.
pub struct StaticRuntime {
    endpoint: SandboxEndpoint,
    http: reqwest::Client,
}

impl StaticRuntime {
    pub fn new(endpoint: SandboxEndpoint, connect_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(connect_timeout)
            .build()
            .unwrap_or_default();
        Self { endpoint, http }
    }
}

#[async_trait]
impl SandboxRuntime for StaticRuntime {
    async fn revive(&self, _agent_id: &str) -> Result<SandboxEndpoint, SandboxError> {
        let response = self
            .http
            .get(self.endpoint.url("health"))
            .send()
            .await
            .map_err(|e| SandboxError::Revive(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SandboxError::Revive(format!(
                "health check returned HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(self.endpoint.clone())
    }
}

#[derive(Debug, Deserialize)]
struct CreateSandboxResponse {
    #[serde(default)]
    sandbox_id: Option<String>,
    #[serde(default)]
    workspace_id: Option<String>,
    #[serde(default)]
    api_url: Option<String>,
    #[serde(default)]
    auth_token: Option<String>,
}

/// A remote control plane that creates sandboxes on demand.
///
/// `POST {api_base}/sandbox/create {agent_id}` with bearer auth; the reply
/// names the sandbox and optionally its tool-server URL and token.
pub struct CloudRuntime {
    api_base: String,
    api_key: String,
    http: reqwest::Client,
}

impl CloudRuntime {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        }
    }
}

#[async_trait]
impl SandboxRuntime for CloudRuntime {
    async fn revive(&self, agent_id: &str) -> Result<SandboxEndpoint, SandboxError> {
        let response = self
            .http
            .post(format!("{}/sandbox/create", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "agent_id": agent_id }))
            .send()
            .await
            .map_err(|e| SandboxError::Revive(e.to_string()))?;

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

        let created: CreateSandboxResponse = response
            .json()
            .await
            .map_err(|e| SandboxError::Revive(format!("invalid create response: {e}")))?;
        let sandbox_id = created
            .sandbox_id
            .or(created.workspace_id)
            .ok_or_else(|| SandboxError::Revive("create response has no sandbox id".into()))?;

        let base_url = created
            .api_url
            .unwrap_or_else(|| format!("{}/sandbox/{sandbox_id}", self.api_base));
        let token = created.auth_token.unwrap_or_else(|| self.api_key.clone());

        tracing::info!(agent_id, sandbox_id = %sandbox_id, "Sandbox provisioned");
        Ok(SandboxEndpoint::new(base_url, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{Value, json};

    async fn spawn_control_plane(reply: Value) -> String {
        let app = Router::new().route(
            "/sandbox/create",
            post(move |Json(body): Json<Value>| {
                let reply = reply.clone();
                async move {
                    assert!(body["agent_id"].is_string());
                    Json(reply)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn endpoint_urls_join_cleanly() {
        let ep = SandboxEndpoint::new("http://host:1/", "t");
        assert_eq!(ep.url("/execute"), "http://host:1/execute");
        assert_eq!(ep.url("health"), "http://host:1/health");
    }

    #[tokio::test]
    async fn cloud_runtime_uses_returned_url_and_token() {
        let base = spawn_control_plane(json!({
            "sandbox_id": "sb-1",
            "api_url": "http://10.0.0.5:9000",
            "auth_token": "fresh"
        }))
        .await;
        let runtime = CloudRuntime::new(&base, "key", Duration::from_secs(5));
        let ep = runtime.revive("agent-1").await.unwrap();
        assert_eq!(ep, SandboxEndpoint::new("http://10.0.0.5:9000", "fresh"));
    }

    #[tokio::test]
    async fn cloud_runtime_defaults_url_from_sandbox_id() {
        let base = spawn_control_plane(json!({ "workspace_id": "ws-7" })).await;
        let runtime = CloudRuntime::new(&base, "key", Duration::from_secs(5));
        let ep = runtime.revive("agent-1").await.unwrap();
        assert_eq!(ep.base_url, format!("{base}/sandbox/ws-7"));
        assert_eq!(ep.token, "key");
    }

    #[tokio::test]
    async fn cloud_runtime_requires_an_id() {
        let base = spawn_control_plane(json!({})).await;
        let runtime = CloudRuntime::new(&base, "key", Duration::from_secs(5));
        assert!(matches!(
            runtime.revive("agent-1").await,
            Err(SandboxError::Revive(_))
        ));
    }

    #[tokio::test]
    async fn static_runtime_fails_when_server_is_down() {
        let runtime = StaticRuntime::new(
            SandboxEndpoint::new("http://127.0.0.1:1", "t"),
            Duration::from_millis(500),
        );
        assert!(runtime.revive("a").await.is_err());
    }
}
