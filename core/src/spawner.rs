//! Fire-and-forget adapter over the external agent host's tool-invoke
//! endpoint. Grounded in this workspace's reqwest-based
//! HTTP client style: a thin struct owning a `reqwest::Client`, one public
//! method per remote call, errors mapped into a component-local enum.

use crate::errors::{SpawnError, SpawnResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hard ceiling on how long a spawn call may take before it is treated as
/// a failure; this call must never block longer than 30 s.
pub const SPAWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct SpawnRequest {
    pub task: String,
    pub label: Option<String>,
    pub model: String,
    pub run_timeout_seconds: u64,
    pub cleanup: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionHandle {
    pub run_id: String,
    pub child_session_key: String,
}

#[derive(Debug, Deserialize)]
struct ToolInvokeEnvelope {
    ok: bool,
    result: Option<SessionHandle>,
}

#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> SpawnResult<SessionHandle>;
}

pub struct HttpSpawner {
    client: reqwest::Client,
    base_url: String,
    shared_token: String,
}

impl HttpSpawner {
    pub fn new(base_url: String, shared_token: String) -> SpawnResult<Self> {
        let client = reqwest::Client::builder().timeout(SPAWN_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url,
            shared_token,
        })
    }
}

#[async_trait]
impl Spawner for HttpSpawner {
    async fn spawn(&self, request: SpawnRequest) -> SpawnResult<SessionHandle> {
        let body = serde_json::json!({
            "tool": "sessions_spawn",
            "args": {
                "task": request.task,
                "label": request.label,
                "model": request.model,
                "runTimeoutSeconds": request.run_timeout_seconds,
                "cleanup": request.cleanup,
            }
        });

        let response = self
            .client
            .post(format!("{}/tools/invoke", self.base_url))
            .bearer_auth(&self.shared_token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SpawnError::NonSuccess(response.status().as_u16()));
        }

        let envelope: ToolInvokeEnvelope = response.json().await?;
        if !envelope.ok {
            return Err(SpawnError::NonSuccess(200));
        }

        envelope
            .result
            .ok_or_else(|| SpawnError::NonSuccess(200))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_request_serializes_camel_case_fields() {
        let request = SpawnRequest {
            task: "fix the bug".into(),
            label: Some("dev_agent:issue-1".into()),
            model: "gpt-4.1".into(),
            run_timeout_seconds: 900,
            cleanup: "keep",
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["task"], "fix the bug");
        assert_eq!(value["run_timeout_seconds"], 900);
    }
}
