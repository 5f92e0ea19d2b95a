//! HTTP implementation of `caseflow_core::agent_runner::pm::Gateway`, the
//! synchronous LLM call the PM runner makes (unlike every other role, which
//! goes through the fire-and-forget `Spawner`). Grounded in this
//! workspace's `HttpSpawner`: a thin struct owning a `reqwest::Client`,
//! hitting the same agent host's tool-invoke endpoint with a different
//! tool name.

use async_trait::async_trait;
use caseflow_core::agent_runner::pm::Gateway;
use caseflow_core::errors::{EngineError, EngineResult};
use serde::Deserialize;
use std::time::Duration;

const COMPLETE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    shared_token: String,
}

impl HttpGateway {
    pub fn new(base_url: String, shared_token: String) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(COMPLETE_TIMEOUT)
            .build()
            .map_err(|e| EngineError::TransientError(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            shared_token,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ToolInvokeEnvelope {
    ok: bool,
    result: Option<CompletionResult>,
}

#[derive(Debug, Deserialize)]
struct CompletionResult {
    text: String,
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn complete(&self, prompt: &str, model: &str) -> EngineResult<String> {
        let body = serde_json::json!({
            "tool": "llm_complete",
            "args": { "prompt": prompt, "model": model },
        });

        let response = self
            .client
            .post(format!("{}/tools/invoke", self.base_url))
            .bearer_auth(&self.shared_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::TransientError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::TransientError(format!(
                "llm host returned {}",
                response.status()
            )));
        }

        let envelope: ToolInvokeEnvelope = response
            .json()
            .await
            .map_err(|e| EngineError::TransientError(e.to_string()))?;

        if !envelope.ok {
            return Err(EngineError::AgentActionFailed("llm_complete reported failure".into()));
        }

        envelope
            .result
            .map(|r| r.text)
            .ok_or_else(|| EngineError::AgentActionFailed("llm_complete returned no text".into()))
    }
}
