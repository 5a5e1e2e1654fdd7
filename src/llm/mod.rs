// src/llm/mod.rs
// The external LLM invocation endpoint contract — spec §6.
//
// This crate never implements an LLM; it only calls out to an existing
// agent-execution HTTP endpoint with `maxTurns=1` and no nested tool access,
// then hands the raw model text back to the summarizer for parsing.

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Per-call timeout (spec §5 "Timeouts"). Timed-out calls are treated as
/// errored, not retried inline.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 180;

/// Tools explicitly disabled on every enrichment call — the model must only
/// produce text, never drive nested tool use.
const DISALLOWED_TOOLS: &[&str] = &["Bash", "Edit", "Write", "Read", "WebFetch", "Task"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub prompt: String,
    pub system_prompt: String,
    pub model: String,
    pub max_turns: u32,
    pub permission_mode: String,
    pub disallowed_tools: Vec<String>,
    pub setting_sources: Vec<String>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, system_prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: system_prompt.into(),
            model: model.into(),
            max_turns: 1,
            permission_mode: "bypassPermissions".to_string(),
            disallowed_tools: DISALLOWED_TOOLS.iter().map(|s| s.to_string()).collect(),
            setting_sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AgentResponseEnvelope {
    #[allow(dead_code)]
    success: bool,
    data: AgentResponseData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentResponseData {
    success: bool,
    result: Option<String>,
    error: Option<String>,
}

/// Narrow interface the summarizer depends on, so tests can substitute a
/// fake endpoint without standing up an HTTP server.
#[async_trait]
pub trait AgentEndpoint: Send + Sync {
    async fn invoke(&self, request: AgentRequest) -> Result<String>;
}

/// Production implementation: POSTs to the agent-execution URL and unwraps
/// the nested `{ success, data: { success, result, error } }` envelope.
pub struct HttpAgentEndpoint {
    client: Client,
    url: String,
    bearer_token: Option<String>,
}

impl HttpAgentEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS))
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            url: url.into(),
            bearer_token: None,
        }
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }
}

#[async_trait]
impl AgentEndpoint for HttpAgentEndpoint {
    async fn invoke(&self, request: AgentRequest) -> Result<String> {
        let mut builder = self.client.post(&self.url).json(&request);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Llm(format!("agent endpoint returned {status}: {body}")));
        }

        let envelope: AgentResponseEnvelope = response.json().await?;
        if !envelope.data.success {
            let message = envelope.data.error.unwrap_or_else(|| "unknown agent error".to_string());
            return Err(PipelineError::Llm(message));
        }

        envelope.data.result.ok_or_else(|| {
            warn!(url = %self.url, "agent reported success with no result field");
            PipelineError::Llm("agent response missing result".to_string())
        })
    }
}
