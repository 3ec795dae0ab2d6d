//! Default `LlmClient` adapter: a thin OpenAI-compatible chat-completions
//! caller over `reqwest`. The concrete provider SDK is an external
//! collaborator — this adapter exists so the binary has something to hand
//! the orchestrator without depending on any one vendor's crate.

use agentmesh_core::error::CoreError;
use agentmesh_core::ports::{LlmClient, Prompt};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

pub struct HttpLlmClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: Prompt) -> Result<String, CoreError> {
        let mut messages = Vec::new();
        if let Some(system) = &prompt.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": prompt.user }));

        let body = json!({
            "model": self.model,
            "messages": messages,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::TransientPeer {
                node: "llm-provider".to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let payload: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
        if !status.is_success() {
            return Err(CoreError::TransientPeer {
                node: "llm-provider".to_string(),
                message: format!("status {status}: {payload}"),
            });
        }

        payload
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or(CoreError::ExtractionFailure)
    }
}
