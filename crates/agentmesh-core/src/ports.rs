use async_trait::async_trait;

use crate::error::CoreError;

/// A single prompt sent to the underlying LLM provider. The core never knows
/// which provider answers this — callers go through `LlmClient` only.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: Option<String>,
    pub user: String,
}

impl Prompt {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            system: None,
            user: user.into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Narrow port onto the underlying LLM provider.
/// Routing, the collector engine and tool-parameter extraction
/// depend on this trait only, never a concrete provider client.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: Prompt) -> Result<String, CoreError>;
}

/// A single semantic search hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub collection: String,
    pub score: f32,
    pub payload: serde_json::Value,
}

/// Narrow port onto the vector store. Backs the
/// `search_knowledge` action and the `/search`/`/aggregate` HTTP routes.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn search(
        &self,
        collections: &[String],
        query: &str,
        filters: Option<serde_json::Value>,
    ) -> Result<Vec<SearchHit>, CoreError>;

    async fn aggregate(
        &self,
        collection: &str,
        filters: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CoreError>;
}
