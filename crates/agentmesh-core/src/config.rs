use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Process-level configuration. Loaded from
/// a TOML file and overridable by environment variables in
/// `agentmesh-service`; unknown keys are rejected here the same way
/// `RequestOptions` rejects them per-request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AgentMeshConfig {
    pub is_master: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_url: Option<String>,
    #[serde(default)]
    pub capability_tags: Vec<String>,
    pub cache: CacheConfig,
    pub connection_pool: ConnectionPoolConfig,
    pub breaker: BreakerConfig,
    #[serde(default = "default_max_step_executions")]
    pub max_workflow_step_executions: u32,
    pub default_engine: String,
    pub default_model: String,
    pub orchestration_model: String,
    #[serde(default)]
    pub local_collector_paths: Vec<String>,
    #[serde(default)]
    pub local_tool_paths: Vec<String>,
    #[serde(default = "default_routing_digest_ttl_seconds")]
    pub routing_digest_ttl_seconds: u64,
    #[serde(default)]
    pub user_profile_fields: Vec<String>,
    #[serde(default)]
    pub session_store: SessionStoreKind,
}

fn default_max_step_executions() -> u32 {
    20
}

fn default_routing_digest_ttl_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStoreKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    pub driver: String,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConnectionPoolConfig {
    pub max_per_node: u32,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_seconds() -> u64 {
    30
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }
}

impl AgentMeshConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, CoreError> {
        toml::from_str(raw).map_err(|e| CoreError::Configuration(e.to_string()))
    }
}
