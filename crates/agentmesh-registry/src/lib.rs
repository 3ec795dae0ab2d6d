//! Source of truth for peer nodes, their declared
//! capabilities, and health.

use std::collections::HashMap;

use agentmesh_core::model::{HealthMetrics, NodeCapabilities, NodeRecord, NodeStatus, NodeType, RateLimitWindow};
use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no node registered with slug {0}")]
    NotFound(String),
    #[error("rate limit exceeded for node {0}")]
    RateLimited(String),
}

/// Fields supplied by a caller registering itself as a peer node.
#[derive(Debug, Clone)]
pub struct NodeDescription {
    pub slug: String,
    pub display_name: String,
    pub base_url: String,
    pub node_type: NodeType,
    pub version: String,
}

/// A single health probe observation, fed into the rolling estimators.
#[derive(Debug, Clone, Copy)]
pub struct HealthSample {
    pub latency_ms: f64,
    pub success: bool,
    pub observed_at_unix_ms: i64,
}

/// Fleet-wide node counts, used by the `/dashboard` route.
#[derive(Debug, Clone, Default)]
pub struct RegistryStatistics {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub error: usize,
}

struct Entry {
    record: NodeRecord,
    credential: String,
    consecutive_ping_failures_since_active: u32,
}

/// Holds every known `NodeRecord` behind a single `RwLock`. Reads never hold
/// the lock across an `.await` — every lookup clones the matched record(s)
/// out before returning, so no caller ever blocks a refresh on a pending
/// peer call or LLM round-trip.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Entry>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent by slug: a second `register` for an existing slug rotates
    /// the credential and refreshes metadata but preserves identity.
    pub fn register(&self, description: NodeDescription) -> (NodeRecord, String) {
        let mut nodes = self.nodes.write();
        let credential = Uuid::new_v4().to_string();
        let entry = nodes
            .entry(description.slug.clone())
            .and_modify(|existing| {
                existing.record.display_name = description.display_name.clone();
                existing.record.base_url = description.base_url.clone();
                existing.record.node_type = description.node_type;
                existing.record.version = description.version.clone();
                existing.record.status = NodeStatus::Active;
                existing.credential = credential.clone();
                existing.consecutive_ping_failures_since_active = 0;
            })
            .or_insert_with(|| Entry {
                record: NodeRecord {
                    slug: description.slug.clone(),
                    display_name: description.display_name.clone(),
                    base_url: description.base_url.clone(),
                    node_type: description.node_type,
                    status: NodeStatus::Active,
                    capabilities: Default::default(),
                    version: description.version.clone(),
                    health: HealthMetrics::default(),
                    rate_limit: RateLimitWindow::default(),
                    active_connections: 0,
                },
                credential: credential.clone(),
                consecutive_ping_failures_since_active: 0,
            });
        (entry.record.clone(), entry.credential.clone())
    }

    pub fn get_by_slug(&self, slug: &str) -> Option<NodeRecord> {
        self.nodes.read().get(slug).map(|e| e.record.clone())
    }

    pub fn list_active(&self) -> Vec<NodeRecord> {
        self.nodes
            .read()
            .values()
            .filter(|e| e.record.status == NodeStatus::Active)
            .map(|e| e.record.clone())
            .collect()
    }

    /// Matches by exact collection name, then by normalized singular/plural
    /// form; returns the least-loaded active match.
    pub fn find_for_collection(&self, name: &str) -> Option<NodeRecord> {
        let normalized = normalize_collection_name(name);
        let nodes = self.nodes.read();
        let mut candidates: Vec<&NodeRecord> = nodes
            .values()
            .filter(|e| e.record.status == NodeStatus::Active)
            .map(|e| &e.record)
            .filter(|record| {
                record
                    .capabilities
                    .collections
                    .iter()
                    .any(|c| c == name || normalize_collection_name(c) == normalized)
            })
            .collect();
        candidates.sort_by(|a, b| a.load().partial_cmp(&b.load()).unwrap());
        candidates.into_iter().next().cloned()
    }

    /// Three consecutive ping failures transition status to `error`; one
    /// successful ping restores `active`.
    pub fn update_health(&self, slug: &str, sample: HealthSample) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write();
        let entry = nodes
            .get_mut(slug)
            .ok_or_else(|| RegistryError::NotFound(slug.to_string()))?;

        const LATENCY_SMOOTHING: f64 = 0.2;
        const SUCCESS_SMOOTHING: f64 = 0.2;

        let health = &mut entry.record.health;
        health.avg_latency_ms = if health.last_seen_unix_ms == 0 {
            sample.latency_ms
        } else {
            health.avg_latency_ms * (1.0 - LATENCY_SMOOTHING) + sample.latency_ms * LATENCY_SMOOTHING
        };
        let observed = if sample.success { 1.0 } else { 0.0 };
        health.success_rate = if health.last_seen_unix_ms == 0 {
            observed
        } else {
            health.success_rate * (1.0 - SUCCESS_SMOOTHING) + observed * SUCCESS_SMOOTHING
        };
        health.last_seen_unix_ms = sample.observed_at_unix_ms;

        if sample.success {
            health.consecutive_ping_failures = 0;
            entry.consecutive_ping_failures_since_active = 0;
            entry.record.status = NodeStatus::Active;
        } else {
            health.consecutive_ping_failures += 1;
            entry.consecutive_ping_failures_since_active += 1;
            if entry.consecutive_ping_failures_since_active >= 3 {
                entry.record.status = NodeStatus::Error;
            }
        }
        Ok(())
    }

    /// Records a peer's advertised capabilities against its registry entry,
    /// called after a discovery fetch so `find_for_collection` and the
    /// routed-session topic-shift check see the same declared collections
    /// and domain tags the discovery digest was built from.
    pub fn update_capabilities(&self, slug: &str, capabilities: NodeCapabilities) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write();
        let entry = nodes.get_mut(slug).ok_or_else(|| RegistryError::NotFound(slug.to_string()))?;
        entry.record.capabilities = capabilities;
        Ok(())
    }

    pub fn get_health_report(&self, slug: &str) -> Option<HealthMetrics> {
        self.nodes.read().get(slug).map(|e| e.record.health.clone())
    }

    /// Sets the rate-limit window for a node (limit per `window_seconds`).
    pub fn configure_rate_limit(&self, slug: &str, limit_per_window: u32, window_seconds: u32) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write();
        let entry = nodes
            .get_mut(slug)
            .ok_or_else(|| RegistryError::NotFound(slug.to_string()))?;
        entry.record.rate_limit.limit_per_window = limit_per_window;
        entry.record.rate_limit.window_seconds = window_seconds;
        Ok(())
    }

    /// Checks and atomically consumes one unit of the node's rate-limit
    /// window. Called before a connection is acquired from the pool,
    /// independent of breaker state.
    pub fn check_and_consume_rate_limit(&self, slug: &str, now_unix_ms: i64) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write();
        let entry = nodes
            .get_mut(slug)
            .ok_or_else(|| RegistryError::NotFound(slug.to_string()))?;
        let rl = &mut entry.record.rate_limit;
        if rl.limit_per_window == 0 {
            return Ok(());
        }
        let window_ms = rl.window_seconds as i64 * 1000;
        if rl.window_started_unix_ms == 0 || now_unix_ms - rl.window_started_unix_ms >= window_ms {
            rl.window_started_unix_ms = now_unix_ms;
            rl.used_in_window = 0;
        }
        if rl.used_in_window >= rl.limit_per_window {
            return Err(RegistryError::RateLimited(slug.to_string()));
        }
        rl.used_in_window += 1;
        Ok(())
    }

    /// Constant-shape comparison isn't worth it here: the credential is a
    /// per-node random UUID, not a shared secret guarding multiple nodes.
    pub fn authenticate(&self, slug: &str, token: &str) -> bool {
        self.nodes.read().get(slug).map(|e| e.credential == token).unwrap_or(false)
    }

    /// Issues a fresh credential for an already-registered node, used by the
    /// inbound `/auth/refresh` route.
    pub fn rotate_credential(&self, slug: &str) -> Result<String, RegistryError> {
        let mut nodes = self.nodes.write();
        let entry = nodes.get_mut(slug).ok_or_else(|| RegistryError::NotFound(slug.to_string()))?;
        entry.credential = Uuid::new_v4().to_string();
        Ok(entry.credential.clone())
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let nodes = self.nodes.read();
        let mut stats = RegistryStatistics {
            total: nodes.len(),
            ..Default::default()
        };
        for entry in nodes.values() {
            match entry.record.status {
                NodeStatus::Active => stats.active += 1,
                NodeStatus::Inactive => stats.inactive += 1,
                NodeStatus::Error => stats.error += 1,
            }
        }
        stats
    }
}

fn normalize_collection_name(name: &str) -> String {
    let lower = name.to_lowercase();
    lower
        .strip_suffix('s')
        .map(str::to_string)
        .unwrap_or(lower)
}
