use std::collections::HashMap;
use std::sync::Arc;

use agentmesh_core::error::CoreError;
use async_trait::async_trait;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub expires_at_unix_ms: i64,
}

/// Exchanges a refresh token for a fresh bearer credential for `node`.
/// A single-flight OAuth refresh gate, generalized
/// per-node.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn refresh(&self, node_slug: &str) -> Result<Credential, CoreError>;
}

struct CacheEntry {
    credential: Credential,
}

/// Caches one credential per node, guarded so only one refresh is in flight
/// per node at a time.
#[derive(Default)]
pub struct CredentialPool {
    cache: Mutex<HashMap<String, CacheEntry>>,
    refresh_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialPool {
    async fn gate_for(&self, node_slug: &str) -> Arc<Mutex<()>> {
        let mut gates = self.refresh_gates.lock().await;
        gates
            .entry(node_slug.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn get_or_refresh(
        &self,
        node_slug: &str,
        source: &dyn CredentialSource,
        now_unix_ms: i64,
    ) -> Result<Credential, CoreError> {
        if let Some(entry) = self.cache.lock().await.get(node_slug) {
            if entry.credential.expires_at_unix_ms > now_unix_ms {
                return Ok(entry.credential.clone());
            }
        }

        let gate = self.gate_for(node_slug).await;
        let _held = gate.lock().await;

        // Re-check under the gate: another caller may have just refreshed.
        if let Some(entry) = self.cache.lock().await.get(node_slug) {
            if entry.credential.expires_at_unix_ms > now_unix_ms {
                return Ok(entry.credential.clone());
            }
        }

        let fresh = source.refresh(node_slug).await?;
        self.cache.lock().await.insert(
            node_slug.to_string(),
            CacheEntry {
                credential: fresh.clone(),
            },
        );
        Ok(fresh)
    }

    pub async fn invalidate(&self, node_slug: &str) {
        self.cache.lock().await.remove(node_slug);
    }
}
