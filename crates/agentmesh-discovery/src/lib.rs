//! Enumerates local tools/collectors/collections,
//! merges remote catalogs, caches with a TTL, and renders the deterministic
//! routing digest consumed by the decision engine's prompt.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use agentmesh_core::error::CoreError;
use agentmesh_core::model::{CollectorDescriptor, NodeCapabilities, NodeRecord};
use agentmesh_registry::NodeRegistry;
use arc_swap::ArcSwap;
use async_trait::async_trait;

/// Fetches a peer's advertised capabilities, e.g. via `GET /capabilities`.
/// Kept as a narrow port so discovery never depends on the transport's
/// concrete HTTP machinery.
#[async_trait]
pub trait CapabilityFetcher: Send + Sync {
    async fn fetch_capabilities(&self, node: &NodeRecord) -> Result<NodeCapabilities, CoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct MergedCatalog {
    pub local: NodeCapabilities,
    pub remote: Vec<(String, NodeCapabilities)>,
}

impl MergedCatalog {
    pub fn all_tools(&self) -> Vec<(Option<&str>, &str)> {
        let mut out: Vec<(Option<&str>, &str)> = self
            .remote
            .iter()
            .flat_map(|(slug, caps)| caps.tools.iter().map(move |t| (Some(slug.as_str()), t.as_str())))
            .collect();
        out.extend(self.local.tools.iter().map(|t| (None, t.as_str())));
        out
    }

    pub fn all_collectors(&self, include_remote: bool) -> Vec<&CollectorDescriptor> {
        let mut out: Vec<&CollectorDescriptor> = self.local.collectors.iter().collect();
        if include_remote {
            out.extend(self.remote.iter().flat_map(|(_, caps)| caps.collectors.iter()));
        }
        out
    }

    pub fn all_collections(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.local.collections.iter().map(String::as_str).collect();
        out.extend(self.remote.iter().flat_map(|(_, caps)| caps.collections.iter().map(String::as_str)));
        out
    }
}

struct Snapshot {
    catalog: MergedCatalog,
    digest: String,
    built_at_unix_ms: i64,
}

/// Process-wide discovery cache, published through an `ArcSwap` snapshot so
/// routing/collector lookups never block behind a refresh in progress
/// (snapshot-swap, not a lock, so readers never block a refresh in flight).
pub struct DiscoveryCache {
    snapshot: ArcSwap<Snapshot>,
    ttl: Duration,
    last_invalidated_unix_ms: AtomicI64,
}

impl DiscoveryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot {
                catalog: MergedCatalog::default(),
                digest: String::new(),
                built_at_unix_ms: 0,
            }),
            ttl,
            last_invalidated_unix_ms: AtomicI64::new(0),
        }
    }

    pub fn is_stale(&self, now_unix_ms: i64) -> bool {
        let snapshot = self.snapshot.load();
        snapshot.built_at_unix_ms == 0
            || now_unix_ms - snapshot.built_at_unix_ms >= self.ttl.as_millis() as i64
            || snapshot.built_at_unix_ms < self.last_invalidated_unix_ms.load(Ordering::SeqCst)
    }

    /// Invalidates the cache, e.g. on a node health-status change. The next
    /// access triggers a refresh rather than serving stale data.
    pub fn invalidate(&self, now_unix_ms: i64) {
        self.last_invalidated_unix_ms.store(now_unix_ms, Ordering::SeqCst);
    }

    pub fn discover_tools(&self) -> Vec<String> {
        self.snapshot
            .load()
            .catalog
            .all_tools()
            .into_iter()
            .map(|(_, name)| name.to_string())
            .collect()
    }

    pub fn discover_collectors(&self, include_remote: bool) -> Vec<CollectorDescriptor> {
        self.snapshot
            .load()
            .catalog
            .all_collectors(include_remote)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn discover_collections(&self) -> Vec<String> {
        self.snapshot
            .load()
            .catalog
            .all_collections()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// A compact, deterministic text rendering of `(slug -> description,
    /// domains, headline collections)` for every active peer plus the local
    /// node, used to prime the routing LLM. Entries are sorted by slug so
    /// the rendered text is stable across refreshes of identical input.
    pub fn routing_digest(&self) -> String {
        self.snapshot.load().digest.clone()
    }

    pub async fn refresh(
        &self,
        local_slug: &str,
        local_capabilities: NodeCapabilities,
        registry: &NodeRegistry,
        fetcher: &dyn CapabilityFetcher,
        now_unix_ms: i64,
    ) -> Result<(), CoreError> {
        let mut remote = Vec::new();
        for node in registry.list_active() {
            if node.slug == local_slug {
                continue;
            }
            let caps = fetcher.fetch_capabilities(&node).await?;
            // Keeps `NodeRegistry`'s own record in sync with what this catalog
            // snapshot advertises, so `find_for_collection` and the
            // routed-session topic-shift check see the same declared
            // collections without depending on this cache.
            let _ = registry.update_capabilities(&node.slug, caps.clone());
            remote.push((node.slug.clone(), caps));
        }
        remote.sort_by(|a, b| a.0.cmp(&b.0));

        let catalog = MergedCatalog {
            local: local_capabilities.clone(),
            remote,
        };
        let digest = render_digest(local_slug, &local_capabilities, &catalog.remote);

        self.snapshot.store(std::sync::Arc::new(Snapshot {
            catalog,
            digest,
            built_at_unix_ms: now_unix_ms,
        }));
        tracing::debug!(node = %local_slug, "discovery cache refreshed");
        Ok(())
    }
}

/// Renders the digest with peers sorted by slug, which is what makes the
/// output byte-identical for identical input regardless of call order.
fn render_digest(local_slug: &str, local: &NodeCapabilities, remote: &[(String, NodeCapabilities)]) -> String {
    let mut out = String::new();
    let mut entries: Vec<(&str, &NodeCapabilities)> = vec![(local_slug, local)];
    entries.extend(remote.iter().map(|(slug, caps)| (slug.as_str(), caps)));
    entries.sort_by(|a, b| a.0.cmp(b.0));

    for (slug, caps) in entries {
        let domains = caps.domain_tags.join(",");
        let headline: Vec<&str> = caps.collections.iter().take(3).map(String::as_str).collect();
        let _ = writeln!(
            out,
            "{slug}: domains=[{domains}] collections=[{}]",
            headline.join(",")
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_core::model::NodeType;
    use agentmesh_registry::{NodeDescription, NodeRegistry};

    struct FakeFetcher;

    #[async_trait]
    impl CapabilityFetcher for FakeFetcher {
        async fn fetch_capabilities(&self, node: &NodeRecord) -> Result<NodeCapabilities, CoreError> {
            Ok(NodeCapabilities {
                tools: vec![format!("{}_tool", node.slug)],
                collectors: vec![],
                collections: vec!["email".into()],
                domain_tags: vec!["email".into()],
            })
        }
    }

    fn registry_with_mail() -> NodeRegistry {
        let registry = NodeRegistry::new();
        registry.register(NodeDescription {
            slug: "mail".into(),
            display_name: "Mail".into(),
            base_url: "http://mail".into(),
            node_type: NodeType::Child,
            version: "1.0".into(),
        });
        registry
    }

    #[tokio::test]
    async fn refresh_merges_remote_tools_with_local() {
        let cache = DiscoveryCache::new(Duration::from_secs(60));
        let registry = registry_with_mail();
        let local = NodeCapabilities {
            tools: vec!["local_tool".into()],
            collectors: vec![],
            collections: vec!["invoices".into()],
            domain_tags: vec!["billing".into()],
        };
        cache
            .refresh("master", local, &registry, &FakeFetcher, 0)
            .await
            .unwrap();
        let tools = cache.discover_tools();
        assert!(tools.contains(&"local_tool".to_string()));
        assert!(tools.contains(&"mail_tool".to_string()));
    }

    #[tokio::test]
    async fn digest_is_deterministic_for_identical_input() {
        let cache_a = DiscoveryCache::new(Duration::from_secs(60));
        let cache_b = DiscoveryCache::new(Duration::from_secs(60));
        let registry = registry_with_mail();
        let local = NodeCapabilities {
            domain_tags: vec!["billing".into()],
            collections: vec!["invoices".into()],
            ..Default::default()
        };
        cache_a
            .refresh("master", local.clone(), &registry, &FakeFetcher, 0)
            .await
            .unwrap();
        cache_b
            .refresh("master", local, &registry, &FakeFetcher, 1_000)
            .await
            .unwrap();
        assert_eq!(cache_a.routing_digest(), cache_b.routing_digest());
    }

    #[tokio::test]
    async fn empty_cache_is_stale() {
        let cache = DiscoveryCache::new(Duration::from_secs(60));
        assert!(cache.is_stale(0));
    }

    #[tokio::test]
    async fn invalidate_forces_staleness_even_within_ttl() {
        let cache = DiscoveryCache::new(Duration::from_secs(60));
        let registry = registry_with_mail();
        cache
            .refresh("master", NodeCapabilities::default(), &registry, &FakeFetcher, 0)
            .await
            .unwrap();
        assert!(!cache.is_stale(1));
        cache.invalidate(2);
        assert!(cache.is_stale(3));
    }
}
