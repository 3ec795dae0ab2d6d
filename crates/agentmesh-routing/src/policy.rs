use agentmesh_breaker::{BreakerRegistry, BreakerState};
use agentmesh_registry::NodeRegistry;

use crate::engine::RoutedClassification;

/// Decides whether a follow-up message stays on the current remote
/// node, re-routes, or falls back to local.
pub struct RoutedSessionPolicy<'a> {
    registry: &'a NodeRegistry,
    breakers: &'a BreakerRegistry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutedResolution {
    StayRouted(String),
    ReRoute(String),
    Local { notice: Option<String> },
}

impl<'a> RoutedSessionPolicy<'a> {
    pub fn new(registry: &'a NodeRegistry, breakers: &'a BreakerRegistry) -> Self {
        Self { registry, breakers }
    }

    /// Explicit topic-shift keywords against the active node's declared
    /// collections force `local`.
    pub fn topic_shift(&self, active_node_slug: &str, message: &str) -> bool {
        let Some(node) = self.registry.get_by_slug(active_node_slug) else {
            return true;
        };
        let normalized_message = message.to_lowercase();
        let covers_any_collection = node
            .capabilities
            .collections
            .iter()
            .any(|c| normalized_message.contains(&c.to_lowercase()));
        !covers_any_collection && mentions_another_domain(&normalized_message, &node.capabilities.domain_tags)
    }

    /// Composes the breaker-open check, topic-shift check, and classifier
    /// result into a single resolution.
    pub fn resolve(
        &self,
        active_node_slug: &str,
        message: &str,
        classification: RoutedClassification,
        now_unix_ms: i64,
    ) -> RoutedResolution {
        let breaker = self.breakers.get_or_create(active_node_slug);
        if breaker.state() == BreakerState::Open {
            return RoutedResolution::Local {
                notice: Some(format!(
                    "{active_node_slug} has been unreachable; continuing locally"
                )),
            };
        }
        // acquiring/releasing a permit here would mutate breaker state just to
        // check it; `state()` alone is enough for a read-only policy check.
        let _ = now_unix_ms;

        if self.topic_shift(active_node_slug, message) {
            return RoutedResolution::Local { notice: None };
        }

        match classification {
            RoutedClassification::Continue => RoutedResolution::StayRouted(active_node_slug.to_string()),
            RoutedClassification::Local => RoutedResolution::Local { notice: None },
            RoutedClassification::ReRoute(slug) => {
                if self.registry.get_by_slug(&slug).is_some() {
                    RoutedResolution::ReRoute(slug)
                } else {
                    // Unknown slugs collapse to `local`.
                    RoutedResolution::Local { notice: None }
                }
            }
        }
    }
}

fn mentions_another_domain(message: &str, own_domains: &[String]) -> bool {
    const KNOWN_DOMAINS: &[&str] = &["invoices", "invoice", "billing", "email", "calendar", "contacts"];
    KNOWN_DOMAINS
        .iter()
        .any(|d| message.contains(d) && !own_domains.iter().any(|own| own.to_lowercase() == **d))
}
