use std::collections::HashMap;
use std::sync::Arc;

use agentmesh_breaker::BreakerRegistry;
use agentmesh_core::model::{CollectorDescriptor, NodeCapabilities};
use agentmesh_core::ports::VectorSearch;
use agentmesh_discovery::{CapabilityFetcher, DiscoveryCache};
use agentmesh_orchestrator::Orchestrator;
use agentmesh_registry::NodeRegistry;
use agentmesh_tools::ToolDispatcher;
use agentmesh_transport::NodeTransport;

/// Everything an axum handler needs, shared behind one `Arc<AppState>`.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<NodeRegistry>,
    pub discovery: Arc<DiscoveryCache>,
    pub breakers: Arc<BreakerRegistry>,
    pub transport: Arc<NodeTransport>,
    pub tool_dispatcher: Arc<ToolDispatcher>,
    pub vector_search: Option<Arc<dyn VectorSearch>>,
    pub capability_fetcher: Arc<dyn CapabilityFetcher>,
    pub collectors: HashMap<String, CollectorDescriptor>,
    pub local_slug: String,
    pub local_capabilities: NodeCapabilities,
    pub bearer_key: String,
    pub version: String,
    pub started_at_unix_ms: i64,
}

pub fn now_unix_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}
