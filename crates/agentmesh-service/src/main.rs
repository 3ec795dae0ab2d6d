mod auth;
mod capabilities;
mod llm;
mod local_descriptors;
mod routes;
mod state;

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use agentmesh_breaker::BreakerRegistry;
use agentmesh_core::config::{AgentMeshConfig, SessionStoreKind};
use agentmesh_core::error::CoreError;
use agentmesh_core::model::NodeCapabilities;
use agentmesh_core::ports::LlmClient;
use agentmesh_core::store::{MemorySessionStore, SessionStore, SqliteSessionStore};
use agentmesh_discovery::DiscoveryCache;
use agentmesh_orchestrator::Orchestrator;
use agentmesh_registry::NodeRegistry;
use agentmesh_tools::{ToolDispatcher, ToolRegistry};
use agentmesh_transport::{Clock, ConnectionPool, Credential, CredentialSource, NodeTransport, SystemClock};
use async_trait::async_trait;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;

use crate::capabilities::HttpCapabilityFetcher;
use crate::state::{now_unix_ms, AppState};

#[derive(Debug, Parser)]
#[command(name = "agentmesh-service", about = "Federated agent orchestration runtime")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "agentmesh.toml")]
    config: String,

    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// This node's registry slug.
    #[arg(long, default_value = "master")]
    slug: String,

    /// Overrides the caller bearer key otherwise read from
    /// `AGENTMESH_BEARER_KEY`.
    #[arg(long)]
    auth_key: Option<String>,

    /// SQLite file path, used when the config selects the sqlite session store.
    #[arg(long, default_value = "agentmesh.db")]
    session_store_path: String,
}

/// Static, config-supplied bearer credentials used to authenticate outbound
/// calls to peer nodes. A real OAuth exchange is an external collaborator
/// (no IdP is in scope); this is the simplest `CredentialSource` that still
/// respects the single-flight refresh gate `CredentialPool` provides —
/// "refreshing" here just re-reads the configured secret.
struct StaticCredentialSource {
    peer_credentials: HashMap<String, String>,
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn refresh(&self, node_slug: &str) -> Result<Credential, CoreError> {
        self.peer_credentials
            .get(node_slug)
            .map(|token| Credential {
                token: token.clone(),
                expires_at_unix_ms: i64::MAX,
            })
            .ok_or_else(|| CoreError::Auth {
                node: node_slug.to_string(),
                message: "no credential configured for this peer".to_string(),
            })
    }
}

fn exit_code_for(err: &CoreError) -> ExitCode {
    match err {
        CoreError::Configuration(_) => ExitCode::from(1),
        CoreError::ContextStore(_) => ExitCode::from(2),
        CoreError::TransientPeer { .. } | CoreError::NodeUnavailable { .. } | CoreError::Timeout(_) => {
            ExitCode::from(3)
        }
        _ => ExitCode::from(1),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "startup failed");
            exit_code_for(&err)
        }
    }
}

async fn run() -> Result<(), CoreError> {
    let args = Args::parse();

    let raw_config = std::fs::read_to_string(&args.config)
        .map_err(|e| CoreError::Configuration(format!("reading {}: {e}", args.config)))?;
    let config = AgentMeshConfig::from_toml_str(&raw_config)?;

    let bearer_key = args
        .auth_key
        .or_else(|| std::env::var("AGENTMESH_BEARER_KEY").ok())
        .ok_or_else(|| CoreError::Configuration("no bearer key: pass --auth-key or set AGENTMESH_BEARER_KEY".into()))?;

    let store: Arc<dyn SessionStore> = match config.session_store {
        SessionStoreKind::Sqlite => Arc::new(SqliteSessionStore::open(&args.session_store_path)?),
        SessionStoreKind::Memory => Arc::new(MemorySessionStore::new()),
    };

    let registry = Arc::new(NodeRegistry::new());
    let breakers = Arc::new(BreakerRegistry::new(config.breaker.failure_threshold, config.breaker.cooldown()));

    let peer_credentials: HashMap<String, String> = std::env::var("AGENTMESH_PEER_CREDENTIALS")
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    let credential_source: Arc<dyn CredentialSource> = Arc::new(StaticCredentialSource { peer_credentials });
    let pool = ConnectionPool::new(config.connection_pool.max_per_node as usize);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let transport = Arc::new(NodeTransport::new(registry.clone(), breakers.clone(), credential_source, pool, clock));

    let discovery = Arc::new(DiscoveryCache::new(Duration::from_secs(config.routing_digest_ttl_seconds)));
    let capability_fetcher: Arc<dyn agentmesh_discovery::CapabilityFetcher> = Arc::new(HttpCapabilityFetcher::new());

    let collectors = local_descriptors::load_collectors(&config.local_collector_paths)?;

    let mut tool_registry = ToolRegistry::new();
    local_descriptors::load_tools(&config.local_tool_paths, &mut tool_registry)?;
    let tools = Arc::new(tool_registry);
    let tool_dispatcher = Arc::new(ToolDispatcher::new(tools.clone(), transport.clone()));

    let llm_base_url = std::env::var("AGENTMESH_LLM_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
    let llm_api_key = std::env::var("AGENTMESH_LLM_API_KEY").unwrap_or_default();
    let llm: Arc<dyn LlmClient> = Arc::new(llm::HttpLlmClient::new(llm_base_url, llm_api_key, config.default_model.clone()));

    let vector_search: Option<Arc<dyn agentmesh_core::ports::VectorSearch>> = None;

    let local_capabilities = NodeCapabilities {
        tools: tools.names(),
        collectors: collectors.values().cloned().collect(),
        collections: Vec::new(),
        domain_tags: config.capability_tags.clone(),
    };

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        registry.clone(),
        transport.clone(),
        breakers.clone(),
        discovery.clone(),
        llm,
        tools.clone(),
        vector_search.clone(),
        collectors.clone(),
        config.max_workflow_step_executions,
    ));

    if let Err(err) = discovery
        .refresh(&args.slug, local_capabilities.clone(), &registry, capability_fetcher.as_ref(), now_unix_ms())
        .await
    {
        tracing::warn!(error = %err, "initial discovery refresh failed, continuing with an empty catalog");
    }

    let app_state = Arc::new(AppState {
        orchestrator,
        registry,
        discovery,
        breakers,
        transport,
        tool_dispatcher,
        vector_search,
        capability_fetcher,
        collectors,
        local_slug: args.slug,
        local_capabilities,
        bearer_key,
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at_unix_ms: now_unix_ms(),
    });

    let protected = Router::new()
        .route("/register", post(routes::register))
        .route("/execute", post(routes::execute))
        .route("/search", post(routes::search))
        .route("/aggregate", post(routes::aggregate))
        .route("/discover/refresh", post(routes::refresh_discovery))
        .route_layer(middleware::from_fn_with_state(app_state.clone(), auth::require_bearer));

    let app = Router::new()
        .route("/chat", post(routes::chat))
        .route("/health", get(routes::health))
        .route("/collections", get(routes::collections))
        .route("/capabilities", get(routes::capabilities))
        .route("/auth/refresh", post(routes::auth_refresh))
        .route("/dashboard", get(routes::dashboard))
        .route("/health/ping", post(routes::health_ping))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .map_err(|e| CoreError::Configuration(format!("binding {}: {e}", args.bind)))?;
    tracing::info!(addr = %args.bind, "agentmesh-service listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| CoreError::Configuration(e.to_string()))?;
    Ok(())
}
