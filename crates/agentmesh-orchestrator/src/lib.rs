//! Composition root: owns every shared collaborator, drives the per-request
//! pipeline, and serializes work per session.

mod handlers;

pub use handlers::{Handler, HandlerRegistry, HandlerResult};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agentmesh_breaker::BreakerRegistry;
use agentmesh_core::error::CoreError;
use agentmesh_core::model::{Action, CollectorDescriptor, Decision};
use agentmesh_core::ports::{LlmClient, VectorSearch};
use agentmesh_core::store::SessionStore;
use agentmesh_discovery::DiscoveryCache;
use agentmesh_registry::NodeRegistry;
use agentmesh_routing::{RoutedResolution, RoutedSessionPolicy, RoutingDecisionEngine};
use agentmesh_tools::{ToolDispatcher, ToolRegistry};
use agentmesh_transport::NodeTransport;
use parking_lot::Mutex as SyncMutex;
use tokio_util::sync::CancellationToken;

/// Collaborators a handler needs, bundled so `Handler::handle` takes one
/// extra argument instead of five.
pub struct Deps {
    pub llm: Arc<dyn LlmClient>,
    pub transport: Arc<NodeTransport>,
    pub tools: Arc<ToolRegistry>,
    pub tool_dispatcher: Arc<ToolDispatcher>,
    pub vector_search: Option<Arc<dyn VectorSearch>>,
    pub pending_message: String,
    pub max_step_executions: u32,
}

const PEER_FORWARD_TIMEOUT: Duration = Duration::from_secs(30);
const LLM_CALL_TIMEOUT: Duration = Duration::from_secs(20);

pub struct Response {
    pub text: String,
    pub metadata: Option<serde_json::Value>,
    pub needs_user_input: bool,
}

pub struct Orchestrator {
    store: Arc<dyn SessionStore>,
    registry: Arc<NodeRegistry>,
    transport: Arc<NodeTransport>,
    breakers: Arc<BreakerRegistry>,
    discovery: Arc<DiscoveryCache>,
    llm: Arc<dyn LlmClient>,
    routing_engine: RoutingDecisionEngine,
    tools: Arc<ToolRegistry>,
    tool_dispatcher: Arc<ToolDispatcher>,
    vector_search: Option<Arc<dyn VectorSearch>>,
    collectors: HashMap<String, CollectorDescriptor>,
    handlers: HandlerRegistry,
    max_step_executions: u32,
    session_locks: SyncMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<NodeRegistry>,
        transport: Arc<NodeTransport>,
        breakers: Arc<BreakerRegistry>,
        discovery: Arc<DiscoveryCache>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        vector_search: Option<Arc<dyn VectorSearch>>,
        collectors: HashMap<String, CollectorDescriptor>,
        max_step_executions: u32,
    ) -> Self {
        let tool_dispatcher = Arc::new(ToolDispatcher::new(tools.clone(), transport.clone()));
        let handlers = HandlerRegistry::with_defaults(collectors.clone());
        Self {
            store,
            registry,
            transport,
            breakers,
            discovery,
            routing_engine: RoutingDecisionEngine::new(llm.clone()),
            llm,
            tools,
            tool_dispatcher,
            vector_search,
            collectors,
            handlers,
            max_step_executions,
            session_locks: SyncMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.session_locks
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Runs one request end to end: load, append, decide, execute, append,
    /// save. Cancellable — if `token` fires mid-flight, already-applied
    /// context mutations are still flushed before returning.
    pub async fn handle_message(
        &self,
        session_id: &str,
        caller_id: Option<&str>,
        message: &str,
        token: CancellationToken,
    ) -> Result<Response, CoreError> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let mut ctx = self.store.load(session_id, caller_id).await?;
        ctx.append_user(message);

        let decision = tokio::select! {
            result = self.decide(&mut ctx, message) => result?,
            _ = token.cancelled() => {
                self.store.save(&ctx).await?;
                return Err(CoreError::Timeout(Duration::from_secs(0)));
            }
        };

        let deps = Deps {
            llm: self.llm.clone(),
            transport: self.transport.clone(),
            tools: self.tools.clone(),
            tool_dispatcher: self.tool_dispatcher.clone(),
            vector_search: self.vector_search.clone(),
            pending_message: message.to_string(),
            max_step_executions: self.max_step_executions,
        };

        let result = tokio::select! {
            result = self.execute(&mut ctx, decision, &deps) => result,
            _ = token.cancelled() => {
                self.store.save(&ctx).await?;
                return Err(CoreError::Timeout(Duration::from_secs(0)));
            }
        };

        let response = match result {
            HandlerResult::Success { text, metadata } => Response { text, metadata, needs_user_input: false },
            HandlerResult::NeedsUserInput { prompt } => Response { text: prompt, metadata: None, needs_user_input: true },
            HandlerResult::Failure { message } => {
                tracing::warn!(session_id, error = %message, "handler failed, returning conversational fallback");
                Response {
                    text: "Sorry, I ran into a problem handling that — could you try again?".to_string(),
                    metadata: None,
                    needs_user_input: false,
                }
            }
        };

        ctx.append_assistant(response.text.clone(), response.metadata.clone());
        ctx.version += 1;
        self.store.save(&ctx).await?;

        Ok(response)
    }

    async fn decide(&self, ctx: &mut agentmesh_core::model::SessionContext, message: &str) -> Result<Decision, CoreError> {
        if let Some(routed) = ctx.routed_to_node.clone() {
            // Short follow-ups ("1", "yes") stay routed without a classifier call.
            if let Some(decision) = agentmesh_routing::decide_fast_path(ctx, message) {
                return Ok(decision);
            }
            let policy = RoutedSessionPolicy::new(&self.registry, &self.breakers);
            let other_digests = self.discovery.routing_digest();
            let active_summary = format!("routed to {}", routed.slug);
            let classification = self
                .routing_engine
                .classify_routed_followup(ctx, &active_summary, &other_digests, message)
                .await?;
            let now = 0;
            return Ok(match policy.resolve(&routed.slug, message, classification, now) {
                RoutedResolution::StayRouted(slug) => Decision::new(Action::RouteToNode, Some(slug), "staying on routed node"),
                RoutedResolution::ReRoute(slug) => Decision::new(Action::RouteToNode, Some(slug), "re-routing to a better-fit node"),
                RoutedResolution::Local { notice } => {
                    ctx.routed_to_node = None;
                    Decision::new(Action::Conversational, None, notice.unwrap_or_else(|| "returning to local handling".to_string()))
                }
            });
        }

        let digest = self.discovery.routing_digest();
        let catalog_summary = self.discovery.discover_tools().join(", ");
        self.routing_engine.decide(ctx, message, &digest, &catalog_summary, "").await
    }

    async fn execute(
        &self,
        ctx: &mut agentmesh_core::model::SessionContext,
        decision: Decision,
        deps: &Deps,
    ) -> HandlerResult {
        let action = decision.action;
        let Some(handler) = self.handlers.get(action) else {
            return HandlerResult::Failure { message: format!("no handler registered for {action:?}") };
        };
        handler.handle(ctx, decision, deps).await
    }
}

/// Wraps a suspension point with its per-operation timeout, treating
/// elapsed time the same as the underlying collaborator failing outright.
pub async fn with_peer_timeout<F, T>(fut: F) -> Result<T, CoreError>
where
    F: std::future::Future<Output = Result<T, CoreError>>,
{
    tokio::time::timeout(PEER_FORWARD_TIMEOUT, fut)
        .await
        .unwrap_or_else(|_| Err(CoreError::Timeout(PEER_FORWARD_TIMEOUT)))
}

pub async fn with_llm_timeout<F, T>(fut: F) -> Result<T, CoreError>
where
    F: std::future::Future<Output = Result<T, CoreError>>,
{
    tokio::time::timeout(LLM_CALL_TIMEOUT, fut)
        .await
        .unwrap_or_else(|_| Err(CoreError::Timeout(LLM_CALL_TIMEOUT)))
}
