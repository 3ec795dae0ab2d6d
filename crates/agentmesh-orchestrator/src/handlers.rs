//! `Handler` trait, `HandlerResult`, and the handler registry mapping each
//! `Action` to its implementation.

use std::collections::HashMap;
use std::sync::Arc;

use agentmesh_core::model::{Action, CollectorDescriptor, Decision, SessionContext};
use async_trait::async_trait;

use crate::Deps;

/// Outcome of a single handler invocation. A tagged variant, never an
/// exception: handler-level failures become `Failure` and are turned into a
/// user-safe conversational reply by the orchestrator, not propagated.
#[derive(Debug, Clone)]
pub enum HandlerResult {
    Success { text: String, metadata: Option<serde_json::Value> },
    NeedsUserInput { prompt: String },
    Failure { message: String },
}

impl HandlerResult {
    pub fn success(text: impl Into<String>) -> Self {
        HandlerResult::Success { text: text.into(), metadata: None }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut SessionContext, decision: Decision, deps: &Deps) -> HandlerResult;
}

/// Maps each `Action` to a boxed handler, registered once at startup rather
/// than looked up through reflection.
pub struct HandlerRegistry {
    handlers: HashMap<Action, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    pub fn register(&mut self, action: Action, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers.insert(action, handler);
        self
    }

    pub fn get(&self, action: Action) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&action).cloned()
    }

    /// A registry wired with every default handler, keyed by the collector
    /// descriptors known at startup.
    pub fn with_defaults(collectors: HashMap<String, CollectorDescriptor>) -> Self {
        let mut registry = Self::new();
        let collectors = Arc::new(collectors);
        registry
            .register(Action::StartCollector, Arc::new(StartCollectorHandler { collectors: collectors.clone() }))
            .register(Action::ContinueCollector, Arc::new(ContinueCollectorHandler { collectors: collectors.clone() }))
            .register(Action::UseTool, Arc::new(UseToolHandler))
            .register(Action::RouteToNode, Arc::new(RouteToNodeHandler))
            .register(Action::ResumeSession, Arc::new(ResumeSessionHandler))
            .register(Action::PauseAndHandle, Arc::new(PauseAndHandleHandler))
            .register(Action::SearchKnowledge, Arc::new(SearchKnowledgeHandler))
            .register(Action::Conversational, Arc::new(ConversationalHandler))
            .register(Action::ResolvePositionalReference, Arc::new(ResolvePositionalReferenceHandler));
        registry
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct StartCollectorHandler {
    collectors: Arc<HashMap<String, CollectorDescriptor>>,
}

#[async_trait]
impl Handler for StartCollectorHandler {
    async fn handle(&self, ctx: &mut SessionContext, decision: Decision, deps: &Deps) -> HandlerResult {
        let Some(name) = decision.resource else {
            return HandlerResult::Failure { message: "start_collector decision missing a resource".into() };
        };
        let Some(descriptor) = self.collectors.get(&name) else {
            return HandlerResult::Failure { message: format!("unknown collector {name}") };
        };
        let engine = agentmesh_collector::CollectorEngine::new(deps.llm.as_ref(), deps.max_step_executions);
        engine.start(ctx, descriptor);
        run_collector_turn(&engine, ctx, descriptor, &deps.pending_message, deps, &self.collectors).await
    }
}

struct ContinueCollectorHandler {
    collectors: Arc<HashMap<String, CollectorDescriptor>>,
}

#[async_trait]
impl Handler for ContinueCollectorHandler {
    async fn handle(&self, ctx: &mut SessionContext, _decision: Decision, deps: &Deps) -> HandlerResult {
        let Some(name) = ctx.active_collector.as_ref().map(|a| a.name.clone()) else {
            return HandlerResult::Failure { message: "continue_collector with no active collector".into() };
        };
        let Some(descriptor) = self.collectors.get(&name) else {
            return HandlerResult::Failure { message: format!("unknown collector {name}") };
        };
        let engine = agentmesh_collector::CollectorEngine::new(deps.llm.as_ref(), deps.max_step_executions);
        run_collector_turn(&engine, ctx, descriptor, &deps.pending_message, deps, &self.collectors).await
    }
}

async fn run_collector_turn(
    engine: &agentmesh_collector::CollectorEngine<'_>,
    ctx: &mut SessionContext,
    descriptor: &CollectorDescriptor,
    message: &str,
    deps: &Deps,
    collectors: &HashMap<String, CollectorDescriptor>,
) -> HandlerResult {
    match engine.advance(ctx, descriptor, message).await {
        Ok(agentmesh_collector::CollectorOutcome::Continue { prompt_text }) => HandlerResult::success(prompt_text),
        Ok(agentmesh_collector::CollectorOutcome::Suspended { child_collector, prompt_text }) => {
            match collectors.get(&child_collector) {
                Some(child_descriptor) => {
                    // Switch the active collector to the child so the next
                    // turn continues it instead of re-asking the parent's
                    // still-unresolved field.
                    engine.start(ctx, child_descriptor);
                    HandlerResult::success(prompt_text)
                }
                None => HandlerResult::Failure { message: format!("unknown child collector {child_collector}") },
            }
        }
        Ok(agentmesh_collector::CollectorOutcome::Completed { collected_data }) => {
            finish_collector(engine, ctx, descriptor, collected_data, deps, collectors).await
        }
        Ok(agentmesh_collector::CollectorOutcome::Cancelled) => {
            ctx.active_collector = None;
            ctx.workflow_stack.clear();
            HandlerResult::success("Okay, cancelled.")
        }
        Err(err) => HandlerResult::Failure { message: err.to_string() },
    }
}

/// Hands the collected data off to `descriptor.completion_action`'s tool, if
/// one is declared, so the reply can reference the entity the tool created
/// rather than just echoing the collected fields back.
async fn complete_collector(
    descriptor: &CollectorDescriptor,
    collected_data: serde_json::Value,
    deps: &Deps,
) -> HandlerResult {
    let Some(tool_name) = &descriptor.completion_action else {
        return HandlerResult::Success {
            text: "Done — here's a summary of what was collected.".into(),
            metadata: Some(collected_data),
        };
    };
    match deps.tool_dispatcher.invoke(tool_name, collected_data).await {
        Ok(result) => {
            let entity_id = result.get("id").and_then(|v| v.as_str()).unwrap_or("unknown");
            HandlerResult::Success {
                text: format!("Done — created {entity_id}."),
                metadata: Some(result),
            }
        }
        Err(err) => HandlerResult::Failure { message: err.to_string() },
    }
}

/// Runs `descriptor`'s completion action, then either hands the reply back
/// (top-level collector) or, if a parent workflow is suspended waiting on
/// this one, merges the resolved entity id into the parent and resumes it —
/// so a sub-flow's completion never re-invokes the parent's own completion
/// tool a second time.
async fn finish_collector(
    engine: &agentmesh_collector::CollectorEngine<'_>,
    ctx: &mut SessionContext,
    descriptor: &CollectorDescriptor,
    collected_data: serde_json::Value,
    deps: &Deps,
    collectors: &HashMap<String, CollectorDescriptor>,
) -> HandlerResult {
    let result = complete_collector(descriptor, collected_data, deps).await;

    let Some(parent_frame) = ctx.workflow_stack.last().cloned() else {
        ctx.active_collector = None;
        return result;
    };

    let (text, metadata) = match result {
        HandlerResult::Success { text, metadata } => (text, metadata),
        other => return other,
    };
    let entity_id = metadata
        .as_ref()
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let Some(parent_descriptor) = collectors.get(&parent_frame.workflow) else {
        return HandlerResult::Failure { message: format!("unknown parent collector {}", parent_frame.workflow) };
    };
    engine.resume_parent(ctx, &entity_id, parent_descriptor);
    HandlerResult::success(format!("{text} Continuing with {}.", parent_descriptor.goal))
}

struct UseToolHandler;

#[async_trait]
impl Handler for UseToolHandler {
    async fn handle(&self, _ctx: &mut SessionContext, decision: Decision, deps: &Deps) -> HandlerResult {
        let Some(tool_name) = decision.resource else {
            return HandlerResult::Failure { message: "use_tool decision missing a resource".into() };
        };
        let Some(descriptor) = deps.tools.descriptor(&tool_name).cloned() else {
            return HandlerResult::Failure { message: format!("unknown tool {tool_name}") };
        };
        let args = agentmesh_tools::extract_parameters(deps.llm.as_ref(), &descriptor, &deps.pending_message).await;
        match deps.tool_dispatcher.invoke(&tool_name, args).await {
            Ok(result) => HandlerResult::Success {
                text: format!("Done — {tool_name} completed."),
                metadata: Some(result),
            },
            Err(err) => HandlerResult::Failure { message: err.to_string() },
        }
    }
}

struct RouteToNodeHandler;

#[async_trait]
impl Handler for RouteToNodeHandler {
    async fn handle(&self, ctx: &mut SessionContext, decision: Decision, deps: &Deps) -> HandlerResult {
        let Some(slug) = decision.resource else {
            return HandlerResult::Failure { message: "route_to_node decision missing a resource".into() };
        };
        ctx.routed_to_node = Some(agentmesh_core::model::RoutedToNode {
            slug: slug.clone(),
            reason: Some(decision.reason),
        });
        let body = serde_json::json!({ "message": deps.pending_message, "session_id": ctx.session_id });
        match deps.transport.forward(&slug, "/chat", &body, &HashMap::new()).await {
            Ok(response) => {
                let text = response
                    .body
                    .get("response")
                    .and_then(|v| v.as_str())
                    .unwrap_or("(no response text from node)")
                    .to_string();
                HandlerResult::success(text)
            }
            Err(err) => HandlerResult::Failure { message: err.to_string() },
        }
    }
}

struct ResumeSessionHandler;

#[async_trait]
impl Handler for ResumeSessionHandler {
    async fn handle(&self, _ctx: &mut SessionContext, decision: Decision, _deps: &Deps) -> HandlerResult {
        HandlerResult::success(format!("Picking up where we left off: {}", decision.reason))
    }
}

struct PauseAndHandleHandler;

#[async_trait]
impl Handler for PauseAndHandleHandler {
    async fn handle(&self, _ctx: &mut SessionContext, decision: Decision, _deps: &Deps) -> HandlerResult {
        HandlerResult::NeedsUserInput { prompt: decision.reason }
    }
}

struct SearchKnowledgeHandler;

#[async_trait]
impl Handler for SearchKnowledgeHandler {
    async fn handle(&self, _ctx: &mut SessionContext, decision: Decision, deps: &Deps) -> HandlerResult {
        let Some(search) = &deps.vector_search else {
            return HandlerResult::Failure { message: "no knowledge search configured".into() };
        };
        let collections = decision.resource.map(|r| vec![r]).unwrap_or_default();
        match search.search(&collections, &deps.pending_message, None).await {
            Ok(hits) if hits.is_empty() => HandlerResult::success("I couldn't find anything relevant."),
            Ok(hits) => {
                let summary = hits.iter().take(3).map(|h| h.id.clone()).collect::<Vec<_>>().join(", ");
                HandlerResult::success(format!("Here's what I found: {summary}"))
            }
            Err(err) => HandlerResult::Failure { message: err.to_string() },
        }
    }
}

struct ConversationalHandler;

#[async_trait]
impl Handler for ConversationalHandler {
    async fn handle(&self, ctx: &mut SessionContext, _decision: Decision, deps: &Deps) -> HandlerResult {
        let recent = ctx
            .conversation
            .iter()
            .rev()
            .take(6)
            .rev()
            .map(|t| format!("{:?}: {}", t.role, t.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = agentmesh_core::ports::Prompt::new(format!("{recent}\nUser: {}", deps.pending_message));
        match deps.llm.complete(prompt).await {
            Ok(text) => HandlerResult::success(text),
            Err(err) => HandlerResult::Failure { message: err.to_string() },
        }
    }
}

struct ResolvePositionalReferenceHandler;

#[async_trait]
impl Handler for ResolvePositionalReferenceHandler {
    async fn handle(&self, _ctx: &mut SessionContext, decision: Decision, _deps: &Deps) -> HandlerResult {
        match decision.resource {
            Some(entity_id) => HandlerResult::success(format!("Referring to {entity_id}.")),
            None => HandlerResult::Failure { message: "could not resolve the positional reference".into() },
        }
    }
}
