//! End-to-end scenarios exercising the full `handle_message` pipeline
//! (decide -> execute -> persist) against fake LLM/session-store/tool
//! collaborators, plus a lower-level breaker scenario driven straight
//! against `NodeTransport` where the orchestrator layer would otherwise
//! mask the behavior under test (routed sessions fall back to `local`
//! before ever reaching the breaker).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use agentmesh_breaker::BreakerRegistry;
use agentmesh_core::error::CoreError;
use agentmesh_core::model::{
    CollectorDescriptor, CollectorSource, FieldDef, FieldType, NodeCapabilities, NodeType,
    ToolDescriptor, ToolSource,
};
use agentmesh_core::ports::{LlmClient, Prompt};
use agentmesh_core::store::{MemorySessionStore, SessionStore};
use agentmesh_discovery::DiscoveryCache;
use agentmesh_orchestrator::Orchestrator;
use agentmesh_registry::{NodeDescription, NodeRegistry};
use agentmesh_tools::{Tool, ToolRegistry};
use agentmesh_transport::{Clock, ConnectionPool, Credential, CredentialSource, NodeTransport};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Replays a fixed script of LLM responses in order, repeating the last one
/// past the end of the script. Counts calls so tests can assert a fast path
/// skipped the model entirely.
struct ScriptedLlm {
    responses: Vec<String>,
    next: StdMutex<usize>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: responses.into_iter().map(String::from).collect(),
            next: StdMutex::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _prompt: Prompt) -> Result<String, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut idx = self.next.lock().unwrap();
        let response = self
            .responses
            .get(*idx)
            .cloned()
            .unwrap_or_else(|| self.responses.last().cloned().unwrap_or_default());
        *idx += 1;
        Ok(response)
    }
}

struct StaticCredentialSource;

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn refresh(&self, node_slug: &str) -> Result<Credential, CoreError> {
        Ok(Credential {
            token: format!("token-for-{node_slug}"),
            expires_at_unix_ms: i64::MAX,
        })
    }
}

/// A clock whose reading is set explicitly, so breaker cool-downs can be
/// driven deterministically rather than by sleeping in real time.
struct ManualClock(AtomicI64);

impl ManualClock {
    fn new(start: i64) -> Self {
        Self(AtomicI64::new(start))
    }

    fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// A local tool standing in for a node's completion action, so the
/// collector's "done" reply can reference a concrete created entity id.
struct CreateInvoiceTool;

#[async_trait]
impl Tool for CreateInvoiceTool {
    fn name(&self) -> &str {
        "create_invoice_tool"
    }

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "create_invoice_tool".into(),
            domain: "invoices".into(),
            parameter_schema: serde_json::json!({}),
            description: "creates an invoice from collected fields".into(),
            source: ToolSource::Local,
        }
    }

    async fn call(&self, _args: Value) -> Result<Value, CoreError> {
        Ok(serde_json::json!({ "id": "inv-123" }))
    }
}

fn invoice_collector() -> CollectorDescriptor {
    CollectorDescriptor {
        name: "create_invoice".into(),
        goal: "create an invoice".into(),
        description: "".into(),
        fields: vec![
            FieldDef {
                name: "customer".into(),
                field_type: FieldType::String,
                required: true,
                prompt: "Who is this for?".into(),
                min: None,
                max: None,
                child_flow: None,
            },
            FieldDef {
                name: "items".into(),
                field_type: FieldType::Array,
                required: true,
                prompt: "What items?".into(),
                min: None,
                max: None,
                child_flow: None,
            },
        ],
        trigger_phrases: vec![],
        completion_action: Some("create_invoice_tool".into()),
        source: CollectorSource::Local,
    }
}

/// A local tool standing in for a sub-flow's own completion action, so a
/// suspended parent can be resumed with a concrete resolved entity id.
struct LookupCustomerTool;

#[async_trait]
impl Tool for LookupCustomerTool {
    fn name(&self) -> &str {
        "lookup_customer_tool"
    }

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "lookup_customer_tool".into(),
            domain: "customers".into(),
            parameter_schema: serde_json::json!({}),
            description: "resolves a customer by name".into(),
            source: ToolSource::Local,
        }
    }

    async fn call(&self, _args: Value) -> Result<Value, CoreError> {
        Ok(serde_json::json!({ "id": "cust-42" }))
    }
}

/// An invoice collector whose `customer` field routes through a
/// `pick_customer` sub-flow instead of accepting a bare string.
fn invoice_collector_with_customer_subflow() -> CollectorDescriptor {
    let mut descriptor = invoice_collector();
    descriptor.fields[0].child_flow = Some("pick_customer".into());
    descriptor
}

fn pick_customer_collector() -> CollectorDescriptor {
    CollectorDescriptor {
        name: "pick_customer".into(),
        goal: "find the customer".into(),
        description: "".into(),
        fields: vec![FieldDef {
            name: "query".into(),
            field_type: FieldType::String,
            required: true,
            prompt: "Which customer?".into(),
            min: None,
            max: None,
            child_flow: None,
        }],
        trigger_phrases: vec![],
        completion_action: Some("lookup_customer_tool".into()),
        source: CollectorSource::Local,
    }
}

/// An unreachable loopback address: connection attempts fail (refused)
/// almost immediately, with no dependency on external network access.
const UNREACHABLE_NODE: &str = "http://127.0.0.1:1";

fn mail_description() -> NodeDescription {
    NodeDescription {
        slug: "mail".into(),
        display_name: "Mail".into(),
        base_url: UNREACHABLE_NODE.into(),
        node_type: NodeType::Child,
        version: "1.0".into(),
    }
}

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<dyn SessionStore>,
}

fn build_harness(llm: Arc<dyn LlmClient>, with_mail_node: bool) -> Harness {
    let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
    let registry = Arc::new(NodeRegistry::new());
    if with_mail_node {
        registry.register(mail_description());
        registry
            .update_capabilities(
                "mail",
                NodeCapabilities {
                    tools: vec![],
                    collectors: vec![],
                    collections: vec!["email".into()],
                    domain_tags: vec!["email".into()],
                },
            )
            .unwrap();
    }
    let breakers = Arc::new(BreakerRegistry::new(5, Duration::from_secs(30)));
    let credential_source: Arc<dyn CredentialSource> = Arc::new(StaticCredentialSource);
    let pool = ConnectionPool::new(4);
    let clock: Arc<dyn Clock> = Arc::new(agentmesh_transport::SystemClock);
    let transport = Arc::new(NodeTransport::new(
        registry.clone(),
        breakers.clone(),
        credential_source,
        pool,
        clock,
    ));
    let discovery = Arc::new(DiscoveryCache::new(Duration::from_secs(60)));

    let mut tools = ToolRegistry::new();
    tools.add_local(Arc::new(CreateInvoiceTool));
    let tools = Arc::new(tools);

    let mut collectors = HashMap::new();
    collectors.insert("create_invoice".to_string(), invoice_collector());

    let orchestrator = Orchestrator::new(
        store.clone(),
        registry.clone(),
        transport,
        breakers,
        discovery,
        llm,
        tools,
        None,
        collectors,
        20,
    );

    Harness { orchestrator, store }
}

/// A harness wired with the `create_invoice` / `pick_customer` pair, where
/// `create_invoice`'s `customer` field suspends into `pick_customer`.
fn build_sub_flow_harness(llm: Arc<dyn LlmClient>) -> Harness {
    let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
    let registry = Arc::new(NodeRegistry::new());
    let breakers = Arc::new(BreakerRegistry::new(5, Duration::from_secs(30)));
    let credential_source: Arc<dyn CredentialSource> = Arc::new(StaticCredentialSource);
    let pool = ConnectionPool::new(4);
    let clock: Arc<dyn Clock> = Arc::new(agentmesh_transport::SystemClock);
    let transport = Arc::new(NodeTransport::new(
        registry.clone(),
        breakers.clone(),
        credential_source,
        pool,
        clock,
    ));
    let discovery = Arc::new(DiscoveryCache::new(Duration::from_secs(60)));

    let mut tools = ToolRegistry::new();
    tools.add_local(Arc::new(CreateInvoiceTool));
    tools.add_local(Arc::new(LookupCustomerTool));
    let tools = Arc::new(tools);

    let mut collectors = HashMap::new();
    collectors.insert("create_invoice".to_string(), invoice_collector_with_customer_subflow());
    collectors.insert("pick_customer".to_string(), pick_customer_collector());

    let orchestrator = Orchestrator::new(
        store.clone(),
        registry,
        transport,
        breakers,
        discovery,
        llm,
        tools,
        None,
        collectors,
        20,
    );

    Harness { orchestrator, store }
}

#[tokio::test]
async fn sub_flow_suspends_into_child_then_resumes_parent_without_double_completion() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        "ACTION: start_collector\nRESOURCE: create_invoice\nREASON: user wants an invoice",
        "{}",
        r#"{"query": "Acme"}"#,
    ])) as Arc<dyn LlmClient>;
    let harness = build_sub_flow_harness(llm);

    // Starting the collector immediately needs `customer`, which suspends
    // into the `pick_customer` sub-flow rather than asking for it directly.
    harness
        .orchestrator
        .handle_message("s9", None, "create an invoice", CancellationToken::new())
        .await
        .unwrap();
    let ctx = harness.store.load("s9", None).await.unwrap();
    assert_eq!(ctx.active_collector.as_ref().unwrap().name, "pick_customer");
    assert_eq!(ctx.workflow_stack.len(), 1);

    // The child collector still needs its own confirmation turn before it
    // completes (fast-pathed: no LLM call is spent on the decision itself,
    // only on field extraction).
    let asked = harness
        .orchestrator
        .handle_message("s9", None, "Acme", CancellationToken::new())
        .await
        .unwrap();
    assert!(!asked.text.contains("cust-42"));
    let ctx = harness.store.load("s9", None).await.unwrap();
    assert_eq!(
        ctx.active_collector.as_ref().unwrap().state,
        agentmesh_core::model::CollectorState::AwaitingConfirmation
    );

    // Confirming the child resolves it, merges the resolved customer id into
    // the parent's collected data, and resumes `create_invoice` — the
    // parent's own completion tool must not have run yet.
    let resumed = harness
        .orchestrator
        .handle_message("s9", None, "yes", CancellationToken::new())
        .await
        .unwrap();
    assert!(!resumed.text.contains("inv-123"));

    let ctx = harness.store.load("s9", None).await.unwrap();
    assert!(ctx.workflow_stack.is_empty());
    assert_eq!(ctx.active_collector.as_ref().unwrap().name, "create_invoice");
    assert_eq!(
        ctx.active_collector.as_ref().unwrap().state,
        agentmesh_core::model::CollectorState::Collecting
    );
    assert_eq!(ctx.collected_data["customer"], "cust-42");
}

#[tokio::test]
async fn s1_conversational_hi_appends_one_reply_turn() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        "ACTION: conversational\nRESOURCE: none\nREASON: chit-chat",
        "Hello! How can I help?",
    ])) as Arc<dyn LlmClient>;
    let harness = build_harness(llm, false);

    let response = harness
        .orchestrator
        .handle_message("s1", None, "hi", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.text, "Hello! How can I help?");
    assert!(!response.needs_user_input);

    let ctx = harness.store.load("s1", None).await.unwrap();
    assert_eq!(ctx.conversation.len(), 2);
    assert!(ctx.active_collector.is_none());
    assert!(ctx.workflow_stack.is_empty());
}

#[tokio::test]
async fn s2_and_s3_collector_start_then_confirmation_references_created_entity() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        "ACTION: start_collector\nRESOURCE: create_invoice\nREASON: user wants an invoice",
        r#"{"customer": "Acme", "items": [{"name": "widgets", "qty": 2, "price": 50}]}"#,
        "ACTION: conversational\nRESOURCE: none\nREASON: chit-chat",
        "Anything else I can help with?",
    ])) as Arc<dyn LlmClient>;
    let harness = build_harness(llm, false);

    // S2: starting the collector extracts both required fields in one turn
    // and lands in `awaiting_confirmation` without asking a follow-up.
    let started = harness
        .orchestrator
        .handle_message("s2", None, "create an invoice for Acme for 2 widgets at $50", CancellationToken::new())
        .await
        .unwrap();
    assert!(!started.needs_user_input);

    let ctx = harness.store.load("s2", None).await.unwrap();
    assert_eq!(ctx.collected_data["customer"], "Acme");
    assert_eq!(ctx.collected_data["items"][0]["qty"], 2);
    assert_eq!(
        ctx.active_collector.as_ref().unwrap().state,
        agentmesh_core::model::CollectorState::AwaitingConfirmation
    );

    // S3: confirming hands the collected data to the completion tool and the
    // reply names the entity it created, with no further LLM call involved
    // (confirmation is resolved deterministically, not by the model).
    let confirmed = harness
        .orchestrator
        .handle_message("s2", None, "yes", CancellationToken::new())
        .await
        .unwrap();
    assert!(confirmed.text.contains("inv-123"));

    // Completion must clear the active collector — otherwise every later
    // message in the session would keep fast-pathing into
    // `continue_collector` forever.
    let ctx = harness.store.load("s2", None).await.unwrap();
    assert!(ctx.active_collector.is_none());

    // A follow-up turn after completion reaches ordinary conversational
    // handling instead of re-entering the finished collector and
    // re-invoking its completion tool a second time.
    let after = harness
        .orchestrator
        .handle_message("s2", None, "thanks", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(after.text, "Anything else I can help with?");
    assert!(!after.text.contains("inv-123"));
}

#[tokio::test]
async fn s4_s5_s6_routed_session_lifecycle() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        "ACTION: route_to_node\nRESOURCE: mail\nREASON: email domain",
        "CONTINUE",
        "I don't have invoice data here, but I can help some other way.",
    ]));
    let harness = build_harness(llm.clone() as Arc<dyn LlmClient>, true);

    // S4: routing decision pins the session to `mail` regardless of whether
    // the forwarded call itself succeeds.
    harness
        .orchestrator
        .handle_message("s4", None, "show me my latest emails", CancellationToken::new())
        .await
        .unwrap();
    let ctx = harness.store.load("s4", None).await.unwrap();
    assert_eq!(ctx.routed_to_node.as_ref().unwrap().slug, "mail");
    assert_eq!(llm.call_count(), 1);

    // S5: a bare positional follow-up stays routed via the fast path —
    // no additional classification call is made.
    harness
        .orchestrator
        .handle_message("s4", None, "1", CancellationToken::new())
        .await
        .unwrap();
    let ctx = harness.store.load("s4", None).await.unwrap();
    assert_eq!(ctx.routed_to_node.as_ref().unwrap().slug, "mail");
    assert_eq!(llm.call_count(), 1, "fast path must not call the model");

    // S6: a message naming a domain `mail` doesn't declare forces `local`
    // and clears the routed pin before the conversational handler runs.
    let response = harness
        .orchestrator
        .handle_message("s4", None, "how many invoices do I have", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.text, "I don't have invoice data here, but I can help some other way.");
    let ctx = harness.store.load("s4", None).await.unwrap();
    assert!(ctx.routed_to_node.is_none());
    assert_eq!(llm.call_count(), 3);
}

#[tokio::test]
async fn s7_breaker_opens_after_five_failures_then_allows_one_probe() {
    let registry = Arc::new(NodeRegistry::new());
    registry.register(mail_description());
    let breakers = Arc::new(BreakerRegistry::new(5, Duration::from_secs(30)));
    let credential_source: Arc<dyn CredentialSource> = Arc::new(StaticCredentialSource);
    let pool = ConnectionPool::new(4);
    let clock = Arc::new(ManualClock::new(0));
    let transport = NodeTransport::new(
        registry,
        breakers,
        credential_source,
        pool,
        clock.clone() as Arc<dyn Clock>,
    );

    let empty_headers = HashMap::new();
    for _ in 0..5 {
        let result = transport
            .forward("mail", "/chat", &serde_json::json!({ "message": "hi" }), &empty_headers)
            .await;
        assert!(result.is_err(), "unreachable node must fail every attempt");
    }

    // Sixth call: breaker open, cool-down not elapsed, short-circuits
    // without attempting the network.
    let sixth = transport
        .forward("mail", "/chat", &serde_json::json!({ "message": "hi" }), &empty_headers)
        .await;
    assert!(matches!(sixth, Err(CoreError::NodeUnavailable { .. })));

    // Cool-down elapses: the probe is attempted (and fails over the
    // network), reopening the breaker for another full cool-down.
    clock.set(30_000);
    let probe = transport
        .forward("mail", "/chat", &serde_json::json!({ "message": "hi" }), &empty_headers)
        .await;
    assert!(matches!(probe, Err(CoreError::TransientPeer { .. })));

    // After the second cool-down, two concurrent callers race for the
    // single half-open probe slot: exactly one gets it, the other is
    // turned away immediately with `NodeUnavailable`.
    clock.set(60_000);
    let (first, second) = tokio::join!(
        transport.forward("mail", "/chat", &serde_json::json!({ "message": "hi" }), &empty_headers),
        transport.forward("mail", "/chat", &serde_json::json!({ "message": "hi" }), &empty_headers),
    );
    let unavailable_count = [&first, &second]
        .iter()
        .filter(|r| matches!(r, Err(CoreError::NodeUnavailable { .. })))
        .count();
    assert_eq!(unavailable_count, 1, "exactly one caller must be refused the probe slot");
}
