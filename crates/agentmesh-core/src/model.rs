use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single turn in a session's append-only conversation log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Which remote node a session is currently pinned to, and why.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutedToNode {
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Descriptor of the collector currently active in a session, if any.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveCollector {
    pub name: String,
    pub state: CollectorState,
    /// The required field (in declaration order) currently being asked for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asking_for: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollectorState {
    Collecting,
    AwaitingConfirmation,
    Completed,
    Cancelled,
    Failed,
}

/// A suspended collector execution, pushed when a field launches a sub-flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowFrame {
    pub workflow: String,
    pub step: String,
    pub collected_data: serde_json::Value,
    pub parent_step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_prefix: Option<String>,
}

/// Ids and type of the most recently presented list, for positional
/// reference resolution ("the second one").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityListMemory {
    pub entity_type: String,
    pub entity_ids: Vec<String>,
}

impl EntityListMemory {
    /// Resolves a 1-based positional ordinal to an entity id:
    /// `"2"` on `[A,B,C]` resolves to `B`.
    pub fn resolve_position(&self, position: usize) -> Option<&str> {
        position
            .checked_sub(1)
            .and_then(|idx| self.entity_ids.get(idx))
            .map(String::as_str)
    }
}

/// Per-session conversational state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionContext {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub conversation: Vec<Turn>,
    #[serde(default)]
    pub scratchpad: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub workflow_stack: Vec<WorkflowFrame>,
    #[serde(default)]
    pub collected_data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_collector: Option<ActiveCollector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routed_to_node: Option<RoutedToNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_entity_list: Option<EntityListMemory>,
    /// Monotonic version used for optimistic append-conflict resolution.
    #[serde(default)]
    pub version: u64,
    /// Per-`(workflow, step)` execution counter backing the collector
    /// engine's infinite-loop guard, keyed by `"{workflow}/{step}"`.
    #[serde(default)]
    pub step_execution_counts: HashMap<String, u32>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, caller_id: Option<String>) -> Self {
        Self {
            session_id: session_id.into(),
            caller_id,
            conversation: Vec::new(),
            scratchpad: HashMap::new(),
            workflow_stack: Vec::new(),
            collected_data: serde_json::Value::Null,
            active_collector: None,
            routed_to_node: None,
            last_entity_list: None,
            version: 0,
            step_execution_counts: HashMap::new(),
        }
    }

    pub fn append_user(&mut self, content: impl Into<String>) {
        self.conversation.push(Turn {
            role: Role::User,
            content: content.into(),
            metadata: None,
        });
    }

    pub fn append_assistant(&mut self, content: impl Into<String>, metadata: Option<serde_json::Value>) {
        self.conversation.push(Turn {
            role: Role::Assistant,
            content: content.into(),
            metadata,
        });
    }

    /// Invariant: at most one active collector per session.
    pub fn has_active_collector(&self) -> bool {
        self.active_collector.is_some()
    }

    pub fn push_frame(&mut self, frame: WorkflowFrame) {
        self.workflow_stack.push(frame);
    }

    pub fn pop_frame(&mut self) -> Option<WorkflowFrame> {
        self.workflow_stack.pop()
    }
}

/// A single field in a collector's schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Name of a child collector this field should be resolved through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_flow: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

/// Where a collector's implementation lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CollectorSource {
    Local,
    Remote { node_slug: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectorDescriptor {
    pub name: String,
    pub goal: String,
    pub description: String,
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub trigger_phrases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_action: Option<String>,
    pub source: CollectorSource,
}

impl CollectorDescriptor {
    /// First missing required field in declaration order; drives "what to
    /// ask next".
    pub fn next_missing_required<'a>(&'a self, collected: &serde_json::Value) -> Option<&'a FieldDef> {
        self.fields.iter().find(|f| {
            f.required
                && collected
                    .get(&f.name)
                    .map(|v| v.is_null())
                    .unwrap_or(true)
        })
    }
}

/// Where a tool's implementation lives, and its invocation target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ToolSource {
    Local,
    Remote { node_slug: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub domain: String,
    pub parameter_schema: serde_json::Value,
    pub description: String,
    pub source: ToolSource,
}

/// Node type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Master,
    Child,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Inactive,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthMetrics {
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    pub consecutive_ping_failures: u32,
    pub last_seen_unix_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RateLimitWindow {
    pub limit_per_window: u32,
    pub window_seconds: u32,
    pub used_in_window: u32,
    pub window_started_unix_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeCapabilities {
    pub tools: Vec<String>,
    pub collectors: Vec<CollectorDescriptor>,
    pub collections: Vec<String>,
    pub domain_tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub slug: String,
    pub display_name: String,
    pub base_url: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub capabilities: NodeCapabilities,
    pub version: String,
    pub health: HealthMetrics,
    pub rate_limit: RateLimitWindow,
    pub active_connections: u32,
}

impl NodeRecord {
    /// load = active-connection count × (1 − success rate).
    pub fn load(&self) -> f64 {
        self.active_connections as f64 * (1.0 - self.health.success_rate)
    }
}

/// The action vocabulary emitted by the routing decision engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ContinueCollector,
    StartCollector,
    UseTool,
    RouteToNode,
    ResumeSession,
    PauseAndHandle,
    SearchKnowledge,
    Conversational,
    ResolvePositionalReference,
}

/// The decision produced by the routing engine: an action, an optional
/// resource name, and a human-readable reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub reason: String,
}

impl Decision {
    pub fn new(action: Action, resource: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            action,
            resource,
            reason: reason.into(),
        }
    }
}

/// Per-request options carried on `/chat`. Unknown keys are rejected at
/// the boundary (`serde(deny_unknown_fields)`) rather than silently
/// accepted and ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct RequestOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub use_memory: bool,
    #[serde(default)]
    pub use_actions: bool,
    #[serde(default)]
    pub use_rag: bool,
    #[serde(default)]
    pub rag_collections: Vec<String>,
}

/// Body of an inbound `/chat` request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ChatRequest {
    pub message: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub options: RequestOptions,
}

/// Metadata accompanying a `/chat` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChatMetadata {
    pub workflow_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_class: Option<String>,
    pub workflow_completed: bool,
    pub agent_strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    pub success: bool,
    pub response: String,
    pub metadata: ChatMetadata,
}
