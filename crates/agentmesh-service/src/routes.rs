use std::sync::Arc;

use agentmesh_core::model::{ChatMetadata, ChatRequest, ChatResponse, NodeType};
use agentmesh_registry::{HealthSample, NodeDescription};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::state::{now_unix_ms, AppState};

pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> impl IntoResponse {
    let result = state
        .orchestrator
        .handle_message(&request.session_id, request.user_id.as_deref(), &request.message, CancellationToken::new())
        .await;

    match result {
        Ok(response) => Json(ChatResponse {
            success: true,
            response: response.text,
            metadata: ChatMetadata {
                workflow_active: response.needs_user_input,
                workflow_class: None,
                workflow_completed: response.metadata.is_some(),
                agent_strategy: "orchestrator".to_string(),
                entity_ids: None,
                entity_type: None,
            },
        })
        .into_response(),
        Err(err) => {
            tracing::warn!(error = %err, session_id = %request.session_id, "chat request failed");
            (
                StatusCode::OK,
                Json(ChatResponse {
                    success: false,
                    response: err.to_string(),
                    metadata: ChatMetadata::default(),
                }),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: String,
    capability_tags: Vec<String>,
    uptime_ms: i64,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: state.version.clone(),
        capability_tags: state.local_capabilities.domain_tags.clone(),
        uptime_ms: now_unix_ms() - state.started_at_unix_ms,
    })
}

#[derive(Debug, Serialize)]
pub struct CollectionsResponse {
    collections: Vec<String>,
}

pub async fn collections(State(state): State<Arc<AppState>>) -> Json<CollectionsResponse> {
    Json(CollectionsResponse {
        collections: state.discovery.discover_collections(),
    })
}

pub async fn capabilities(State(state): State<Arc<AppState>>) -> Json<agentmesh_core::model::NodeCapabilities> {
    Json(state.local_capabilities.clone())
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    slug: String,
    display_name: String,
    base_url: String,
    #[serde(default)]
    node_type: Option<NodeType>,
    version: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    node: agentmesh_core::model::NodeRecord,
    credential: String,
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> Json<RegisterResponse> {
    let (node, credential) = state.registry.register(NodeDescription {
        slug: request.slug,
        display_name: request.display_name,
        base_url: request.base_url,
        node_type: request.node_type.unwrap_or(NodeType::Child),
        version: request.version,
    });
    state.discovery.invalidate(now_unix_ms());
    Json(RegisterResponse { node, credential })
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    node_slug: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    access_token: String,
}

pub async fn auth_refresh(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<RefreshRequest>,
) -> impl IntoResponse {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = presented else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if !state.registry.authenticate(&request.node_slug, token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.registry.rotate_credential(&request.node_slug) {
        Ok(access_token) => Json(RefreshResponse { access_token }).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    collections: Vec<String>,
    query: String,
    #[serde(default)]
    filters: Option<serde_json::Value>,
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SearchRequest>,
) -> impl IntoResponse {
    let Some(search) = &state.vector_search else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    match search.search(&request.collections, &request.query, request.filters).await {
        Ok(hits) => Json(hits.into_iter().map(SearchHitJson::from).collect::<Vec<_>>()).into_response(),
        Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    }
}

#[derive(Debug, Serialize)]
struct SearchHitJson {
    id: String,
    collection: String,
    score: f32,
    payload: serde_json::Value,
}

impl From<agentmesh_core::ports::SearchHit> for SearchHitJson {
    fn from(hit: agentmesh_core::ports::SearchHit) -> Self {
        Self {
            id: hit.id,
            collection: hit.collection,
            score: hit.score,
            payload: hit.payload,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AggregateRequest {
    collection: String,
    #[serde(default)]
    filters: Option<serde_json::Value>,
}

pub async fn aggregate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AggregateRequest>,
) -> impl IntoResponse {
    let Some(search) = &state.vector_search else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    match search.aggregate(&request.collection, request.filters).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    tool: String,
    #[serde(default)]
    args: serde_json::Value,
}

pub async fn execute(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecuteRequest>,
) -> impl IntoResponse {
    match state.tool_dispatcher.invoke(&request.tool, request.args).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    total_nodes: usize,
    active_nodes: usize,
    inactive_nodes: usize,
    error_nodes: usize,
    nodes: Vec<agentmesh_core::model::NodeRecord>,
}

pub async fn dashboard(State(state): State<Arc<AppState>>) -> Json<DashboardResponse> {
    let stats = state.registry.statistics();
    Json(DashboardResponse {
        total_nodes: stats.total,
        active_nodes: stats.active,
        inactive_nodes: stats.inactive,
        error_nodes: stats.error,
        nodes: state.registry.list_active(),
    })
}

#[derive(Debug, Deserialize)]
pub struct HealthPingRequest {
    slug: String,
    latency_ms: f64,
    success: bool,
}

/// Not in the external interface table, but the rolling health estimators
/// in `agentmesh-registry` need something to feed them — this is the
/// inbound side of the ping loop a master node runs against its children.
pub async fn health_ping(
    State(state): State<Arc<AppState>>,
    Json(request): Json<HealthPingRequest>,
) -> impl IntoResponse {
    let sample = HealthSample {
        latency_ms: request.latency_ms,
        success: request.success,
        observed_at_unix_ms: now_unix_ms(),
    };
    match state.registry.update_health(&request.slug, sample) {
        Ok(()) => {
            state.discovery.invalidate(now_unix_ms());
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => (StatusCode::NOT_FOUND, err.to_string()).into_response(),
    }
}

/// Forces an out-of-band catalog refresh instead of waiting for the TTL to
/// lapse — useful right after an operator registers or retires a node.
pub async fn refresh_discovery(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state
        .discovery
        .refresh(&state.local_slug, state.local_capabilities.clone(), &state.registry, state.capability_fetcher.as_ref(), now_unix_ms())
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    }
}
