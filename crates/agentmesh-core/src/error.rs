use thiserror::Error;

/// Error kinds shared across every `agentmesh-*` crate.
///
/// Mid-layer crates define their own narrower error enums and convert into
/// this one at the boundary, the same way a handler converts a domain error
/// into a user-safe response before it reaches the orchestrator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Network failure, 5xx, or a suspension-point timeout talking to a peer node.
    #[error("transient error forwarding to node {node}: {message}")]
    TransientPeer { node: String, message: String },

    /// The circuit breaker for `node` is open; the call was short-circuited
    /// without touching the network.
    #[error("node {node} is currently unavailable")]
    NodeUnavailable { node: String },

    /// 401/403 from a peer after the single transparent refresh attempt failed.
    #[error("authentication with node {node} failed: {message}")]
    Auth { node: String, message: String },

    /// A tool or collector field failed parameter/schema validation.
    #[error("validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    /// The field-extraction or routing-classification LLM call returned
    /// something that did not parse as the expected strict JSON / token.
    #[error("could not extract structured output from model response")]
    ExtractionFailure,

    /// A `(workflow, step)` pair exceeded its configured execution count.
    #[error("workflow step loop guard exceeded for {workflow}/{step} (limit {limit})")]
    StepLoopExceeded {
        workflow: String,
        step: String,
        limit: u32,
    },

    /// Session-store read/write failed; fatal to the request.
    #[error("session store error: {0}")]
    ContextStore(String),

    /// Startup configuration failed to load or validate; fatal to the process.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A suspension point (LLM call, peer call, store access) exceeded its timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Tool execution raised an application error that doesn't fit another kind.
    #[error("tool {tool} failed: {message}")]
    ToolFailure { tool: String, message: String },
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::ExtractionFailure.context(err)
    }
}

impl CoreError {
    /// Attaches a lower-level error as context without changing the variant;
    /// used where the original error is worth a debug log but the caller
    /// only needs to match on the `CoreError` kind.
    fn context(self, err: impl std::fmt::Debug) -> Self {
        tracing::debug!(error = ?err, "wrapping lower-level error");
        self
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::ContextStore(err.to_string())
    }
}
