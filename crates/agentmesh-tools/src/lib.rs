//! Unified local+remote tool registry and dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use agentmesh_core::error::CoreError;
use agentmesh_core::model::{ToolDescriptor, ToolSource};
use agentmesh_core::ports::{LlmClient, Prompt};
use agentmesh_transport::NodeTransport;
use async_trait::async_trait;
use serde_json::Value;

/// Local tool handler. Object-safe and async, held as `Arc<dyn Tool>` so the
/// registry can share one instance across concurrent calls.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn descriptor(&self) -> ToolDescriptor;

    async fn call(&self, args: Value) -> Result<Value, CoreError>;
}

/// Flat name→descriptor map built from the remote registry then the local
/// registry on top — a later `insert` with the same key replaces the
/// earlier one, which is the direct expression of "local wins".
#[derive(Default)]
pub struct ToolRegistry {
    descriptors: HashMap<String, ToolDescriptor>,
    local: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_remote(&mut self, descriptor: ToolDescriptor) -> &mut Self {
        self.descriptors.insert(descriptor.name.clone(), descriptor);
        self
    }

    pub fn add_local(&mut self, tool: Arc<dyn Tool>) -> &mut Self {
        let descriptor = tool.descriptor();
        self.descriptors.insert(descriptor.name.clone(), descriptor);
        self.local.insert(tool.name().to_string(), tool);
        self
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.descriptors.get(name)
    }

    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        self.descriptors.values().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.descriptors.keys().cloned().collect()
    }
}

/// Dispatches tool calls by consulting the registry for the descriptor's
/// source, then either invoking the local handler or forwarding through
/// `NodeTransport`.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    transport: Arc<NodeTransport>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, transport: Arc<NodeTransport>) -> Self {
        Self { registry, transport }
    }

    pub async fn invoke(&self, tool_name: &str, args: Value) -> Result<Value, CoreError> {
        tracing::debug!(tool = tool_name, "dispatching tool call");
        let descriptor = self
            .registry
            .descriptor(tool_name)
            .ok_or_else(|| CoreError::ToolFailure {
                tool: tool_name.to_string(),
                message: "no such tool".to_string(),
            })?
            .clone();

        validate_against_schema(&args, &descriptor.parameter_schema).map_err(|message| {
            CoreError::Validation {
                field: tool_name.to_string(),
                message,
            }
        })?;

        match &descriptor.source {
            ToolSource::Local => {
                let tool = self.registry.local.get(tool_name).ok_or_else(|| CoreError::ToolFailure {
                    tool: tool_name.to_string(),
                    message: "descriptor present but no local handler registered".to_string(),
                })?;
                tool.call(args).await.map_err(|e| match e {
                    CoreError::ToolFailure { tool, message } => CoreError::ToolFailure { tool, message },
                    other => CoreError::ToolFailure {
                        tool: tool_name.to_string(),
                        message: other.to_string(),
                    },
                })
            }
            ToolSource::Remote { node_slug } => {
                let response = self
                    .transport
                    .forward(node_slug, "/execute", &serde_json::json!({ "tool": tool_name, "args": args }), &HashMap::new())
                    .await
                    .map_err(|e| match e {
                        CoreError::TransientPeer { node, message } | CoreError::Auth { node, message } => {
                            CoreError::ToolFailure {
                                tool: tool_name.to_string(),
                                message: format!("{node}: {message}"),
                            }
                        }
                        other => other,
                    })?;
                if response.status >= 400 {
                    return Err(CoreError::ToolFailure {
                        tool: tool_name.to_string(),
                        message: format!("remote tool returned status {}", response.status),
                    });
                }
                Ok(response.body)
            }
        }
    }
}

/// Checks that every property the schema marks `required` is present in
/// `args`. A shallow check, not a full JSON Schema validator — enough to
/// catch malformed LLM-extracted parameters before they reach a handler.
fn validate_against_schema(args: &Value, schema: &Value) -> Result<(), String> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    let Some(obj) = args.as_object() else {
        return Err("expected a JSON object".to_string());
    };
    for field in required {
        let Some(field_name) = field.as_str() else { continue };
        if !obj.contains_key(field_name) {
            return Err(format!("missing required parameter `{field_name}`"));
        }
    }
    Ok(())
}

/// Extracts tool parameters from a free-text user message via a single LLM
/// call whose prompt enumerates the expected parameter names and types, and
/// whose response must be strict JSON. Non-JSON output yields an empty
/// object rather than an error — callers then fail required-field
/// validation with a precise message instead of a generic extraction error.
pub async fn extract_parameters(
    llm: &dyn LlmClient,
    descriptor: &ToolDescriptor,
    message: &str,
) -> Value {
    let prompt = Prompt::new(format!(
        "Tool: {}\nDescription: {}\nParameter schema: {}\n\nUser message: {message}\n\n\
         Respond with strict JSON containing only the parameters you can confidently extract.",
        descriptor.name, descriptor.description, descriptor.parameter_schema,
    ));
    match llm.complete(prompt).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|_| Value::Object(Default::default())),
        Err(_) => Value::Object(Default::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "echo".into(),
                domain: "test".into(),
                parameter_schema: serde_json::json!({ "required": ["text"] }),
                description: "echoes back the text parameter".into(),
                source: ToolSource::Local,
            }
        }

        async fn call(&self, args: Value) -> Result<Value, CoreError> {
            Ok(args)
        }
    }

    #[test]
    fn local_insert_after_remote_wins_on_name_collision() {
        let mut registry = ToolRegistry::new();
        registry.add_remote(ToolDescriptor {
            name: "echo".into(),
            domain: "remote".into(),
            parameter_schema: serde_json::json!({}),
            description: "remote echo".into(),
            source: ToolSource::Remote { node_slug: "mail".into() },
        });
        registry.add_local(Arc::new(Echo));

        let descriptor = registry.descriptor("echo").unwrap();
        assert_eq!(descriptor.source, ToolSource::Local);
        assert_eq!(descriptor.description, "echoes back the text parameter");
    }

    #[test]
    fn schema_validation_rejects_missing_required_field() {
        let schema = serde_json::json!({ "required": ["text"] });
        let args = serde_json::json!({ "other": 1 });
        let err = validate_against_schema(&args, &schema).unwrap_err();
        assert!(err.contains("text"));
    }

    #[tokio::test]
    async fn dispatch_invokes_local_handler_for_local_descriptor() {
        let mut registry = ToolRegistry::new();
        registry.add_local(Arc::new(Echo));
        let registry = Arc::new(registry);

        let args = serde_json::json!({ "text": "hi" });
        let descriptor = registry.descriptor("echo").unwrap().clone();
        validate_against_schema(&args, &descriptor.parameter_schema).unwrap();

        let tool = registry.local.get("echo").unwrap();
        let result = tool.call(args.clone()).await.unwrap();
        assert_eq!(result, args);
    }

    #[test]
    fn unknown_tool_not_found_in_descriptors() {
        let registry = ToolRegistry::new();
        assert!(registry.descriptor("missing").is_none());
    }
}
