//! Loads locally-declared collectors and tools from the JSON descriptor
//! files named in `local_collector_paths`/`local_tool_paths`. Collectors
//! are pure data (the descriptor *is* the behavior, driven by
//! `agentmesh_collector::CollectorEngine`); local tools additionally carry
//! a canned `response_template` so a descriptor alone is enough to serve
//! them without compiling bespoke Rust per tool.

use std::collections::HashMap;
use std::sync::Arc;

use agentmesh_core::error::CoreError;
use agentmesh_core::model::{CollectorDescriptor, ToolDescriptor};
use agentmesh_tools::{Tool, ToolRegistry};
use async_trait::async_trait;
use serde::Deserialize;

pub fn load_collectors(paths: &[String]) -> Result<HashMap<String, CollectorDescriptor>, CoreError> {
    let mut out = HashMap::new();
    for path in paths {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Configuration(format!("reading collector file {path}: {e}")))?;
        let descriptor: CollectorDescriptor = serde_json::from_str(&raw)
            .map_err(|e| CoreError::Configuration(format!("parsing collector file {path}: {e}")))?;
        out.insert(descriptor.name.clone(), descriptor);
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
struct LocalToolFile {
    descriptor: ToolDescriptor,
    #[serde(default)]
    response_template: serde_json::Value,
}

/// A local tool whose entire behavior is "return this canned JSON",
/// configured from a file rather than compiled in.
struct StaticResponseTool {
    descriptor: ToolDescriptor,
    response_template: serde_json::Value,
}

#[async_trait]
impl Tool for StaticResponseTool {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn descriptor(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    async fn call(&self, _args: serde_json::Value) -> Result<serde_json::Value, CoreError> {
        Ok(self.response_template.clone())
    }
}

pub fn load_tools(paths: &[String], registry: &mut ToolRegistry) -> Result<(), CoreError> {
    for path in paths {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Configuration(format!("reading tool file {path}: {e}")))?;
        let file: LocalToolFile = serde_json::from_str(&raw)
            .map_err(|e| CoreError::Configuration(format!("parsing tool file {path}: {e}")))?;
        registry.add_local(Arc::new(StaticResponseTool {
            descriptor: file.descriptor,
            response_template: file.response_template,
        }));
    }
    Ok(())
}
