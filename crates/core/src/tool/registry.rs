use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use steward_model::ModelTool;

use super::{ApprovalRequirement, Concurrency, Tool, ToolObject, ToolObjectImpl};

/// Capability descriptor of a registered tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Name the model calls the tool by.
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON schema of the arguments.
    pub parameters: Value,
    /// Whether calls need approval.
    pub approval: ApprovalRequirement,
    /// Concurrency class of the calls.
    pub concurrency: Concurrency,
}

/// Mapping from tool names to tools.
///
/// The registry is filled while a coordinator is built and stays unchanged
/// afterwards. Tools are listed in registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn ToolObject>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Registers a tool, replacing any tool with the same name.
    pub fn register<T: Tool>(&mut self, tool: T) {
        let name = tool.name().to_owned();
        let tool: Arc<dyn ToolObject> = Arc::new(ToolObjectImpl(tool));
        if let Some(&idx) = self.index.get(&name) {
            warn!("tool `{name}` is registered twice, replacing it");
            self.tools[idx] = tool;
            return;
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
    }

    #[inline]
    pub(crate) fn get(&self, name: &str) -> Option<&Arc<dyn ToolObject>> {
        self.index.get(name).map(|&idx| &self.tools[idx])
    }

    /// Returns the descriptor of the tool named `name`.
    #[inline]
    pub fn descriptor(&self, name: &str) -> Option<ToolDescriptor> {
        self.get(name).map(|tool| describe(tool.as_ref()))
    }

    /// Returns the descriptors of every tool.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(|tool| describe(tool.as_ref())).collect()
    }

    /// Returns the tool definitions sent to the provider.
    pub fn definitions(&self) -> Vec<ModelTool> {
        self.tools
            .iter()
            .map(|tool| ModelTool {
                name: tool.name().to_owned(),
                description: tool.description().to_owned(),
                parameters: tool.parameter_schema().clone(),
            })
            .collect()
    }

    /// Returns the number of registered tools.
    #[inline]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns `true` if no tool is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn describe(tool: &dyn ToolObject) -> ToolDescriptor {
    ToolDescriptor {
        name: tool.name().to_owned(),
        description: tool.description().to_owned(),
        parameters: tool.parameter_schema().clone(),
        approval: tool.approval(),
        concurrency: tool.concurrency(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::{EchoTool, WriteTool};

    #[test]
    fn test_lookup_and_order() {
        let mut registry = ToolRegistry::default();
        registry.register(WriteTool::default());
        registry.register(EchoTool);

        let names: Vec<_> = registry
            .definitions()
            .into_iter()
            .map(|tool| tool.name)
            .collect();
        assert_eq!(names, ["write", "echo"]);

        let write = registry.descriptor("write").unwrap();
        assert_eq!(write.concurrency, Concurrency::Exclusive);
        assert_eq!(write.approval, ApprovalRequirement::Required);
        assert!(registry.descriptor("read").is_none());
    }

    #[test]
    fn test_prepare_validates_arguments() {
        let mut registry = ToolRegistry::default();
        registry.register(EchoTool);
        let echo = registry.get("echo").unwrap();

        let err = Arc::clone(echo)
            .prepare(json!({ "text": 42 }))
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::tool::ErrorKind::InvalidInput);

        let prepared =
            Arc::clone(echo).prepare(json!({ "text": "hi" })).unwrap();
        assert_eq!(prepared.action.target, "");
    }

    #[test]
    fn test_register_replaces_duplicates() {
        let mut registry = ToolRegistry::default();
        registry.register(EchoTool);
        registry.register(EchoTool);
        assert_eq!(registry.len(), 1);
    }
}
