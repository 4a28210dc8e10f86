//! Tool registry: what the model may call at each stage

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use sleuth_ai::{Tool, ToolCall};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub const CONDUCT_RESEARCH: &str = "conduct_research";
pub const RESEARCH_COMPLETE: &str = "research_complete";
pub const REFLECT: &str = "reflect";
pub const THINK: &str = "think";

const RESERVED: [&str; 4] = [CONDUCT_RESEARCH, RESEARCH_COMPLETE, REFLECT, THINK];

/// Failure reported by a collaborator tool
#[derive(Error, Debug)]
pub enum ToolExecutionError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),

    #[error("tool execution cancelled")]
    Cancelled,
}

/// A domain capability (search, scrape, ...) supplied by the embedding application
#[async_trait]
pub trait ResearchTool: Send + Sync {
    /// Tool name (used in API calls)
    fn name(&self) -> &str;

    /// Tool description for the LLM
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool; the output is fed back to the model verbatim
    async fn execute(
        &self,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> std::result::Result<String, ToolExecutionError>;
}

/// Type alias for a shared tool
pub type BoxedTool = Arc<dyn ResearchTool>;

/// How the engine treats a tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    ConductResearch,
    ResearchComplete,
    Reflect,
    Think,
    Domain,
    Unknown,
}

/// Outcome of running one tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Built-in control tools plus registered domain tools
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<BoxedTool>,
    schema_cache: HashMap<String, Arc<jsonschema::Validator>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a domain tool
    pub fn register(&mut self, tool: BoxedTool) -> Result<()> {
        let name = tool.name().to_string();
        if RESERVED.contains(&name.as_str()) {
            return Err(Error::InvalidConfig(format!("tool name '{}' is reserved", name)));
        }
        if self.tools.iter().any(|t| t.name() == name) {
            return Err(Error::InvalidConfig(format!("tool '{}' registered twice", name)));
        }
        match jsonschema::validator_for(&tool.parameters_schema()) {
            Ok(validator) => {
                self.schema_cache.insert(name, Arc::new(validator));
            }
            Err(e) => {
                tracing::warn!(
                    "Invalid tool parameter schema for '{}', skipping validation: {}",
                    name,
                    e
                );
            }
        }
        self.tools.push(tool);
        Ok(())
    }

    pub fn with_tool(mut self, tool: BoxedTool) -> Result<Self> {
        self.register(tool)?;
        Ok(self)
    }

    /// Names of the registered domain tools
    pub fn domain_tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn classify(&self, name: &str) -> ToolKind {
        match name {
            CONDUCT_RESEARCH => ToolKind::ConductResearch,
            RESEARCH_COMPLETE => ToolKind::ResearchComplete,
            REFLECT => ToolKind::Reflect,
            THINK => ToolKind::Think,
            _ if self.tools.iter().any(|t| t.name() == name) => ToolKind::Domain,
            _ => ToolKind::Unknown,
        }
    }

    /// Tools offered to the supervisor
    pub fn supervisor_tools(&self) -> Vec<Tool> {
        vec![conduct_research_tool(), research_complete_tool(), reflect_tool(), think_tool()]
    }

    /// Tools offered to a researcher: domain tools plus completion and think
    pub fn researcher_tools(&self) -> Vec<Tool> {
        self.tools
            .iter()
            .map(|t| Tool::new(t.name(), t.description(), t.parameters_schema()))
            .chain([research_complete_tool(), think_tool()])
            .collect()
    }

    /// Run a domain tool call. Failures come back as error output, never as `Err`.
    pub async fn execute(&self, call: &ToolCall, cancel: CancellationToken) -> ToolOutput {
        let Some(tool) = self.tools.iter().find(|t| t.name() == call.name) else {
            return ToolOutput::error(format!("Tool not found: {}", call.name));
        };

        if let Some(validator) = self.schema_cache.get(&call.name) {
            if let Some(err) = validate_arguments(&call.arguments, validator) {
                return ToolOutput::error(err);
            }
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ToolExecutionError::Cancelled),
            result = tool.execute(call.arguments.clone(), cancel.clone()) => result,
        };
        match result {
            Ok(content) => ToolOutput::text(content),
            Err(e) => {
                tracing::warn!(tool = %call.name, "tool failed: {}", e);
                ToolOutput::error(format!("Error executing {}: {}", call.name, e))
            }
        }
    }
}

/// Topic argument of a `conduct_research` call
pub fn research_topic(call: &ToolCall) -> Option<String> {
    call.arguments
        .get("research_topic")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Body of a `reflect` or `think` call
pub fn reflection_text(call: &ToolCall) -> String {
    ["reflection", "thought"]
        .iter()
        .find_map(|key| call.arguments.get(*key).and_then(|v| v.as_str()))
        .unwrap_or_default()
        .to_string()
}

fn conduct_research_tool() -> Tool {
    Tool::new(
        CONDUCT_RESEARCH,
        "Delegate research on one topic to a dedicated researcher.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "research_topic": {
                    "type": "string",
                    "description": "The topic to research, described in full detail (at least a paragraph)."
                }
            },
            "required": ["research_topic"]
        }),
    )
}

fn research_complete_tool() -> Tool {
    Tool::new(
        RESEARCH_COMPLETE,
        "Declare that the research is complete.",
        serde_json::json!({ "type": "object", "properties": {} }),
    )
}

fn reflect_tool() -> Tool {
    Tool::new(
        REFLECT,
        "Reflect on the findings so far and plan the next step.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "reflection": {
                    "type": "string",
                    "description": "What was found, what is missing, and what to do next."
                }
            },
            "required": ["reflection"]
        }),
    )
}

fn think_tool() -> Tool {
    Tool::new(
        THINK,
        "Record a short thought. Has no side effects.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "thought": { "type": "string" }
            },
            "required": ["thought"]
        }),
    )
}

/// Validate tool arguments using a pre-compiled validator.
/// Returns `Some(error_message)` if validation fails, `None` if valid.
fn validate_arguments(
    args: &serde_json::Value,
    validator: &jsonschema::Validator,
) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Tool argument validation failed:\n{}",
            errors.join("\n")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingTool, MockSearch};

    fn call(name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: name.into(),
            arguments,
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new()
            .with_tool(Arc::new(MockSearch::default()))
            .unwrap()
            .with_tool(Arc::new(FailingTool))
            .unwrap()
    }

    #[test]
    fn test_reserved_and_duplicate_names_rejected() {
        let mut registry = registry();
        assert!(registry.register(Arc::new(MockSearch::default())).is_err());

        struct Impostor;
        #[async_trait]
        impl ResearchTool for Impostor {
            fn name(&self) -> &str {
                THINK
            }
            fn description(&self) -> &str {
                "not really"
            }
            fn parameters_schema(&self) -> serde_json::Value {
                serde_json::json!({"type": "object"})
            }
            async fn execute(
                &self,
                _arguments: serde_json::Value,
                _cancel: CancellationToken,
            ) -> std::result::Result<String, ToolExecutionError> {
                Ok(String::new())
            }
        }
        assert!(matches!(registry.register(Arc::new(Impostor)), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_stage_tool_sets() {
        let registry = registry();
        let supervisor: Vec<_> = registry.supervisor_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(supervisor, [CONDUCT_RESEARCH, RESEARCH_COMPLETE, REFLECT, THINK]);

        let researcher: Vec<_> = registry.researcher_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(researcher, ["web_search", "flaky", RESEARCH_COMPLETE, THINK]);
    }

    #[test]
    fn test_classify() {
        let registry = registry();
        assert_eq!(registry.classify(CONDUCT_RESEARCH), ToolKind::ConductResearch);
        assert_eq!(registry.classify("web_search"), ToolKind::Domain);
        assert_eq!(registry.classify("rm_rf"), ToolKind::Unknown);
    }

    #[tokio::test]
    async fn test_execute_validates_arguments() {
        let registry = registry();
        let output = registry
            .execute(&call("web_search", serde_json::json!({"q": 1})), CancellationToken::new())
            .await;
        assert!(output.is_error);
        assert!(output.content.contains("validation failed"));
    }

    #[tokio::test]
    async fn test_execute_captures_failures() {
        let registry = registry();
        let output = registry
            .execute(&call("flaky", serde_json::json!({})), CancellationToken::new())
            .await;
        assert_eq!(output, ToolOutput::error("Error executing flaky: upstream returned 502"));

        let output = registry
            .execute(&call("missing", serde_json::json!({})), CancellationToken::new())
            .await;
        assert!(output.is_error);
    }

    #[tokio::test]
    async fn test_execute_success() {
        let registry = registry();
        let output = registry
            .execute(&call("web_search", serde_json::json!({"query": "rust"})), CancellationToken::new())
            .await;
        assert!(!output.is_error);
        assert!(output.content.contains("rust"));
    }

    #[test]
    fn test_argument_helpers() {
        assert_eq!(
            research_topic(&call(CONDUCT_RESEARCH, serde_json::json!({"research_topic": "  A vs B "}))),
            Some("A vs B".to_string())
        );
        assert_eq!(research_topic(&call(CONDUCT_RESEARCH, serde_json::json!({}))), None);
        assert_eq!(
            reflection_text(&call(REFLECT, serde_json::json!({"reflection": "gap in pricing"}))),
            "gap in pricing"
        );
        assert_eq!(reflection_text(&call(THINK, serde_json::json!({"thought": "ok"}))), "ok");
    }
}
