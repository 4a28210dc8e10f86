//! Research configuration

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Model used for one stage of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageModel {
    /// Opaque `"provider:model-name"` id handed to the backend
    pub model: String,
    /// Cap on generated tokens; `None` leaves it to the adapter
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl StageModel {
    pub fn new(model: impl Into<String>, max_tokens: Option<u32>) -> Self {
        Self {
            model: model.into(),
            max_tokens,
        }
    }
}

/// Limits and models for a research session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    /// Delegation batches the supervisor may run
    pub max_researcher_iterations: u32,
    /// Tool batches a single researcher may run before compressing
    pub max_react_tool_calls: u32,
    /// Researchers allowed to run at once
    pub max_concurrent_research_units: usize,
    /// Truncate-and-retry attempts after a context overflow
    pub max_overflow_retries: u32,
    /// Re-asks after a response that fails its output schema
    pub max_structured_output_retries: u32,
    /// Ask the user a clarifying question before researching
    pub allow_clarification: bool,
    /// Clarification and brief generation
    pub brief_model: StageModel,
    /// Supervisor and researchers
    pub research_model: StageModel,
    pub compression_model: StageModel,
    pub final_report_model: StageModel,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_researcher_iterations: 6,
            max_react_tool_calls: 10,
            max_concurrent_research_units: 5,
            max_overflow_retries: 3,
            max_structured_output_retries: 3,
            allow_clarification: true,
            brief_model: StageModel::new("anthropic:claude-sonnet-4-5", Some(8192)),
            research_model: StageModel::new("anthropic:claude-sonnet-4-5", Some(10000)),
            compression_model: StageModel::new("anthropic:claude-haiku-4-5", Some(8192)),
            final_report_model: StageModel::new("anthropic:claude-sonnet-4-5", Some(10000)),
        }
    }
}

impl ResearchConfig {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_research_units == 0 {
            return Err(Error::InvalidConfig(
                "max_concurrent_research_units must be at least 1".to_string(),
            ));
        }
        for (stage, model) in [
            ("brief_model", &self.brief_model),
            ("research_model", &self.research_model),
            ("compression_model", &self.compression_model),
            ("final_report_model", &self.final_report_model),
        ] {
            if model.model.trim().is_empty() {
                return Err(Error::InvalidConfig(format!("{} has an empty model id", stage)));
            }
            if model.max_tokens == Some(0) {
                return Err(Error::InvalidConfig(format!("{}.max_tokens must be positive", stage)));
            }
        }
        Ok(())
    }
}
