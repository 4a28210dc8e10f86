//! Research progress events

use serde::{Deserialize, Serialize};

use crate::session::SessionStatus;

/// Events emitted while a session runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResearchEvent {
    SessionStart { session_id: String },

    /// The clarification stage decided no question is needed
    ClarificationVerified { message: String },

    /// The session stopped to ask the user something
    ClarificationRequested { question: String },

    BriefReady { brief: String },

    SupervisorTurn { turn: u32, iteration: u32 },

    /// A delegation batch is about to fan out
    DelegationBatch { topics: Vec<String>, deferred: usize },

    Reflection { content: String },

    ResearcherStart { topic: String },

    ToolExecutionStart {
        topic: String,
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    ToolExecutionEnd {
        topic: String,
        tool_call_id: String,
        tool_name: String,
        is_error: bool,
    },

    ResearcherEnd {
        topic: String,
        tool_call_count: u32,
        incomplete: bool,
    },

    /// Messages were dropped to fit the context window
    ContextTruncated {
        model: String,
        removed: usize,
        attempt: u32,
    },

    FinalReportStart,

    SessionEnd { status: SessionStatus },
}

impl ResearchEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResearchEvent::SessionEnd { .. })
    }
}
