//! sleuth-research: multi-agent research orchestration
//!
//! A [`ResearchSession`] turns a user request into a cited report: an
//! optional clarifying question, a research brief, a supervisor loop that
//! fans topics out to concurrent researchers, and a final synthesis.

pub mod citations;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod prompts;
pub mod researcher;
pub mod session;
pub mod supervisor;
pub mod tools;

#[cfg(test)]
mod testing;

pub use config::{ResearchConfig, StageModel};
pub use error::{Error, Result};
pub use events::ResearchEvent;
pub use gateway::{ModelGateway, ModelRequest, ModelResponse, RetryConfig};
pub use researcher::{Researcher, ResearcherState};
pub use session::{ResearchSession, SessionOutcome, SessionStatus};
pub use supervisor::{Supervisor, SupervisorOutcome, SupervisorState};
pub use tools::{BoxedTool, ResearchTool, ToolExecutionError, ToolRegistry};
