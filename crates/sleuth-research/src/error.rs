//! Error types for sleuth-research

use thiserror::Error;

/// Result type alias using sleuth-research Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating research
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the model backend
    #[error(transparent)]
    Ai(#[from] sleuth_ai::Error),

    /// The model kept answering with output that does not match the schema
    #[error("structured output '{schema}' still invalid after {attempts} attempts: {reason}")]
    StructuredOutputInvalid {
        schema: String,
        attempts: u32,
        reason: String,
    },

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The session's cancellation token fired
    #[error("research cancelled")]
    Cancelled,

    /// A generic engine error
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
