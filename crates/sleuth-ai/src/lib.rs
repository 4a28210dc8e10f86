//! sleuth-ai: LLM provider adapters behind a single completion contract
//!
//! Model ids are opaque `"provider:model-name"` strings. Anthropic speaks the
//! Messages API; OpenAI, Groq, OpenRouter and Ollama share the Chat
//! Completions adapter.

pub mod backend;
pub mod error;
pub mod providers;
pub mod stream;
pub mod types;

pub use backend::{Completion, CompletionRequest, ModelBackend, OutputSchema, ProviderBackend};
pub use error::{Error, Result};
pub use stream::MessageEventStream;
pub use types::*;
