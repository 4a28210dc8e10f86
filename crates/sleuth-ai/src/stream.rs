//! Streaming event types and collection into a final message

use crate::error::{Error, Result};
use crate::types::{Message, StopReason, Usage};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// Events emitted during message streaming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageEvent {
    /// Initial message structure
    Start { message: Message },
    /// Text content delta
    TextDelta { content_index: usize, delta: String },
    /// Tool call started
    ToolCallStart {
        content_index: usize,
        id: String,
        name: String,
    },
    /// Tool call arguments delta (partial JSON)
    ToolCallDelta { content_index: usize, delta: String },
    /// Message completed successfully
    Done {
        message: Message,
        stop_reason: StopReason,
        usage: Usage,
    },
    /// Error reported by the provider mid-stream
    Error {
        error_type: Option<String>,
        message: String,
    },
}

/// A stream of message events
pub type MessageEventStream = Pin<Box<dyn Stream<Item = MessageEvent> + Send>>;

/// Drain a provider stream into the final assistant message.
///
/// Deltas are ignored; providers always emit a complete message with `Done`.
pub async fn collect_message(mut stream: MessageEventStream) -> Result<(Message, Usage)> {
    while let Some(event) = stream.next().await {
        match event {
            MessageEvent::Done { message, usage, .. } => return Ok((message, usage)),
            MessageEvent::Error {
                error_type: Some(error_type),
                message,
            } => return Err(Error::api(error_type, message)),
            MessageEvent::Error {
                error_type: None,
                message,
            } => return Err(Error::Sse(message)),
            _ => {}
        }
    }
    Err(Error::UnexpectedResponse(
        "stream ended without a final message".to_string(),
    ))
}
