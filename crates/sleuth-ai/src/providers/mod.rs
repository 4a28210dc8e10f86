//! LLM Provider implementations

pub mod anthropic;
pub mod openai;

use crate::{Context, Error, MessageEventStream, Model, Result, StreamOptions};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::Deserialize;

/// Trait for LLM providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stream a response from the LLM
    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<MessageEventStream>;

    /// Whether `error` is this provider's way of saying the conversation no
    /// longer fits the model's context window.
    fn is_context_overflow(&self, error: &Error) -> bool {
        error.is_context_overflow()
    }
}

/// Get an API key from a provided value or the environment
pub fn get_api_key(provided: Option<&str>, env_var: &str) -> Result<String> {
    if let Some(key) = provided {
        return Ok(key.to_string());
    }

    std::env::var(env_var).map_err(|_| Error::InvalidApiKey)
}

/// Wait for the SSE connection to open so HTTP-level failures surface as
/// typed errors from `stream()` rather than as a mid-stream event.
pub(crate) async fn open_event_source(mut event_source: EventSource) -> Result<EventSource> {
    match event_source.next().await {
        Some(Ok(Event::Open)) => Ok(event_source),
        Some(Ok(Event::Message(message))) => Err(Error::UnexpectedResponse(format!(
            "event '{}' received before the stream opened",
            message.event
        ))),
        Some(Err(reqwest_eventsource::Error::InvalidStatusCode(_, response))) => {
            event_source.close();
            Err(error_from_response(response).await)
        }
        Some(Err(reqwest_eventsource::Error::Transport(e))) => Err(Error::Http(e)),
        Some(Err(e)) => Err(Error::Sse(e.to_string())),
        None => Err(Error::UnexpectedResponse(
            "event stream closed before opening".to_string(),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<serde_json::Value>,
    message: Option<String>,
}

/// Convert a non-success HTTP response into a provider error.
///
/// Anthropic and OpenAI-compatible APIs both wrap failures as
/// `{"error": {"type" | "code": ..., "message": ...}}`.
pub(crate) async fn error_from_response(response: reqwest::Response) -> Error {
    let status = response.status();
    if status.as_u16() == 429 {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        return Error::RateLimited { retry_after };
    }
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Error::InvalidApiKey;
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => {
            let error_type = envelope
                .error
                .code
                .and_then(|c| c.as_str().map(str::to_string))
                .or(envelope.error.error_type)
                .unwrap_or_else(|| format!("http_{}", status.as_u16()));
            let message = envelope.error.message.unwrap_or(body);
            Error::api(error_type, format!("HTTP {}: {}", status.as_u16(), message))
        }
        Err(_) => Error::api(
            format!("http_{}", status.as_u16()),
            format!("HTTP {}: {}", status.as_u16(), body),
        ),
    }
}
