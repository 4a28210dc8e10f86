//! Error types for sleuth-ai

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Result type alias using sleuth-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to an LLM provider
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response
    #[error("API error: {message} (type: {error_type})")]
    Api { error_type: String, message: String },

    /// Rate limit exceeded
    #[error("Rate limited: retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Invalid API key
    #[error("Invalid or missing API key")]
    InvalidApiKey,

    /// Server-sent events error
    #[error("SSE error: {0}")]
    Sse(String),

    /// Unexpected response format
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Provider not supported
    #[error("Provider not supported: {0}")]
    UnsupportedProvider(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Context overflow / too many tokens
    #[error("Context overflow: {0}")]
    ContextOverflow(String),
}

impl Error {
    /// Create an API error from type and message
    pub fn api(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the identical request later might succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::RateLimited { .. } => true,
            Error::Sse(message) => !is_context_overflow_message(message) && is_transient_message(message),
            Error::Api {
                error_type,
                message,
            } => {
                let et = error_type.to_lowercase();
                et.contains("rate_limit")
                    || et.contains("overloaded")
                    || (!is_context_overflow_message(message) && is_transient_message(message))
            }
            _ => false,
        }
    }

    /// Generic context-overflow check shared by all providers.
    ///
    /// Provider adapters may refine this through
    /// [`LlmProvider::is_context_overflow`](crate::providers::LlmProvider::is_context_overflow).
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::ContextOverflow(_) => true,
            Error::Api {
                error_type,
                message,
            } => {
                is_context_overflow_message(message) || is_context_overflow_message(error_type)
            }
            Error::Sse(message) | Error::UnexpectedResponse(message) => {
                is_context_overflow_message(message)
            }
            _ => false,
        }
    }
}

fn is_transient_message(error: &str) -> bool {
    let lower = error.to_lowercase();
    ["429", "rate limit", "too many requests", "timeout", "connection", "overloaded"]
        .iter()
        .any(|p| lower.contains(p))
        || ["500", "502", "503", "504", "529"]
            .iter()
            .any(|code| lower.split(|c: char| !c.is_ascii_digit()).any(|t| t == *code))
}

/// Overflow phrasing across providers (Anthropic, OpenAI, Google, Groq,
/// OpenRouter, llama.cpp, vLLM).
static OVERFLOW_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)context.?length.?exceed",
        r"(?i)maximum.?context.?length",
        r"(?i)context.?window.?(exceed|full|limit)",
        r"(?i)too.?many.?tokens",
        r"(?i)prompt.?(is.?)?too.?long",
        r"(?i)input.?too.?long",
        r"(?i)token.?limit.?(exceed|reach)",
        r"(?i)exceeds?.+token.?limit",
        r"(?i)request.?too.?large",
        r"(?i)messages?.?too.?long",
        r"(?i)reduce.?the.?length",
        r"(?i)context_length_exceeded",
        r"(?i)max_tokens.*(exceed|limit|too|overflow)",
        r"(?i)context.?overflow",
        r"(?i)sequence.?too.?long",
        r"(?i)context.?size.?exceed",
        r"(?i)total.?tokens?.?exceed",
        r"\b413\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Check whether a provider error string reports a context overflow
pub fn is_context_overflow_message(error: &str) -> bool {
    OVERFLOW_PATTERNS.iter().any(|re| re.is_match(error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_variants() {
        assert!(Error::RateLimited { retry_after: Some(5) }.is_retryable());
        assert!(Error::Sse("connection reset by peer".into()).is_retryable());
        assert!(Error::api("overloaded_error", "busy").is_retryable());
        assert!(Error::api("error", "HTTP 503 Service Unavailable").is_retryable());
    }

    #[test]
    fn test_not_retryable() {
        assert!(!Error::InvalidApiKey.is_retryable());
        assert!(!Error::api("authentication_error", "Invalid API key").is_retryable());
        assert!(!Error::ContextOverflow("too big".into()).is_retryable());
        // Overflow text must never be treated as transient, even with a 5xx-looking id
        assert!(!Error::api("invalid_request_error", "prompt is too long: 500123 tokens").is_retryable());
    }

    #[test]
    fn test_port_numbers_are_not_status_codes() {
        assert!(!Error::Sse("listening on 15003".into()).is_retryable());
    }

    #[test]
    fn test_overflow_typed_variant() {
        assert!(Error::ContextOverflow("too big".into()).is_context_overflow());
    }

    #[test]
    fn test_overflow_api_messages() {
        for msg in [
            "prompt is too long: 210000 tokens > 200000 maximum",
            "This model's maximum context length is 128000 tokens",
            "Request exceeds the input token limit",
            "Please reduce the length of the messages",
            "HTTP 413 Payload Too Large",
        ] {
            assert!(Error::api("invalid_request_error", msg).is_context_overflow(), "{msg}");
        }
    }

    #[test]
    fn test_overflow_error_type_only() {
        assert!(Error::api("context_length_exceeded", "bad request").is_context_overflow());
    }

    #[test]
    fn test_not_overflow() {
        assert!(!Error::api("authentication_error", "Invalid API key").is_context_overflow());
        assert!(!Error::RateLimited { retry_after: None }.is_context_overflow());
        assert!(!Error::Sse("connection timeout".into()).is_context_overflow());
        assert!(!is_context_overflow_message("max_tokens must be positive"));
    }
}
