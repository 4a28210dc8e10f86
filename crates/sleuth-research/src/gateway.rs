//! Model gateway: one place that talks to the backend
//!
//! Wraps every model call with transient-error backoff, context-overflow
//! truncation and structured-output validation.

use std::{sync::Arc, time::Duration};

use sleuth_ai::{Completion, CompletionRequest, Message, ModelBackend, OutputSchema, Tool, Usage};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ResearchConfig, StageModel},
    error::{Error, Result},
    events::ResearchEvent,
};

/// Retry configuration for transient provider failures
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Everything about a call except the conversation
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    pub tools: Vec<Tool>,
    pub output_schema: Option<OutputSchema>,
}

impl ModelRequest {
    pub fn new(stage: &StageModel) -> Self {
        Self {
            model: stage.model.clone(),
            max_tokens: stage.max_tokens,
            system_prompt: None,
            tools: Vec::new(),
            output_schema: None,
        }
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn output_schema(mut self, schema: OutputSchema) -> Self {
        self.output_schema = Some(schema);
        self
    }
}

/// Result of [`ModelGateway::invoke`]
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub message: Message,
    /// Schema-valid output when the request carried an output schema
    pub structured: Option<serde_json::Value>,
    /// Set when overflow recovery gave up; `message` is empty in that case
    pub incomplete: bool,
    pub reason: Option<String>,
    pub usage: Usage,
}

impl ModelResponse {
    fn degraded(reason: impl Into<String>) -> Self {
        Self {
            message: Message::assistant_empty(),
            structured: None,
            incomplete: true,
            reason: Some(reason.into()),
            usage: Usage::default(),
        }
    }
}

/// Drop messages from the end back through the most recent assistant message.
///
/// Returns the number of messages removed; zero means there was no assistant
/// message left and the conversation is untouched.
pub fn truncate_to_last_assistant(conversation: &mut Vec<Message>) -> usize {
    match conversation.iter().rposition(Message::is_assistant) {
        Some(idx) => {
            let removed = conversation.len() - idx;
            conversation.truncate(idx);
            removed
        }
        None => 0,
    }
}

/// Stateless facade over a [`ModelBackend`]
pub struct ModelGateway {
    backend: Arc<dyn ModelBackend>,
    max_overflow_retries: u32,
    max_structured_output_retries: u32,
    retry_config: RetryConfig,
    event_tx: Option<broadcast::Sender<ResearchEvent>>,
}

impl ModelGateway {
    pub fn new(backend: Arc<dyn ModelBackend>, config: &ResearchConfig) -> Self {
        Self {
            backend,
            max_overflow_retries: config.max_overflow_retries,
            max_structured_output_retries: config.max_structured_output_retries,
            retry_config: RetryConfig::default(),
            event_tx: None,
        }
    }

    /// Set retry configuration
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn with_events(mut self, event_tx: broadcast::Sender<ResearchEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Invoke the model on `conversation`.
    ///
    /// On context overflow the conversation is truncated in place and the
    /// call retried. Exhausted overflow recovery yields a degraded response,
    /// never an error.
    pub async fn invoke(
        &self,
        request: &ModelRequest,
        conversation: &mut Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse> {
        let validator = match request.output_schema {
            Some(ref schema) => Some(jsonschema::validator_for(&schema.schema).map_err(|e| {
                Error::InvalidConfig(format!("output schema '{}' does not compile: {}", schema.name, e))
            })?),
            None => None,
        };

        let mut overflow_retries = 0u32;
        let mut structured_attempts = 0u32;

        loop {
            let completion = match self.complete_with_backoff(request, conversation, cancel).await {
                Ok(completion) => completion,
                Err(Error::Ai(e)) if self.backend.is_context_overflow(&request.model, &e) => {
                    if overflow_retries >= self.max_overflow_retries {
                        tracing::warn!(
                            model = %request.model,
                            retries = overflow_retries,
                            "context overflow persisted, giving up"
                        );
                        return Ok(ModelResponse::degraded(format!(
                            "context overflow persisted after {} truncation retries: {}",
                            overflow_retries, e
                        )));
                    }
                    let removed = truncate_to_last_assistant(conversation);
                    if removed == 0 {
                        tracing::warn!(model = %request.model, "context overflow with nothing left to truncate");
                        return Ok(ModelResponse::degraded(format!(
                            "context overflow with no assistant message left to truncate: {}",
                            e
                        )));
                    }
                    overflow_retries += 1;
                    tracing::warn!(
                        model = %request.model,
                        removed,
                        attempt = overflow_retries,
                        "context overflow, truncated conversation and retrying"
                    );
                    self.emit(ResearchEvent::ContextTruncated {
                        model: request.model.clone(),
                        removed,
                        attempt: overflow_retries,
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            let (Some(schema), Some(validator)) = (&request.output_schema, &validator) else {
                return Ok(ModelResponse {
                    message: completion.message,
                    structured: None,
                    incomplete: false,
                    reason: None,
                    usage: completion.usage,
                });
            };

            structured_attempts += 1;
            match validate_structured(completion.structured.as_ref(), validator) {
                Ok(()) => {
                    return Ok(ModelResponse {
                        message: completion.message,
                        structured: completion.structured,
                        incomplete: false,
                        reason: None,
                        usage: completion.usage,
                    });
                }
                Err(reason) if structured_attempts > self.max_structured_output_retries => {
                    return Err(Error::StructuredOutputInvalid {
                        schema: schema.name.clone(),
                        attempts: structured_attempts,
                        reason,
                    });
                }
                Err(reason) => {
                    tracing::warn!(
                        schema = %schema.name,
                        attempt = structured_attempts,
                        "structured output rejected: {}",
                        reason
                    );
                }
            }
        }
    }

    /// One backend call, retrying transient failures with backoff
    async fn complete_with_backoff(
        &self,
        request: &ModelRequest,
        conversation: &[Message],
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        let mut completion_request = CompletionRequest::new(request.model.clone())
            .messages(conversation.to_vec())
            .tools(request.tools.clone())
            .max_tokens(request.max_tokens);
        if let Some(prompt) = &request.system_prompt {
            completion_request = completion_request.system_prompt(prompt.clone());
        }
        if let Some(schema) = &request.output_schema {
            completion_request = completion_request.output_schema(schema.clone());
        }

        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            tracing::debug!(
                model = %request.model,
                messages = conversation.len(),
                tools = request.tools.len(),
                "model call"
            );

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = self.backend.complete(&completion_request) => result,
            };

            match result {
                Ok(completion) => return Ok(completion),
                Err(e)
                    if e.is_retryable()
                        && !self.backend.is_context_overflow(&request.model, &e)
                        && attempt < self.retry_config.max_retries =>
                {
                    let delay = match &e {
                        sleuth_ai::Error::RateLimited {
                            retry_after: Some(secs),
                        } => Duration::from_secs(*secs).min(self.retry_config.max_delay),
                        _ => self.retry_config.delay_for_attempt(attempt),
                    };
                    tracing::warn!(
                        model = %request.model,
                        attempt = attempt + 1,
                        "Request failed: {}. Retrying in {:?}...",
                        e,
                        delay
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(Error::Ai(e)),
            }
        }
    }

    fn emit(&self, event: ResearchEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }
}

fn validate_structured(
    value: Option<&serde_json::Value>,
    validator: &jsonschema::Validator,
) -> std::result::Result<(), String> {
    let Some(value) = value else {
        return Err("response carried no structured output".to_string());
    };
    let errors: Vec<String> = validator
        .iter_errors(value)
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
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
