//! Request/response contract between the research engine and the providers

use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    error::{Error, Result},
    providers::{
        LlmProvider, anthropic::AnthropicProvider, get_api_key, openai::OpenAIProvider,
    },
    stream::collect_message,
    types::{Api, Context, Message, Model, Provider, StreamOptions, Tool, Usage},
};

/// JSON Schema a response must satisfy
#[derive(Debug, Clone)]
pub struct OutputSchema {
    /// Schema name; also the name of the forced tool carrying the output
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
}

impl OutputSchema {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
        }
    }
}

/// A single model invocation
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Opaque `"provider:model-name"` identifier
    pub model: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
    pub output_schema: Option<OutputSchema>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            messages: Vec::new(),
            tools: Vec::new(),
            output_schema: None,
            max_tokens: None,
        }
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
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

    pub fn max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// The model's answer to a [`CompletionRequest`]
#[derive(Debug, Clone)]
pub struct Completion {
    /// Assistant message, including any tool calls in emission order
    pub message: Message,
    /// Raw structured output when an output schema was requested.
    /// Not yet validated against the schema.
    pub structured: Option<serde_json::Value>,
    pub usage: Usage,
}

/// Anything that can answer a completion request
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Whether `error`, returned for `model`, means the input exceeded the
    /// model's context window.
    fn is_context_overflow(&self, model: &str, error: &Error) -> bool {
        let _ = model;
        error.is_context_overflow()
    }
}

/// [`ModelBackend`] that dispatches on the provider prefix of the model id
#[derive(Debug, Clone, Default)]
pub struct ProviderBackend {
    api_keys: HashMap<Provider, String>,
    base_urls: HashMap<Provider, String>,
}

impl ProviderBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this key instead of the provider's environment variable
    pub fn with_api_key(mut self, provider: Provider, key: impl Into<String>) -> Self {
        self.api_keys.insert(provider, key.into());
        self
    }

    /// Send this provider's requests to a different endpoint
    pub fn with_base_url(mut self, provider: Provider, base_url: impl Into<String>) -> Self {
        self.base_urls.insert(provider, base_url.into());
        self
    }

    fn resolve(&self, model_id: &str) -> Result<Model> {
        let model = Model::from_id(model_id)?;
        Ok(match self.base_urls.get(&model.provider) {
            Some(url) => model.with_base_url(url.clone()),
            None => model,
        })
    }

    fn provider_for(&self, model: &Model) -> Result<Box<dyn LlmProvider>> {
        let key = self.api_keys.get(&model.provider).map(String::as_str);
        match model.api {
            Api::AnthropicMessages => Ok(Box::new(AnthropicProvider::from_key_or_env(key)?)),
            Api::OpenAICompletions => {
                let key = match model.provider.api_key_env_var() {
                    Some(env_var) => Some(get_api_key(key, env_var)?),
                    None => key.map(str::to_string),
                };
                Ok(Box::new(OpenAIProvider::new(key)))
            }
        }
    }
}

#[async_trait]
impl ModelBackend for ProviderBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let model = self.resolve(&request.model)?;
        let provider = self.provider_for(&model)?;

        let mut tools = request.tools.clone();
        let mut options = StreamOptions {
            max_tokens: request.max_tokens,
            ..Default::default()
        };
        if let Some(ref schema) = request.output_schema {
            tools.push(Tool::new(
                schema.name.clone(),
                schema.description.clone(),
                schema.schema.clone(),
            ));
            options.forced_tool = Some(schema.name.clone());
        }

        let context = Context {
            system_prompt: request.system_prompt.clone(),
            messages: request.messages.clone(),
            tools,
        };

        let stream = provider.stream(&model, &context, &options).await?;
        let (message, usage) = collect_message(stream).await?;

        let structured = request
            .output_schema
            .as_ref()
            .and_then(|schema| extract_structured(&message, &schema.name));

        Ok(Completion {
            message,
            structured,
            usage,
        })
    }

    fn is_context_overflow(&self, model: &str, error: &Error) -> bool {
        match self.resolve(model).and_then(|m| self.provider_for(&m)) {
            Ok(provider) => provider.is_context_overflow(error),
            Err(_) => error.is_context_overflow(),
        }
    }
}

/// Pull the structured payload out of an assistant message.
///
/// Prefers the forced tool call; falls back to a JSON object in the text for
/// models that ignore `tool_choice`.
pub fn extract_structured(message: &Message, schema_name: &str) -> Option<serde_json::Value> {
    if let Some(call) = message
        .tool_calls()
        .into_iter()
        .find(|call| call.name == schema_name)
    {
        return Some(call.arguments);
    }

    let text = message.text();
    let trimmed = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .filter(|v| v.is_object())
}
