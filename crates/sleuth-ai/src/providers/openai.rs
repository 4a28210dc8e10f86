//! OpenAI-compatible Chat Completions provider (OpenAI, Groq, OpenRouter, Ollama)

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    providers::{LlmProvider, open_event_source},
    stream::{MessageEvent, MessageEventStream},
    types::{AssistantMetadata, Content, Context, Message, Model, StopReason, StreamOptions, Usage},
};

/// OpenAI-compatible API client
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl OpenAIProvider {
    /// Create a provider; `None` omits the Authorization header (local servers)
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }

    fn build_request(&self, model: &Model, context: &Context, options: &StreamOptions) -> OpenAIRequest {
        let mut messages = Vec::new();

        if let Some(ref system_prompt) = context.system_prompt {
            messages.push(OpenAIMessage {
                role: "system",
                content: Some(system_prompt.clone()),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        messages.extend(context.messages.iter().filter_map(convert_message));

        let tools = if context.tools.is_empty() {
            None
        } else {
            Some(
                context
                    .tools
                    .iter()
                    .map(|t| OpenAITool {
                        tool_type: "function",
                        function: OpenAIFunction {
                            name: t.name.clone(),
                            description: Some(t.description.clone()),
                            parameters: Some(t.parameters.clone()),
                        },
                    })
                    .collect::<Vec<_>>(),
            )
        };

        let tool_choice = match (&options.forced_tool, &tools) {
            (Some(name), Some(_)) => Some(serde_json::json!({
                "type": "function",
                "function": { "name": name }
            })),
            (None, Some(_)) => Some(serde_json::json!("auto")),
            _ => None,
        };

        OpenAIRequest {
            model: model.id.clone(),
            messages,
            stream: true,
            stream_options: Some(StreamOptionsBody { include_usage: true }),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            tools,
            tool_choice,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAIProvider {
    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<MessageEventStream> {
        let request = self.build_request(model, context, options);
        let url = format!("{}/chat/completions", model.base_url);

        tracing::debug!(url = %url, model = %model.id, "OpenAI-compatible request");

        let mut request_builder = self
            .client
            .post(&url)
            .header("content-type", "application/json");
        if let Some(ref key) = self.api_key {
            request_builder = request_builder.bearer_auth(key);
        }
        for (key, value) in &model.headers {
            request_builder = request_builder.header(key, value);
        }

        let event_source = EventSource::new(request_builder.json(&request))
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;
        let event_source = open_event_source(event_source).await?;

        Ok(Box::pin(create_stream(event_source, model.clone())))
    }

    fn is_context_overflow(&self, error: &Error) -> bool {
        match error {
            Error::Api { error_type, .. } if error_type == "context_length_exceeded" => true,
            other => other.is_context_overflow(),
        }
    }
}

fn convert_message(msg: &Message) -> Option<OpenAIMessage> {
    match msg {
        Message::User { .. } => Some(OpenAIMessage {
            role: "user",
            content: Some(msg.text()),
            tool_calls: None,
            tool_call_id: None,
        }),
        Message::Assistant { content, .. } => {
            let tool_calls: Vec<OpenAIToolCall> = content
                .iter()
                .filter_map(|c| match c {
                    Content::ToolCall {
                        id,
                        name,
                        arguments,
                    } => Some(OpenAIToolCall {
                        id: id.clone(),
                        call_type: "function",
                        function: OpenAIFunctionCall {
                            name: name.clone(),
                            arguments: arguments.to_string(),
                        },
                    }),
                    _ => None,
                })
                .collect();
            let text = msg.text();
            if text.is_empty() && tool_calls.is_empty() {
                return None;
            }

            Some(OpenAIMessage {
                role: "assistant",
                content: (!text.is_empty()).then_some(text),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
            })
        }
        Message::ToolResult { tool_call_id, .. } => Some(OpenAIMessage {
            role: "tool",
            content: Some(msg.text()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.clone()),
        }),
    }
}

fn create_stream(
    mut event_source: EventSource,
    model: Model,
) -> impl futures::Stream<Item = MessageEvent> {
    stream! {
        let mut accumulated_text = String::new();
        // (id, name, arguments_json) indexed by the provider's tool call index
        let mut tool_calls: Vec<(String, String, String)> = Vec::new();
        let mut finish_reason: Option<String> = None;
        let mut usage = Usage::default();

        yield MessageEvent::Start { message: Message::assistant_empty() };

        while let Some(event) = event_source.next().await {
            let msg = match event {
                Ok(Event::Open) => continue,
                Ok(Event::Message(msg)) => msg,
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) => {
                    event_source.close();
                    yield MessageEvent::Error { error_type: None, message: format!("SSE error: {}", e) };
                    return;
                }
            };
            if msg.data == "[DONE]" {
                break;
            }

            let chunk = match serde_json::from_str::<StreamChunk>(&msg.data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    event_source.close();
                    yield MessageEvent::Error {
                        error_type: None,
                        message: format!("Failed to parse chunk: {}", e),
                    };
                    return;
                }
            };

            if let Some(error) = chunk.error {
                event_source.close();
                yield MessageEvent::Error {
                    error_type: error.code.or(error.error_type),
                    message: error.message,
                };
                return;
            }

            for choice in chunk.choices {
                if let Some(content) = choice.delta.content {
                    accumulated_text.push_str(&content);
                    yield MessageEvent::TextDelta { content_index: 0, delta: content };
                }

                for tc in choice.delta.tool_calls.unwrap_or_default() {
                    let idx = tc.index as usize;
                    while tool_calls.len() <= idx {
                        tool_calls.push((String::new(), String::new(), String::new()));
                    }
                    if let Some(id) = tc.id {
                        tool_calls[idx].0 = id;
                    }
                    if let Some(function) = tc.function {
                        if let Some(name) = function.name {
                            tool_calls[idx].1 = name;
                            yield MessageEvent::ToolCallStart {
                                content_index: idx + 1,
                                id: tool_calls[idx].0.clone(),
                                name: tool_calls[idx].1.clone(),
                            };
                        }
                        if let Some(args) = function.arguments {
                            tool_calls[idx].2.push_str(&args);
                            yield MessageEvent::ToolCallDelta { content_index: idx + 1, delta: args };
                        }
                    }
                }

                if let Some(reason) = choice.finish_reason {
                    finish_reason = Some(reason);
                }
            }

            if let Some(stream_usage) = chunk.usage {
                usage.input = stream_usage.prompt_tokens;
                usage.output = stream_usage.completion_tokens;
            }
        }
        event_source.close();

        let mut content = Vec::new();
        if !accumulated_text.is_empty() {
            content.push(Content::Text { text: accumulated_text });
        }
        for (id, name, args) in tool_calls {
            if !id.is_empty() && !name.is_empty() {
                let arguments = if args.trim().is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&args).unwrap_or(serde_json::Value::Null)
                };
                content.push(Content::ToolCall { id, name, arguments });
            }
        }

        let stop_reason = match finish_reason.as_deref() {
            Some("length") => StopReason::Length,
            Some("tool_calls") => StopReason::ToolUse,
            _ => StopReason::Stop,
        };

        let final_message = Message::Assistant {
            content,
            metadata: AssistantMetadata {
                provider: Some(model.provider),
                model: Some(model.id.clone()),
                usage: usage.clone(),
                stop_reason: Some(stop_reason),
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        };

        yield MessageEvent::Done {
            message: final_message,
            stop_reason,
            usage,
        };
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptionsBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct StreamOptionsBody {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct OpenAIToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    index: i32,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<String>,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tool;

    #[test]
    fn test_request_shape_with_forced_tool() {
        let provider = OpenAIProvider::new(Some("key".into()));
        let model = Model::from_id("openai:gpt-4.1").unwrap();
        let context = Context {
            system_prompt: Some("be precise".into()),
            messages: vec![
                Message::user("question"),
                Message::assistant(vec![Content::tool_call(
                    "call_1",
                    "web_search",
                    serde_json::json!({"query": "rust"}),
                )]),
                Message::tool_result("call_1", "web_search", "results", false),
            ],
            tools: vec![Tool::new("clarify", "ask", serde_json::json!({"type": "object"}))],
        };
        let options = StreamOptions {
            forced_tool: Some("clarify".into()),
            ..Default::default()
        };
        let request = serde_json::to_value(provider.build_request(&model, &context, &options)).unwrap();

        assert_eq!(request["messages"][0]["role"], "system");
        assert_eq!(request["messages"][2]["tool_calls"][0]["function"]["arguments"], r#"{"query":"rust"}"#);
        assert!(request["messages"][2].get("content").is_none());
        assert_eq!(request["messages"][3]["tool_call_id"], "call_1");
        assert_eq!(request["tool_choice"]["function"]["name"], "clarify");
        assert!(request.get("max_tokens").is_none());
    }

    #[test]
    fn test_overflow_predicate_uses_error_code() {
        let provider = OpenAIProvider::new(None);
        assert!(provider.is_context_overflow(&Error::api("context_length_exceeded", "HTTP 400: bad request")));
        assert!(provider.is_context_overflow(&Error::api(
            "invalid_request_error",
            "This model's maximum context length is 128000 tokens"
        )));
        assert!(!provider.is_context_overflow(&Error::api("invalid_api_key", "nope")));
    }
}
