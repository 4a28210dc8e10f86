//! Anthropic Messages API provider

use crate::{
    error::{Error, Result, is_context_overflow_message},
    providers::{LlmProvider, get_api_key, open_event_source},
    stream::{MessageEvent, MessageEventStream},
    types::{
        AssistantMetadata, Content, Context, Message, Model, StopReason, StreamOptions, Tool,
        Usage,
    },
};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Tool choice strategy
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Any,
    Tool { name: String },
}

/// Anthropic API client
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
        }
    }

    /// Create from a configured key, falling back to `ANTHROPIC_API_KEY`
    pub fn from_key_or_env(api_key: Option<&str>) -> Result<Self> {
        Ok(Self::new(get_api_key(api_key, "ANTHROPIC_API_KEY")?))
    }

    fn build_request(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> AnthropicRequest {
        let tools = if context.tools.is_empty() {
            None
        } else {
            Some(convert_tools(&context.tools))
        };
        let tool_choice = match (&options.forced_tool, &tools) {
            (Some(name), Some(_)) => Some(ToolChoice::Tool { name: name.clone() }),
            (None, Some(_)) => Some(ToolChoice::Auto),
            _ => None,
        };

        AnthropicRequest {
            model: model.id.clone(),
            messages: convert_messages(&context.messages),
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            stream: true,
            system: context.system_prompt.as_ref().map(|text| {
                vec![SystemBlock {
                    block_type: "text".to_string(),
                    text: text.clone(),
                    cache_control: Some(CacheControl {
                        control_type: "ephemeral".to_string(),
                    }),
                }]
            }),
            temperature: options.temperature,
            tools,
            tool_choice,
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<MessageEventStream> {
        let request = self.build_request(model, context, options);
        let url = format!("{}/v1/messages", model.base_url);

        tracing::debug!(url = %url, model = %model.id, "Anthropic request");

        let mut request_builder = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("accept", "application/json")
            .header("content-type", "application/json");
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
            // Anthropic reports overflow as invalid_request_error "prompt is too long"
            Error::Api { message, .. } => is_context_overflow_message(message),
            other => other.is_context_overflow(),
        }
    }
}

/// Create the event stream from SSE events
fn create_stream(
    mut event_source: EventSource,
    model: Model,
) -> impl futures::Stream<Item = MessageEvent> {
    stream! {
        let mut usage = Usage::default();
        let mut stop_reason = StopReason::Stop;
        let mut blocks: Vec<ContentBlock> = vec![];

        yield MessageEvent::Start {
            message: Message::assistant_empty(),
        };

        while let Some(event_result) = event_source.next().await {
            let message = match event_result {
                Ok(Event::Open) => continue,
                Ok(Event::Message(message)) => message,
                Err(e) => {
                    event_source.close();
                    yield MessageEvent::Error { error_type: None, message: e.to_string() };
                    return;
                }
            };

            match message.event.as_str() {
                "message_start" => {
                    if let Ok(data) = serde_json::from_str::<MessageStartEvent>(&message.data) {
                        apply_usage(&mut usage, &data.message.usage);
                    }
                }
                "content_block_start" => {
                    let Ok(data) = serde_json::from_str::<ContentBlockStartEvent>(&message.data) else {
                        continue;
                    };
                    let index = data.index as usize;
                    while blocks.len() <= index {
                        blocks.push(ContentBlock::Empty);
                    }
                    let block = match data.content_block.block_type.as_str() {
                        "text" => ContentBlock::Text(String::new()),
                        "tool_use" => {
                            let id = data.content_block.id.unwrap_or_default();
                            let name = data.content_block.name.unwrap_or_default();
                            yield MessageEvent::ToolCallStart {
                                content_index: index,
                                id: id.clone(),
                                name: name.clone(),
                            };
                            ContentBlock::ToolCall { id, name, arguments_json: String::new() }
                        }
                        _ => ContentBlock::Empty,
                    };
                    blocks[index] = block;
                }
                "content_block_delta" => {
                    let Ok(data) = serde_json::from_str::<ContentBlockDeltaEvent>(&message.data) else {
                        continue;
                    };
                    let index = data.index as usize;
                    let Some(block) = blocks.get_mut(index) else {
                        continue;
                    };
                    match (block, data.delta.delta_type.as_str()) {
                        (ContentBlock::Text(text), "text_delta") => {
                            let delta = data.delta.text.unwrap_or_default();
                            text.push_str(&delta);
                            yield MessageEvent::TextDelta { content_index: index, delta };
                        }
                        (ContentBlock::ToolCall { arguments_json, .. }, "input_json_delta") => {
                            let delta = data.delta.partial_json.unwrap_or_default();
                            arguments_json.push_str(&delta);
                            yield MessageEvent::ToolCallDelta { content_index: index, delta };
                        }
                        _ => {}
                    }
                }
                "message_delta" => {
                    if let Ok(data) = serde_json::from_str::<MessageDeltaEvent>(&message.data) {
                        if let Some(reason) = data.delta.stop_reason {
                            stop_reason = map_stop_reason(&reason);
                        }
                        apply_usage(&mut usage, &data.usage);
                    }
                }
                "message_stop" => break,
                "error" => {
                    event_source.close();
                    let (error_type, text) = match serde_json::from_str::<ErrorEvent>(&message.data) {
                        Ok(data) => (Some(data.error.error_type), data.error.message),
                        Err(_) => (None, message.data.clone()),
                    };
                    yield MessageEvent::Error { error_type, message: text };
                    return;
                }
                _ => {}
            }
        }
        event_source.close();

        let content: Vec<Content> = blocks
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text(text) => Some(Content::Text { text }),
                ContentBlock::ToolCall { id, name, arguments_json } => {
                    let arguments = if arguments_json.trim().is_empty() {
                        serde_json::json!({})
                    } else {
                        serde_json::from_str(&arguments_json).unwrap_or(serde_json::Value::Null)
                    };
                    Some(Content::ToolCall { id, name, arguments })
                }
                ContentBlock::Empty => None,
            })
            .collect();

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

fn apply_usage(usage: &mut Usage, info: &UsageInfo) {
    if let Some(input) = info.input_tokens {
        usage.input = input;
    }
    usage.output = info.output_tokens;
    usage.cache_read = info.cache_read_input_tokens.unwrap_or(usage.cache_read);
    usage.cache_write = info.cache_creation_input_tokens.unwrap_or(usage.cache_write);
}

#[derive(Debug)]
enum ContentBlock {
    Empty,
    Text(String),
    ToolCall {
        id: String,
        name: String,
        arguments_json: String,
    },
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<SystemBlock>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Serialize)]
struct SystemBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Debug, Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    control_type: String,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

// ============================================================================
// Response event types
// ============================================================================

#[derive(Debug, Deserialize)]
struct MessageStartEvent {
    message: MessageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    usage: UsageInfo,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: u32,
    cache_read_input_tokens: Option<u32>,
    cache_creation_input_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStartEvent {
    index: u32,
    content_block: ContentBlockInfo,
}

#[derive(Debug, Deserialize)]
struct ContentBlockInfo {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDeltaEvent {
    index: u32,
    delta: DeltaInfo,
}

#[derive(Debug, Deserialize)]
struct DeltaInfo {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    partial_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaEvent {
    delta: MessageDelta,
    usage: UsageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

// ============================================================================
// Conversion functions
// ============================================================================

/// Convert messages to Anthropic's alternating user/assistant shape.
///
/// Tool results travel as user-role blocks, so consecutive user-role
/// messages (results followed by a note) are merged into one turn.
fn convert_messages(messages: &[Message]) -> Vec<AnthropicMessage> {
    let mut result: Vec<AnthropicMessage> = vec![];

    for message in messages {
        let (role, blocks): (&'static str, Vec<serde_json::Value>) = match message {
            Message::User { content, .. } => (
                "user",
                content
                    .iter()
                    .filter_map(|c| c.as_text())
                    .map(|text| serde_json::json!({ "type": "text", "text": text }))
                    .collect(),
            ),
            Message::Assistant { content, .. } => (
                "assistant",
                content
                    .iter()
                    .filter_map(|c| match c {
                        Content::Text { text } if !text.is_empty() => {
                            Some(serde_json::json!({ "type": "text", "text": text }))
                        }
                        Content::ToolCall {
                            id,
                            name,
                            arguments,
                        } => Some(serde_json::json!({
                            "type": "tool_use",
                            "id": id,
                            "name": name,
                            "input": arguments
                        })),
                        _ => None,
                    })
                    .collect(),
            ),
            Message::ToolResult {
                tool_call_id,
                content,
                is_error,
                ..
            } => (
                "user",
                vec![serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": tool_call_id,
                    "content": message_text(content),
                    "is_error": is_error
                })],
            ),
        };

        if blocks.is_empty() {
            continue;
        }
        match result.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => result.push(AnthropicMessage {
                role,
                content: blocks,
            }),
        }
    }

    result
}

fn message_text(content: &[Content]) -> String {
    content
        .iter()
        .filter_map(|c| c.as_text())
        .collect::<Vec<_>>()
        .join("\n")
}

fn convert_tools(tools: &[Tool]) -> Vec<AnthropicTool> {
    tools
        .iter()
        .map(|tool| {
            let mut input_schema = if tool.parameters.is_object() {
                tool.parameters.clone()
            } else {
                serde_json::json!({ "properties": {} })
            };
            if let Some(obj) = input_schema.as_object_mut() {
                obj.entry("type").or_insert(serde_json::json!("object"));
            }

            AnthropicTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema,
            }
        })
        .collect()
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "max_tokens" => StopReason::Length,
        "tool_use" => StopReason::ToolUse,
        _ => StopReason::Stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_results_and_notes_merge_into_one_user_turn() {
        let messages = vec![
            Message::user("brief"),
            Message::assistant(vec![
                Content::tool_call("t1", "conduct_research", serde_json::json!({"topic": "a"})),
                Content::tool_call("t2", "conduct_research", serde_json::json!({"topic": "b"})),
            ]),
            Message::tool_result("t1", "conduct_research", "summary a", false),
            Message::tool_result("t2", "conduct_research", "deferred", true),
            Message::user("1 requests deferred; re-issue next iteration"),
        ];
        let converted = convert_messages(&messages);
        let roles: Vec<&str> = converted.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert_eq!(converted[2].content.len(), 3);
        assert_eq!(converted[2].content[1]["is_error"], true);
    }

    #[test]
    fn test_empty_assistant_turns_are_skipped() {
        let messages = vec![Message::user("hi"), Message::assistant_empty()];
        assert_eq!(convert_messages(&messages).len(), 1);
    }

    #[test]
    fn test_forced_tool_choice() {
        let provider = AnthropicProvider::new("key");
        let model = Model::from_id("anthropic:claude-sonnet-4-5").unwrap();
        let context = Context {
            system_prompt: Some("sys".into()),
            messages: vec![Message::user("q")],
            tools: vec![Tool::new("research_brief", "brief", serde_json::json!({}))],
        };
        let options = StreamOptions {
            forced_tool: Some("research_brief".into()),
            max_tokens: Some(1000),
            ..Default::default()
        };
        let request = serde_json::to_value(provider.build_request(&model, &context, &options)).unwrap();
        assert_eq!(request["tool_choice"]["type"], "tool");
        assert_eq!(request["tool_choice"]["name"], "research_brief");
        assert_eq!(request["max_tokens"], 1000);
        assert_eq!(request["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn test_overflow_predicate() {
        let provider = AnthropicProvider::new("key");
        let err = Error::api(
            "invalid_request_error",
            "HTTP 400: prompt is too long: 215000 tokens > 200000 maximum",
        );
        assert!(provider.is_context_overflow(&err));
        assert!(!provider.is_context_overflow(&Error::api("invalid_request_error", "bad tool")));
    }
}
