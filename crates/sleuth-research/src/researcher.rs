//! Researcher worker: a bounded tool loop on one topic, then compression

use std::sync::Arc;

use futures::future::join_all;
use sleuth_ai::{Content, Message, ToolCall};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    citations::renumber_citations,
    config::ResearchConfig,
    error::{Error, Result},
    events::ResearchEvent,
    gateway::{ModelGateway, ModelRequest},
    prompts,
    tools::{ToolKind, ToolOutput, ToolRegistry, reflection_text},
};

/// State owned by one researcher
#[derive(Debug, Clone)]
pub struct ResearcherState {
    pub topic: String,
    pub messages: Vec<Message>,
    /// Tool batches whose results are still in `messages`
    pub tool_call_count: u32,
    pub compressed_summary: String,
    /// Successful domain tool outputs, uncompressed
    pub raw_notes: Vec<String>,
}

impl ResearcherState {
    pub fn new(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        Self {
            messages: vec![Message::user(topic.clone())],
            topic,
            tool_call_count: 0,
            compressed_summary: String::new(),
            raw_notes: Vec::new(),
        }
    }
}

/// Runs researcher loops; cheap to clone, shared by the supervisor
#[derive(Clone)]
pub struct Researcher {
    gateway: Arc<ModelGateway>,
    registry: Arc<ToolRegistry>,
    config: Arc<ResearchConfig>,
    event_tx: broadcast::Sender<ResearchEvent>,
}

impl Researcher {
    pub fn new(
        gateway: Arc<ModelGateway>,
        registry: Arc<ToolRegistry>,
        config: Arc<ResearchConfig>,
        event_tx: broadcast::Sender<ResearchEvent>,
    ) -> Self {
        Self {
            gateway,
            registry,
            config,
            event_tx,
        }
    }

    /// Research `topic` and return the state with a compressed summary.
    ///
    /// Errors mean no usable summary exists: the backend failed, compression
    /// was degraded, or the token was cancelled.
    pub async fn run(&self, topic: String, cancel: CancellationToken) -> Result<ResearcherState> {
        let _ = self.event_tx.send(ResearchEvent::ResearcherStart {
            topic: topic.clone(),
        });
        tracing::info!(topic = %topic, "researcher started");

        let mut state = ResearcherState::new(topic);
        let result = self.research(&mut state, &cancel).await;

        let _ = self.event_tx.send(ResearchEvent::ResearcherEnd {
            topic: state.topic.clone(),
            tool_call_count: state.tool_call_count,
            incomplete: result.is_err(),
        });
        result.map(|()| state)
    }

    async fn research(&self, state: &mut ResearcherState, cancel: &CancellationToken) -> Result<()> {
        self.act(state, cancel).await?;
        self.compress(state, cancel).await
    }

    /// ACTING / TOOL_EXEC until the budget runs out or the model stops
    async fn act(&self, state: &mut ResearcherState, cancel: &CancellationToken) -> Result<()> {
        let max_tool_calls = self.config.max_react_tool_calls;
        let request = ModelRequest::new(&self.config.research_model)
            .system_prompt(prompts::researcher_system(
                &self.registry.domain_tool_names(),
                max_tool_calls,
            ))
            .tools(self.registry.researcher_tools());

        let mut acting_turns = 0u32;
        loop {
            // Truncation can lower tool_call_count, so acting turns are capped separately
            if state.tool_call_count >= max_tool_calls || acting_turns > max_tool_calls {
                tracing::debug!(topic = %state.topic, tool_call_count = state.tool_call_count, "tool budget reached");
                return Ok(());
            }
            acting_turns += 1;

            let response = self.gateway.invoke(&request, &mut state.messages, cancel).await?;
            state.tool_call_count = state.tool_call_count.min(tool_batches(&state.messages));

            if response.incomplete {
                tracing::warn!(
                    topic = %state.topic,
                    reason = response.reason.as_deref().unwrap_or_default(),
                    "researcher turn degraded, compressing what was gathered"
                );
                return Ok(());
            }

            let calls = response.message.tool_calls();
            state.messages.push(response.message);

            if calls.is_empty()
                || calls
                    .iter()
                    .any(|c| self.registry.classify(&c.name) == ToolKind::ResearchComplete)
            {
                return Ok(());
            }

            let outputs = self.execute_batch(&state.topic, &calls, cancel).await;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            for (call, output) in calls.iter().zip(outputs) {
                if !output.is_error && self.registry.classify(&call.name) == ToolKind::Domain {
                    state.raw_notes.push(output.content.clone());
                }
                state.messages.push(Message::tool_result(
                    &call.id,
                    &call.name,
                    output.content,
                    output.is_error,
                ));
            }
            state.tool_call_count += 1;
            tracing::debug!(topic = %state.topic, turn = acting_turns, calls = calls.len(), "tool batch done");
        }
    }

    /// Run every call of one turn concurrently; outputs come back in call order
    async fn execute_batch(
        &self,
        topic: &str,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Vec<ToolOutput> {
        join_all(calls.iter().map(|call| async move {
            let _ = self.event_tx.send(ResearchEvent::ToolExecutionStart {
                topic: topic.to_string(),
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
            });

            let output = match self.registry.classify(&call.name) {
                ToolKind::Think | ToolKind::Reflect => {
                    tracing::debug!(topic = %topic, "think: {}", reflection_text(call));
                    ToolOutput::text("Reflection recorded.")
                }
                ToolKind::Domain => self.registry.execute(call, cancel.clone()).await,
                ToolKind::ConductResearch | ToolKind::ResearchComplete | ToolKind::Unknown => {
                    ToolOutput::error(format!("Tool not available to researchers: {}", call.name))
                }
            };

            let _ = self.event_tx.send(ResearchEvent::ToolExecutionEnd {
                topic: topic.to_string(),
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                is_error: output.is_error,
            });
            output
        }))
        .await
    }

    /// One compression call over the flattened findings
    async fn compress(&self, state: &mut ResearcherState, cancel: &CancellationToken) -> Result<()> {
        let request = ModelRequest::new(&self.config.compression_model)
            .system_prompt(prompts::compression_system());

        let mut conversation = flatten_for_compression(&state.messages);
        conversation.push(Message::user(prompts::compression_request(&state.topic)));

        let response = self.gateway.invoke(&request, &mut conversation, cancel).await?;
        if response.incomplete {
            return Err(Error::Other(format!(
                "compression failed: {}",
                response.reason.unwrap_or_else(|| "context overflow".to_string())
            )));
        }

        let summary = response.message.text();
        if summary.trim().is_empty() {
            return Err(Error::Other("compression returned an empty summary".to_string()));
        }
        state.compressed_summary = renumber_citations(summary.trim());
        tracing::info!(
            topic = %state.topic,
            tool_call_count = state.tool_call_count,
            summary_len = state.compressed_summary.len(),
            "researcher finished"
        );
        Ok(())
    }
}

/// Assistant messages that issued tool calls
fn tool_batches(messages: &[Message]) -> u32 {
    messages
        .iter()
        .filter(|m| !m.tool_calls().is_empty())
        .count() as u32
}

/// Rewrite a tool-calling conversation as plain user/assistant text.
///
/// The compression call carries no tool definitions, so tool calls and
/// results are spelled out instead. Assistant turns survive as assistant
/// messages, which keeps overflow truncation able to make progress.
fn flatten_for_compression(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|m| match m {
            Message::User { .. } => Message::user(m.text()),
            Message::Assistant { content, .. } => {
                let mut parts: Vec<String> = Vec::new();
                for block in content {
                    match block {
                        Content::Text { text } if !text.trim().is_empty() => parts.push(text.clone()),
                        Content::ToolCall {
                            name, arguments, ..
                        } => parts.push(format!("[called {} with {}]", name, arguments)),
                        _ => {}
                    }
                }
                if parts.is_empty() {
                    parts.push("[no output]".to_string());
                }
                Message::assistant(vec![Content::text(parts.join("\n"))])
            }
            Message::ToolResult {
                tool_name,
                is_error,
                ..
            } => {
                let label = if *is_error { "Error from" } else { "Result from" };
                Message::user(format!("{} {}:\n{}", label, tool_name, m.text()))
            }
        })
        .collect()
}
