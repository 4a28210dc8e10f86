//! Supervisor loop: delegate, reflect, or finish

use std::sync::Arc;

use futures::future::join_all;
use sleuth_ai::{Message, ToolCall};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ResearchConfig,
    events::ResearchEvent,
    gateway::{ModelGateway, ModelRequest},
    prompts,
    researcher::Researcher,
    tools::{ToolKind, ToolOutput, ToolRegistry, reflection_text, research_topic},
};

/// State owned by the supervisor loop
#[derive(Debug, Clone)]
pub struct SupervisorState {
    pub messages: Vec<Message>,
    pub brief: String,
    /// Compressed summaries in delegation order
    pub notes: Vec<String>,
    pub raw_notes: Vec<String>,
    /// Completed delegation batches
    pub iteration_count: u32,
}

impl SupervisorState {
    pub fn new(brief: impl Into<String>) -> Self {
        let brief = brief.into();
        Self {
            messages: vec![Message::user(brief.clone())],
            brief,
            notes: Vec::new(),
            raw_notes: Vec::new(),
            iteration_count: 0,
        }
    }
}

/// How the supervisor loop ended
#[derive(Debug, Clone)]
pub struct SupervisorOutcome {
    pub state: SupervisorState,
    /// Why the loop stopped early; `None` when it reached DONE normally
    pub halted: Option<String>,
}

pub struct Supervisor {
    gateway: Arc<ModelGateway>,
    researcher: Researcher,
    registry: Arc<ToolRegistry>,
    config: Arc<ResearchConfig>,
    event_tx: broadcast::Sender<ResearchEvent>,
}

impl Supervisor {
    pub fn new(
        gateway: Arc<ModelGateway>,
        registry: Arc<ToolRegistry>,
        config: Arc<ResearchConfig>,
        event_tx: broadcast::Sender<ResearchEvent>,
    ) -> Self {
        let researcher = Researcher::new(
            gateway.clone(),
            registry.clone(),
            config.clone(),
            event_tx.clone(),
        );
        Self {
            gateway,
            researcher,
            registry,
            config,
            event_tx,
        }
    }

    /// Run the loop on `brief` until DONE, a forced stop, or a halt.
    ///
    /// Never fails: backend errors and cancellation end the loop with
    /// `halted` set and keep every note gathered so far.
    pub async fn run(&self, brief: &str, cancel: &CancellationToken) -> SupervisorOutcome {
        let max_iterations = self.config.max_researcher_iterations;
        let max_concurrent = self.config.max_concurrent_research_units;
        let request = ModelRequest::new(&self.config.research_model)
            .system_prompt(prompts::supervisor_system(max_concurrent, max_iterations))
            .tools(self.registry.supervisor_tools());

        let mut state = SupervisorState::new(brief);
        let mut turn = 0u32;

        loop {
            turn += 1;
            let _ = self.event_tx.send(ResearchEvent::SupervisorTurn {
                turn,
                iteration: state.iteration_count,
            });

            let response = match self.gateway.invoke(&request, &mut state.messages, cancel).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(turn, "supervisor halted: {}", e);
                    return halt(state, e.to_string());
                }
            };
            if response.incomplete {
                let reason = response
                    .reason
                    .unwrap_or_else(|| "supervisor context overflow".to_string());
                tracing::warn!(turn, "supervisor halted: {}", reason);
                return halt(state, reason);
            }

            let calls = response.message.tool_calls();
            state.messages.push(response.message);

            // Reflect-only turns leave iteration_count alone, so turns are capped too
            if state.iteration_count >= max_iterations || turn > max_iterations {
                tracing::info!(turn, iteration = state.iteration_count, "research budget exhausted");
                self.answer_all(&mut state, &calls, |_| {
                    ToolOutput::text("Research budget exhausted; no further delegations will run.")
                });
                return done(state);
            }

            let kinds: Vec<ToolKind> = calls.iter().map(|c| self.registry.classify(&c.name)).collect();
            let delegating = kinds.contains(&ToolKind::ConductResearch);

            if calls.is_empty() {
                tracing::info!(turn, "supervisor finished without tool calls");
                return done(state);
            }

            if !delegating && kinds.contains(&ToolKind::ResearchComplete) {
                tracing::info!(turn, iteration = state.iteration_count, "research complete");
                self.answer_all(&mut state, &calls, |kind| match kind {
                    ToolKind::ResearchComplete => ToolOutput::text("Research marked complete."),
                    _ => ToolOutput::text("Acknowledged."),
                });
                return done(state);
            }

            if !delegating {
                for call in &calls {
                    if matches!(self.registry.classify(&call.name), ToolKind::Reflect | ToolKind::Think) {
                        let _ = self.event_tx.send(ResearchEvent::Reflection {
                            content: reflection_text(call),
                        });
                    }
                }
                self.answer_all(&mut state, &calls, |kind| match kind {
                    ToolKind::Reflect => ToolOutput::text("Reflection recorded."),
                    ToolKind::Think => ToolOutput::text("Acknowledged."),
                    _ => ToolOutput::error("Tool not available to the supervisor."),
                });
                continue;
            }

            self.delegate(&mut state, &calls, &kinds, cancel).await;
            if cancel.is_cancelled() {
                return halt(state, "cancelled".to_string());
            }
        }
    }

    /// DELEGATING: fan out up to the concurrency cap, defer the rest
    async fn delegate(
        &self,
        state: &mut SupervisorState,
        calls: &[ToolCall],
        kinds: &[ToolKind],
        cancel: &CancellationToken,
    ) {
        let max_concurrent = self.config.max_concurrent_research_units;
        let mut outputs: Vec<Option<ToolOutput>> = vec![None; calls.len()];
        let mut accepted: Vec<(usize, String)> = Vec::new();
        let mut deferred = 0usize;

        for (idx, (call, kind)) in calls.iter().zip(kinds).enumerate() {
            outputs[idx] = match kind {
                ToolKind::ConductResearch => match research_topic(call) {
                    Some(topic) if accepted.len() < max_concurrent => {
                        accepted.push((idx, topic));
                        None
                    }
                    Some(_) => {
                        deferred += 1;
                        Some(ToolOutput::error(format!(
                            "Deferred: at most {} research units run per iteration. Re-issue this request next iteration.",
                            max_concurrent
                        )))
                    }
                    None => Some(ToolOutput::error("research_topic is required.")),
                },
                ToolKind::Reflect => Some(ToolOutput::text("Reflection recorded.")),
                ToolKind::Think => Some(ToolOutput::text("Acknowledged.")),
                ToolKind::ResearchComplete => Some(ToolOutput::text(
                    "Ignored: research continues while delegations from this turn are pending.",
                )),
                ToolKind::Domain | ToolKind::Unknown => {
                    Some(ToolOutput::error("Tool not available to the supervisor."))
                }
            };
        }

        let topics: Vec<String> = accepted.iter().map(|(_, topic)| topic.clone()).collect();
        let delegated = !topics.is_empty();
        if delegated {
            tracing::info!(
                iteration = state.iteration_count + 1,
                accepted = topics.len(),
                deferred,
                "delegating research"
            );
            if deferred > 0 {
                tracing::warn!(deferred, max_concurrent, "delegations over the concurrency cap deferred");
            }
            let _ = self.event_tx.send(ResearchEvent::DelegationBatch {
                topics: topics.clone(),
                deferred,
            });
        } else {
            tracing::warn!("no delegation carried a research_topic; iteration not counted");
        }

        let results = join_all(
            topics
                .into_iter()
                .map(|topic| self.researcher.run(topic, cancel.child_token())),
        )
        .await;

        // Fold in delegation order, whatever order the workers finished in
        for ((idx, topic), result) in accepted.into_iter().zip(results) {
            outputs[idx] = Some(match result {
                Ok(worker) => {
                    state.notes.push(worker.compressed_summary.clone());
                    if !worker.raw_notes.is_empty() {
                        state.raw_notes.push(worker.raw_notes.join("\n"));
                    }
                    ToolOutput::text(worker.compressed_summary)
                }
                Err(e) => {
                    tracing::warn!(topic = %topic, "researcher failed: {}", e);
                    let note = format!("Research incomplete for topic {}: {}", topic, e);
                    state.notes.push(note.clone());
                    ToolOutput::error(note)
                }
            });
        }

        for (call, output) in calls.iter().zip(outputs) {
            let output = output.unwrap_or_else(|| ToolOutput::error("No result."));
            state.messages.push(Message::tool_result(
                &call.id,
                &call.name,
                output.content,
                output.is_error,
            ));
        }
        if deferred > 0 {
            state.messages.push(Message::user(format!(
                "{} requests deferred; re-issue next iteration",
                deferred
            )));
        }
        // A turn whose delegations were all malformed is handled like a reflection
        if delegated {
            state.iteration_count += 1;
        }
    }

    /// Give every call of the turn exactly one tool result
    fn answer_all(
        &self,
        state: &mut SupervisorState,
        calls: &[ToolCall],
        output_for: impl Fn(ToolKind) -> ToolOutput,
    ) {
        for call in calls {
            let output = output_for(self.registry.classify(&call.name));
            state.messages.push(Message::tool_result(
                &call.id,
                &call.name,
                output.content,
                output.is_error,
            ));
        }
    }
}

fn done(state: SupervisorState) -> SupervisorOutcome {
    SupervisorOutcome {
        state,
        halted: None,
    }
}

fn halt(state: SupervisorState, reason: String) -> SupervisorOutcome {
    SupervisorOutcome {
        state,
        halted: Some(reason),
    }
}
