//! Scripted backend and tools shared by the engine's unit tests

use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicUsize, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sleuth_ai::{Completion, CompletionRequest, Content, Message, ModelBackend, Usage};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ResearchConfig, StageModel},
    gateway::{ModelGateway, RetryConfig},
    tools::{ResearchTool, ToolExecutionError},
};

type Handler = dyn Fn(&CompletionRequest) -> sleuth_ai::Result<Completion> + Send + Sync;

/// Backend that answers every request through a handler and records it
pub struct MockBackend {
    handler: Box<Handler>,
    calls: AtomicU32,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockBackend {
    pub fn new(
        handler: impl Fn(&CompletionRequest) -> sleuth_ai::Result<Completion> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer with `responses` in order, then with an error
    pub fn scripted(responses: Vec<sleuth_ai::Result<Completion>>) -> Self {
        let responses = Mutex::new(responses.into_iter());
        Self::new(move |_| {
            responses
                .lock()
                .next()
                .unwrap_or_else(|| Err(sleuth_ai::Error::UnexpectedResponse("script exhausted".into())))
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    async fn complete(&self, request: &CompletionRequest) -> sleuth_ai::Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        (self.handler)(request)
    }
}

/// Models are named per stage so handlers can route on `req.model`
pub fn test_config() -> ResearchConfig {
    ResearchConfig {
        max_researcher_iterations: 3,
        max_react_tool_calls: 5,
        max_concurrent_research_units: 3,
        max_overflow_retries: 3,
        max_structured_output_retries: 2,
        allow_clarification: false,
        brief_model: StageModel::new("test:brief", None),
        research_model: StageModel::new("test:research", None),
        compression_model: StageModel::new("test:compress", None),
        final_report_model: StageModel::new("test:report", None),
    }
}

pub fn gateway_for(backend: MockBackend, config: &ResearchConfig) -> (Arc<ModelGateway>, Arc<MockBackend>) {
    let backend = Arc::new(backend);
    let gateway = ModelGateway::new(backend.clone(), config).with_retry_config(RetryConfig::disabled());
    (Arc::new(gateway), backend)
}

fn completion(message: Message, structured: Option<serde_json::Value>) -> Completion {
    Completion {
        message,
        structured,
        usage: Usage::default(),
    }
}

pub fn text(text: impl Into<String>) -> Completion {
    completion(Message::assistant(vec![Content::text(text)]), None)
}

/// An assistant turn issuing these tool calls, in order
pub fn calls(calls: &[(&str, serde_json::Value)]) -> Completion {
    let content = calls
        .iter()
        .enumerate()
        .map(|(i, (name, args))| Content::tool_call(format!("call_{}_{}", name, i), *name, args.clone()))
        .collect();
    completion(Message::assistant(content), None)
}

/// A forced tool call carrying structured output
pub fn structured(name: &str, value: serde_json::Value) -> Completion {
    completion(
        Message::assistant(vec![Content::tool_call(format!("call_{}", name), name, value.clone())]),
        Some(value),
    )
}

pub fn overflow() -> sleuth_ai::Error {
    sleuth_ai::Error::ContextOverflow("prompt is too long: 250000 tokens > 200000 maximum".into())
}

/// Text of the first user message: the topic for researcher and
/// compression calls, the brief for supervisor calls
pub fn topic_of(request: &CompletionRequest) -> String {
    request
        .messages
        .iter()
        .find(|m| matches!(m, Message::User { .. }))
        .map(Message::text)
        .unwrap_or_default()
}

/// Search tool that tracks how many executions overlap.
///
/// An optional `delay_ms` argument overrides the default delay.
#[derive(Default)]
pub struct MockSearch {
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockSearch {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResearchTool for MockSearch {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "delay_ms": { "type": "integer" }
            },
            "required": ["query"]
        })
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> Result<String, ToolExecutionError> {
        let query = arguments["query"].as_str().unwrap_or_default().to_string();
        let delay = arguments["delay_ms"]
            .as_u64()
            .map(Duration::from_millis)
            .unwrap_or(self.delay);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(format!("Results for {} [source: https://example.com/{}]", query, query.replace(' ', "-")))
    }
}

/// Tool that always fails
pub struct FailingTool;

#[async_trait]
impl ResearchTool for FailingTool {
    fn name(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    async fn execute(
        &self,
        _arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> Result<String, ToolExecutionError> {
        Err(ToolExecutionError::Failed("upstream returned 502".into()))
    }
}
