//! Research session: clarify, brief, supervise, report

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sleuth_ai::{Message, ModelBackend, OutputSchema};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    citations::renumber_citations,
    config::ResearchConfig,
    error::{Error, Result},
    events::ResearchEvent,
    gateway::{ModelGateway, ModelRequest, RetryConfig},
    prompts,
    supervisor::Supervisor,
    tools::ToolRegistry,
};

pub const CLARIFY_SCHEMA: &str = "clarify_with_user";
pub const BRIEF_SCHEMA: &str = "research_brief";

/// Marker that opens a report assembled from raw notes
pub const INCOMPLETE_MARKER: &str = "INCOMPLETE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Complete,
    NeedsClarification,
    Incomplete,
}

/// What a session hands back; never an error
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    pub report: Option<String>,
    pub clarifying_question: Option<String>,
    pub reason: Option<String>,
    pub brief: Option<String>,
    pub notes: Vec<String>,
}

impl SessionOutcome {
    fn incomplete(reason: impl Into<String>, brief: Option<String>, notes: Vec<String>) -> Self {
        let report = (!notes.is_empty()).then(|| fallback_report(&notes));
        Self {
            status: SessionStatus::Incomplete,
            report,
            clarifying_question: None,
            reason: Some(reason.into()),
            brief,
            notes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Clarification {
    need_clarification: bool,
    #[serde(default)]
    question: String,
    #[serde(default)]
    verification: String,
}

#[derive(Debug, Deserialize)]
struct Brief {
    research_brief: String,
}

/// Runs research sessions against one backend and tool set
pub struct ResearchSession {
    config: Arc<ResearchConfig>,
    backend: Arc<dyn ModelBackend>,
    gateway: Arc<ModelGateway>,
    registry: Arc<ToolRegistry>,
    event_tx: broadcast::Sender<ResearchEvent>,
}

impl ResearchSession {
    pub fn new(
        config: ResearchConfig,
        backend: Arc<dyn ModelBackend>,
        registry: ToolRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(256);
        let gateway = ModelGateway::new(backend.clone(), &config).with_events(event_tx.clone());
        Ok(Self {
            config: Arc::new(config),
            backend,
            gateway: Arc::new(gateway),
            registry: Arc::new(registry),
            event_tx,
        })
    }

    /// Set retry configuration for transient backend failures
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        let gateway = ModelGateway::new(self.backend.clone(), &self.config)
            .with_retry_config(retry_config)
            .with_events(self.event_tx.clone());
        self.gateway = Arc::new(gateway);
        self
    }

    /// Subscribe to progress events
    pub fn subscribe(&self) -> broadcast::Receiver<ResearchEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &ResearchConfig {
        &self.config
    }

    /// Run one session over the user's conversation so far
    pub async fn run_session(
        &self,
        user_messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> SessionOutcome {
        let session_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(session_id = %session_id, "research session started");
        self.emit(ResearchEvent::SessionStart {
            session_id: session_id.clone(),
        });

        let outcome = self.run_stages(&user_messages, &cancel).await;

        tracing::info!(
            session_id = %session_id,
            status = ?outcome.status,
            notes = outcome.notes.len(),
            "research session finished"
        );
        self.emit(ResearchEvent::SessionEnd {
            status: outcome.status,
        });
        outcome
    }

    async fn run_stages(&self, user_messages: &[Message], cancel: &CancellationToken) -> SessionOutcome {
        if user_messages.is_empty() {
            return SessionOutcome::incomplete("no user messages to research", None, Vec::new());
        }

        if self.config.allow_clarification {
            match self.clarify(user_messages, cancel).await {
                Ok(Some(question)) => {
                    tracing::info!("clarification needed");
                    self.emit(ResearchEvent::ClarificationRequested {
                        question: question.clone(),
                    });
                    return SessionOutcome {
                        status: SessionStatus::NeedsClarification,
                        report: None,
                        clarifying_question: Some(question),
                        reason: None,
                        brief: None,
                        notes: Vec::new(),
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    return SessionOutcome::incomplete(stage_failure("clarification", &e), None, Vec::new());
                }
            }
        }

        let brief = match self.write_brief(user_messages, cancel).await {
            Ok(brief) => brief,
            Err(e) => {
                return SessionOutcome::incomplete(stage_failure("brief generation", &e), None, Vec::new());
            }
        };
        tracing::info!(brief_len = brief.len(), "research brief ready");
        self.emit(ResearchEvent::BriefReady {
            brief: brief.clone(),
        });

        let supervisor = Supervisor::new(
            self.gateway.clone(),
            self.registry.clone(),
            self.config.clone(),
            self.event_tx.clone(),
        );
        let outcome = supervisor.run(&brief, cancel).await;
        let notes = outcome.state.notes;

        if cancel.is_cancelled() {
            return SessionOutcome::incomplete("cancelled", Some(brief), notes);
        }

        self.emit(ResearchEvent::FinalReportStart);
        match self.write_report(&brief, user_messages, &notes, cancel).await {
            Ok((report, omitted)) => {
                let mut reasons = Vec::new();
                if let Some(halted) = outcome.halted {
                    reasons.push(format!("research halted early: {}", halted));
                }
                if omitted > 0 {
                    reasons.push(format!(
                        "final report omitted {} of {} research notes to fit the context window",
                        omitted,
                        notes.len()
                    ));
                }
                let (status, reason) = if reasons.is_empty() {
                    (SessionStatus::Complete, None)
                } else {
                    (SessionStatus::Incomplete, Some(reasons.join("; ")))
                };
                SessionOutcome {
                    status,
                    report: Some(report),
                    clarifying_question: None,
                    reason,
                    brief: Some(brief),
                    notes,
                }
            }
            Err(report_failure) => {
                tracing::warn!("final report failed: {}", report_failure);
                let reason = match outcome.halted {
                    Some(halted) => format!(
                        "research halted early: {}; final report failed: {}",
                        halted, report_failure
                    ),
                    None => format!("final report failed: {}", report_failure),
                };
                let mut incomplete = SessionOutcome::incomplete(reason, Some(brief), notes);
                if incomplete.report.is_none() {
                    incomplete.report = Some(fallback_report(&[]));
                }
                incomplete
            }
        }
    }

    /// Returns the question to ask, or `None` to proceed
    async fn clarify(&self, user_messages: &[Message], cancel: &CancellationToken) -> Result<Option<String>> {
        let request = ModelRequest::new(&self.config.brief_model)
            .system_prompt(prompts::clarification_system())
            .output_schema(clarification_schema());
        let mut conversation = user_messages.to_vec();

        let response = self.gateway.invoke(&request, &mut conversation, cancel).await?;
        if response.incomplete {
            return Err(Error::Other(
                response.reason.unwrap_or_else(|| "context overflow".to_string()),
            ));
        }
        let clarification: Clarification = parse_structured(response.structured, CLARIFY_SCHEMA)?;

        if clarification.need_clarification && !clarification.question.trim().is_empty() {
            return Ok(Some(clarification.question));
        }
        if !clarification.verification.trim().is_empty() {
            self.emit(ResearchEvent::ClarificationVerified {
                message: clarification.verification,
            });
        }
        Ok(None)
    }

    async fn write_brief(&self, user_messages: &[Message], cancel: &CancellationToken) -> Result<String> {
        let request = ModelRequest::new(&self.config.brief_model)
            .system_prompt(prompts::brief_system())
            .output_schema(brief_schema());
        let mut conversation = user_messages.to_vec();

        let response = self.gateway.invoke(&request, &mut conversation, cancel).await?;
        if response.incomplete {
            return Err(Error::Other(
                response.reason.unwrap_or_else(|| "context overflow".to_string()),
            ));
        }
        let brief: Brief = parse_structured(response.structured, BRIEF_SCHEMA)?;
        Ok(brief.research_brief.trim().to_string())
    }

    /// Synthesize the report, dropping trailing notes when they do not fit.
    ///
    /// Returns the report and how many notes were left out of it.
    async fn write_report(
        &self,
        brief: &str,
        user_messages: &[Message],
        notes: &[String],
        cancel: &CancellationToken,
    ) -> std::result::Result<(String, usize), String> {
        let request = ModelRequest::new(&self.config.final_report_model);
        let mut kept = notes.len();

        for attempt in 0..=self.config.max_overflow_retries {
            let findings = findings_text(notes, kept);
            let mut conversation = vec![Message::user(prompts::final_report(brief, user_messages, &findings))];
            let response = self
                .gateway
                .invoke(&request, &mut conversation, cancel)
                .await
                .map_err(|e| e.to_string())?;

            if !response.incomplete {
                let report = response.message.text();
                if report.trim().is_empty() {
                    return Err("the model returned an empty report".to_string());
                }
                return Ok((renumber_citations(report.trim()), notes.len() - kept));
            }

            if kept <= 1 {
                break;
            }
            kept = (kept * 3 / 4).clamp(1, kept - 1);
            tracing::warn!(attempt = attempt + 1, kept, "final report overflowed, dropping trailing notes");
        }
        Err("findings did not fit the context window".to_string())
    }

    fn emit(&self, event: ResearchEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// The first `kept` notes, whole, with a marker for the rest
fn findings_text(notes: &[String], kept: usize) -> String {
    let mut findings = notes[..kept].join("\n\n");
    let omitted = notes.len() - kept;
    if omitted > 0 {
        findings.push_str(&format!(
            "\n\n[{} further notes omitted to fit the context window]",
            omitted
        ));
    }
    findings
}

fn stage_failure(stage: &str, error: &Error) -> String {
    match error {
        Error::Cancelled => "cancelled".to_string(),
        e => format!("{} failed: {}", stage, e),
    }
}

fn parse_structured<T: serde::de::DeserializeOwned>(value: Option<serde_json::Value>, schema: &str) -> Result<T> {
    let value = value.ok_or_else(|| Error::StructuredOutputInvalid {
        schema: schema.to_string(),
        attempts: 1,
        reason: "response carried no structured output".to_string(),
    })?;
    serde_json::from_value(value).map_err(|e| Error::StructuredOutputInvalid {
        schema: schema.to_string(),
        attempts: 1,
        reason: e.to_string(),
    })
}

/// Report used when synthesis fails: every note, verbatim
pub fn fallback_report(notes: &[String]) -> String {
    let body = if notes.is_empty() {
        "No research notes were gathered.".to_string()
    } else {
        notes.join("\n\n---\n\n")
    };
    format!(
        "**{}**: the final report could not be synthesized. Research notes follow.\n\n{}",
        INCOMPLETE_MARKER, body
    )
}

pub fn clarification_schema() -> OutputSchema {
    OutputSchema::new(
        CLARIFY_SCHEMA,
        "Decide whether to ask the user a clarifying question.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "need_clarification": { "type": "boolean" },
                "question": { "type": "string" },
                "verification": { "type": "string" }
            },
            "required": ["need_clarification", "question", "verification"]
        }),
    )
}

pub fn brief_schema() -> OutputSchema {
    OutputSchema::new(
        BRIEF_SCHEMA,
        "The research brief that will guide the research.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "research_brief": { "type": "string", "minLength": 1 }
            },
            "required": ["research_brief"]
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBackend, MockSearch, calls, overflow, structured, test_config, text, topic_of};
    use crate::tools::{CONDUCT_RESEARCH, RESEARCH_COMPLETE};

    fn session(backend: MockBackend, config: ResearchConfig) -> (ResearchSession, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let registry = ToolRegistry::new().with_tool(Arc::new(MockSearch::default())).unwrap();
        let session = ResearchSession::new(config, backend.clone(), registry)
            .unwrap()
            .with_retry_config(RetryConfig::disabled());
        (session, backend)
    }

    fn schema_of(req: &sleuth_ai::CompletionRequest) -> Option<&str> {
        req.output_schema.as_ref().map(|s| s.name.as_str())
    }

    /// Brief, two-topic delegation, one search per researcher, then the report
    fn happy_path(req: &sleuth_ai::CompletionRequest) -> sleuth_ai::Result<sleuth_ai::Completion> {
        match (schema_of(req), req.model.as_str()) {
            (Some(CLARIFY_SCHEMA), _) => Ok(structured(
                CLARIFY_SCHEMA,
                serde_json::json!({
                    "need_clarification": false,
                    "question": "",
                    "verification": "I will compare vendor A and vendor B."
                }),
            )),
            (Some(BRIEF_SCHEMA), _) => Ok(structured(
                BRIEF_SCHEMA,
                serde_json::json!({"research_brief": "Compare vendor A vs vendor B"}),
            )),
            (_, "test:report") => Ok(text(
                "## Vendor A\nFast [4].\n## Vendor B\nCheap [9].\n### Sources\n[4] A: https://a\n[9] B: https://b",
            )),
            (_, "test:compress") => Ok(text(format!("Summary of {} [2]\n### Sources\n[2] S: https://s", topic_of(req)))),
            _ if req.tools.iter().any(|t| t.name == CONDUCT_RESEARCH) => {
                match req.messages.iter().filter(|m| m.is_assistant()).count() {
                    0 => Ok(calls(&[
                        (CONDUCT_RESEARCH, serde_json::json!({"research_topic": "vendor A"})),
                        (CONDUCT_RESEARCH, serde_json::json!({"research_topic": "vendor B"})),
                    ])),
                    _ => Ok(calls(&[(RESEARCH_COMPLETE, serde_json::json!({}))])),
                }
            }
            _ => match req.messages.iter().filter(|m| m.is_assistant()).count() {
                0 => Ok(calls(&[("web_search", serde_json::json!({"query": topic_of(req)}))])),
                _ => Ok(calls(&[(RESEARCH_COMPLETE, serde_json::json!({}))])),
            },
        }
    }

    #[tokio::test]
    async fn test_scenario_compare_two_vendors() {
        let (session, backend) = session(MockBackend::new(happy_path), test_config());

        let outcome = session
            .run_session(vec![Message::user("Compare vendor A vs vendor B")], CancellationToken::new())
            .await;

        assert_eq!(outcome.status, SessionStatus::Complete);
        assert_eq!(outcome.brief.as_deref(), Some("Compare vendor A vs vendor B"));
        assert_eq!(outcome.notes.len(), 2);
        assert_eq!(
            outcome.report.as_deref(),
            Some("## Vendor A\nFast [1].\n## Vendor B\nCheap [2].\n### Sources\n[1] A: https://a\n[2] B: https://b")
        );
        let researcher_searches = backend
            .requests()
            .iter()
            .filter(|r| r.model == "test:research" && r.tools.iter().any(|t| t.name == "web_search"))
            .count();
        assert!(researcher_searches <= 2 * 3 + 2);
        // the final report prompt carries both summaries
        let report_req = backend.requests().into_iter().find(|r| r.model == "test:report").unwrap();
        let prompt = report_req.messages[0].text();
        assert!(prompt.contains("Summary of vendor A") && prompt.contains("Summary of vendor B"));
    }

    #[tokio::test]
    async fn test_clarification_halts_before_research() {
        let backend = MockBackend::new(|req| {
            assert_eq!(schema_of(req), Some(CLARIFY_SCHEMA));
            Ok(structured(
                CLARIFY_SCHEMA,
                serde_json::json!({
                    "need_clarification": true,
                    "question": "Which vendors do you mean by A and B?",
                    "verification": ""
                }),
            ))
        });
        let config = ResearchConfig {
            allow_clarification: true,
            ..test_config()
        };
        let (session, backend) = session(backend, config);

        let outcome = session
            .run_session(vec![Message::user("Compare A and B")], CancellationToken::new())
            .await;

        assert_eq!(outcome.status, SessionStatus::NeedsClarification);
        assert_eq!(
            outcome.clarifying_question.as_deref(),
            Some("Which vendors do you mean by A and B?")
        );
        assert!(outcome.brief.is_none());
        assert!(outcome.notes.is_empty());
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_verification_is_announced() {
        let config = ResearchConfig {
            allow_clarification: true,
            ..test_config()
        };
        let (session, _) = session(MockBackend::new(happy_path), config);
        let mut events = session.subscribe();

        let outcome = session
            .run_session(vec![Message::user("Compare vendor A vs vendor B")], CancellationToken::new())
            .await;
        assert_eq!(outcome.status, SessionStatus::Complete);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(ResearchEvent::SessionStart { .. })));
        assert!(matches!(
            seen.last(),
            Some(ResearchEvent::SessionEnd {
                status: SessionStatus::Complete
            })
        ));
        assert!(seen.iter().any(|e| matches!(
            e,
            ResearchEvent::ClarificationVerified { message } if message.contains("vendor A")
        )));
    }

    #[tokio::test]
    async fn test_scenario_single_iteration_still_complete() {
        let backend = MockBackend::new(|req| {
            if req.tools.iter().any(|t| t.name == CONDUCT_RESEARCH) {
                return Ok(calls(&[(
                    CONDUCT_RESEARCH,
                    serde_json::json!({"research_topic": "again"}),
                )]));
            }
            happy_path(req)
        });
        let config = ResearchConfig {
            max_researcher_iterations: 1,
            ..test_config()
        };
        let (session, _) = session(backend, config);

        let outcome = session
            .run_session(vec![Message::user("q")], CancellationToken::new())
            .await;

        assert_eq!(outcome.status, SessionStatus::Complete);
        assert_eq!(outcome.notes.len(), 1);
        assert!(outcome.report.is_some());
    }

    #[tokio::test]
    async fn test_report_overflow_falls_back_to_notes() {
        let backend = MockBackend::new(|req| {
            if req.model == "test:report" {
                return Err(overflow());
            }
            happy_path(req)
        });
        let (session, backend) = session(backend, test_config());

        let outcome = session
            .run_session(vec![Message::user("q")], CancellationToken::new())
            .await;

        assert_eq!(outcome.status, SessionStatus::Incomplete);
        assert!(outcome.reason.unwrap().contains("final report failed"));
        let report = outcome.report.unwrap();
        assert!(report.contains(INCOMPLETE_MARKER));
        assert!(report.contains("Summary of vendor A") && report.contains("Summary of vendor B"));
        // two notes shrink to one, then there is nothing left to drop
        let report_calls = backend.requests().iter().filter(|r| r.model == "test:report").count();
        assert_eq!(report_calls, 2);
    }

    #[tokio::test]
    async fn test_report_overflow_drops_whole_notes() {
        let backend = MockBackend::new(|req| {
            if req.model == "test:report" && req.messages[0].text().contains("Summary of vendor B") {
                return Err(overflow());
            }
            happy_path(req)
        });
        let (session, backend) = session(backend, test_config());

        let outcome = session
            .run_session(vec![Message::user("q")], CancellationToken::new())
            .await;

        assert_eq!(outcome.status, SessionStatus::Incomplete);
        assert_eq!(
            outcome.reason.as_deref(),
            Some("final report omitted 1 of 2 research notes to fit the context window")
        );
        assert!(outcome.report.unwrap().starts_with("## Vendor A"));
        assert_eq!(outcome.notes.len(), 2);

        let prompts: Vec<String> = backend
            .requests()
            .iter()
            .filter(|r| r.model == "test:report")
            .map(|r| r.messages[0].text())
            .collect();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("Summary of vendor A [1]\n### Sources\n[1] S: https://s"));
        assert!(prompts[1].contains("[1 further notes omitted to fit the context window]"));
    }

    #[test]
    fn test_findings_text_keeps_notes_whole() {
        let notes = vec!["first note".to_string(), "second note".to_string(), "third".to_string()];
        assert_eq!(findings_text(&notes, 3), "first note\n\nsecond note\n\nthird");
        assert_eq!(
            findings_text(&notes, 1),
            "first note\n\n[2 further notes omitted to fit the context window]"
        );
    }

    #[tokio::test]
    async fn test_clarification_overflow_names_the_cause() {
        let backend = MockBackend::new(|req| {
            if schema_of(req) == Some(CLARIFY_SCHEMA) {
                return Err(overflow());
            }
            happy_path(req)
        });
        let config = ResearchConfig {
            allow_clarification: true,
            ..test_config()
        };
        let (session, backend) = session(backend, config);

        let outcome = session
            .run_session(vec![Message::user("q")], CancellationToken::new())
            .await;

        assert_eq!(outcome.status, SessionStatus::Incomplete);
        let reason = outcome.reason.unwrap();
        assert!(reason.starts_with("clarification failed: context overflow"));
        assert!(!reason.contains("structured output"));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_brief_is_incomplete_not_error() {
        let backend = MockBackend::new(|req| {
            if schema_of(req) == Some(BRIEF_SCHEMA) {
                return Ok(text("here is a brief, but not structured"));
            }
            happy_path(req)
        });
        let (session, backend) = session(backend, test_config());

        let outcome = session
            .run_session(vec![Message::user("q")], CancellationToken::new())
            .await;

        assert_eq!(outcome.status, SessionStatus::Incomplete);
        assert!(outcome.reason.unwrap().starts_with("brief generation failed"));
        assert!(outcome.report.is_none());
        assert_eq!(backend.calls(), test_config().max_structured_output_retries + 1);
    }

    #[tokio::test]
    async fn test_supervisor_halt_still_reports() {
        let backend = MockBackend::new(|req| {
            if req.tools.iter().any(|t| t.name == CONDUCT_RESEARCH)
                && req.messages.iter().any(|m| m.is_assistant())
            {
                return Err(sleuth_ai::Error::api("invalid_request_error", "malformed tool result"));
            }
            happy_path(req)
        });
        let (session, _) = session(backend, test_config());

        let outcome = session
            .run_session(vec![Message::user("q")], CancellationToken::new())
            .await;

        assert_eq!(outcome.status, SessionStatus::Incomplete);
        assert!(outcome.reason.unwrap().starts_with("research halted early"));
        assert_eq!(outcome.notes.len(), 2);
        assert!(outcome.report.unwrap().contains("Vendor A"));
    }

    #[tokio::test]
    async fn test_cancelled_session() {
        let (session, backend) = session(MockBackend::new(happy_path), test_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = session.run_session(vec![Message::user("q")], cancel).await;

        assert_eq!(outcome.status, SessionStatus::Incomplete);
        assert_eq!(outcome.reason.as_deref(), Some("cancelled"));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_conversation() {
        let (session, _) = session(MockBackend::new(happy_path), test_config());
        let outcome = session.run_session(Vec::new(), CancellationToken::new()).await;
        assert_eq!(outcome.status, SessionStatus::Incomplete);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ResearchConfig {
            max_concurrent_research_units: 0,
            ..test_config()
        };
        let result = ResearchSession::new(
            config,
            Arc::new(MockBackend::new(happy_path)),
            ToolRegistry::new(),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_fallback_report_lists_notes() {
        let report = fallback_report(&["one".to_string(), "two".to_string()]);
        assert!(report.starts_with("**INCOMPLETE**"));
        assert!(report.ends_with("one\n\n---\n\ntwo"));
    }
}
