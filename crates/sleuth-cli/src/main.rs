//! sleuth - multi-agent deep research from the command line

mod config;
mod tools;

use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use sleuth_ai::{Content, Message};
use sleuth_research::{ResearchEvent, ResearchSession, SessionOutcome, SessionStatus};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// sleuth - research a question and write a cited report
#[derive(Parser, Debug)]
#[command(name = "sleuth")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The research question
    question: Vec<String>,

    /// Config file (default: ~/.config/sleuth/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the report to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Never stop to ask a clarifying question
    #[arg(long)]
    no_clarify: bool,

    /// Override the research model for the supervisor and researchers
    #[arg(short, long)]
    model: Option<String>,

    /// Override the number of researchers running at once
    #[arg(long)]
    concurrency: Option<usize>,

    /// Print progress events as JSON lines on stderr
    #[arg(long)]
    json_events: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; --verbose turns on debug for our crates
    let default_filter = if args.verbose {
        "sleuth=debug,sleuth_ai=debug,sleuth_research=debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = args.config.clone().unwrap_or_else(Config::config_path);

    if args.init_config {
        match Config::init(&config_path) {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let question = args.question.join(" ");
    if question.trim().is_empty() {
        eprintln!("Error: no research question given");
        eprintln!("Usage: sleuth \"What changed in the Rust 2024 edition?\"");
        std::process::exit(2);
    }

    let mut config = Config::load(&config_path)?;
    if args.no_clarify {
        config.research.allow_clarification = false;
    }
    if let Some(model) = &args.model {
        config.research.research_model.model = model.clone();
    }
    if let Some(concurrency) = args.concurrency {
        config.research.max_concurrent_research_units = concurrency;
    }

    let registry = tools::build_registry(&config)?;
    let session = ResearchSession::new(config.research.clone(), Arc::new(config.backend()), registry)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n[Interrupted, finishing up...]");
                cancel.cancel();
            }
        });
    }

    let mut messages = vec![Message::user(question)];
    let outcome = loop {
        let printer = spawn_event_printer(&session, args.json_events);
        let outcome = session.run_session(messages.clone(), cancel.clone()).await;
        printer.await.ok();

        if outcome.status != SessionStatus::NeedsClarification {
            break outcome;
        }
        let question = outcome.clarifying_question.clone().unwrap_or_default();
        match ask(&question)? {
            Some(answer) => {
                messages.push(Message::assistant(vec![Content::text(question)]));
                messages.push(Message::user(answer));
            }
            None => break outcome,
        }
    };

    std::process::exit(report(&outcome, args.output.as_deref())?);
}

/// Print progress to stderr until the session ends
fn spawn_event_printer(session: &ResearchSession, json: bool) -> tokio::task::JoinHandle<()> {
    let mut receiver = session.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match receiver.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event printer lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            if json {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{}", line);
                }
            } else if let Some(line) = describe(&event) {
                eprintln!("{}", line);
            }

            if event.is_terminal() {
                break;
            }
        }
    })
}

fn describe(event: &ResearchEvent) -> Option<String> {
    Some(match event {
        ResearchEvent::SessionStart { session_id } => format!("[Session {}]", session_id),
        ResearchEvent::ClarificationVerified { message } => format!("[{}]", message),
        ResearchEvent::BriefReady { brief } => format!("[Research brief]\n{}\n", brief),
        ResearchEvent::SupervisorTurn { turn, iteration } => {
            format!("[Supervisor turn {} (delegations so far: {})]", turn, iteration)
        }
        ResearchEvent::DelegationBatch { topics, deferred } => {
            let mut line = format!("[Delegating {} topic(s)]", topics.len());
            if *deferred > 0 {
                line.push_str(&format!(" [{} deferred]", deferred));
            }
            line
        }
        ResearchEvent::Reflection { content } => format!("[Reflection: {}]", truncate(content, 160)),
        ResearchEvent::ResearcherStart { topic } => format!("  > {}", truncate(topic, 100)),
        ResearchEvent::ToolExecutionStart { tool_name, arguments, .. } => {
            format!("    [Running {} {}]", tool_name, truncate(&arguments.to_string(), 100))
        }
        ResearchEvent::ToolExecutionEnd {
            tool_name, is_error: true, ..
        } => format!("    [{} failed]", tool_name),
        ResearchEvent::ResearcherEnd {
            topic,
            tool_call_count,
            incomplete,
        } => format!(
            "  < {} ({} tool rounds{})",
            truncate(topic, 100),
            tool_call_count,
            if *incomplete { ", incomplete" } else { "" }
        ),
        ResearchEvent::ContextTruncated { model, removed, attempt } => format!(
            "[Context window exceeded on {}: dropped {} messages (attempt {})]",
            model, removed, attempt
        ),
        ResearchEvent::FinalReportStart => "[Writing final report]".to_string(),
        ResearchEvent::ClarificationRequested { .. }
        | ResearchEvent::ToolExecutionEnd { .. }
        | ResearchEvent::SessionEnd { .. } => return None,
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    let first_line = s.lines().next().unwrap_or_default();
    if first_line.chars().count() <= max_chars && first_line.len() == s.len() {
        return s.to_string();
    }
    let cut: String = first_line.chars().take(max_chars).collect();
    format!("{}...", cut)
}

/// Ask the clarifying question on an interactive terminal; `None` when there is no one to answer
fn ask(question: &str) -> anyhow::Result<Option<String>> {
    if !std::io::stdin().is_terminal() {
        return Ok(None);
    }
    eprintln!("\n{}\n", question);
    eprint!("answer> ");
    std::io::stderr().flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    let answer = answer.trim();
    Ok((!answer.is_empty()).then(|| answer.to_string()))
}

/// Emit the outcome and pick the exit code
fn report(outcome: &SessionOutcome, output: Option<&std::path::Path>) -> anyhow::Result<i32> {
    if let Some(reason) = &outcome.reason {
        eprintln!("\n[Incomplete: {}]", reason);
    }

    match outcome.status {
        SessionStatus::NeedsClarification => {
            if let Some(question) = &outcome.clarifying_question {
                println!("{}", question);
            }
            return Ok(3);
        }
        SessionStatus::Complete | SessionStatus::Incomplete => {}
    }

    if let Some(report) = &outcome.report {
        match output {
            Some(path) => {
                std::fs::write(path, report)?;
                eprintln!("[Report written to {}]", path.display());
            }
            None => println!("{}", report),
        }
    }

    Ok(match outcome.status {
        SessionStatus::Complete => 0,
        _ => 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: SessionStatus) -> SessionOutcome {
        SessionOutcome {
            status,
            report: None,
            clarifying_question: None,
            reason: None,
            brief: None,
            notes: Vec::new(),
        }
    }

    #[test]
    fn test_args_join_question() {
        let args = Args::parse_from(["sleuth", "--no-clarify", "what", "is", "rust"]);
        assert_eq!(args.question.join(" "), "what is rust");
        assert!(args.no_clarify);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(report(&outcome(SessionStatus::Complete), None).unwrap(), 0);
        assert_eq!(report(&outcome(SessionStatus::Incomplete), None).unwrap(), 1);
        assert_eq!(report(&outcome(SessionStatus::NeedsClarification), None).unwrap(), 3);
    }

    #[test]
    fn test_describe_skips_quiet_events() {
        assert!(describe(&ResearchEvent::SessionEnd {
            status: SessionStatus::Complete
        })
        .is_none());
        let line = describe(&ResearchEvent::DelegationBatch {
            topics: vec!["a".into(), "b".into()],
            deferred: 1,
        })
        .unwrap();
        assert_eq!(line, "[Delegating 2 topic(s)] [1 deferred]");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 4), "abcd...");
        assert_eq!(truncate("line one\nline two", 20), "line one...");
    }
}
