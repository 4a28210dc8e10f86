//! Default prompt templates
//!
//! Every template is rendered with today's date so the model does not assume
//! its training cutoff is the present.

use sleuth_ai::Message;

fn today() -> String {
    chrono::Local::now().format("%a %b %-d, %Y").to_string()
}

/// Render a user-visible transcript of the conversation so far
pub fn transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| !m.text().trim().is_empty())
        .map(|m| match m {
            Message::User { .. } => format!("User: {}", m.text()),
            Message::Assistant { .. } => format!("Assistant: {}", m.text()),
            Message::ToolResult { tool_name, .. } => format!("Tool ({}): {}", tool_name, m.text()),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn clarification_system() -> String {
    format!(
        r#"You decide whether a research request can be researched as stated.
Today's date is {}.

Ask for clarification only when the request contains acronyms, abbreviations or
unknown terms you cannot resolve, or when the scope is genuinely ambiguous. If a
clarifying question was already asked in the conversation, do not ask another
one unless it is absolutely necessary.

Answer with the clarification tool:
- need_clarification: true if you must ask the user something first
- question: the single, concise question to ask (empty when not needed)
- verification: when no question is needed, a short message confirming what you
  will research (empty when a question is needed)"#,
        today()
    )
}

pub fn brief_system() -> String {
    format!(
        r#"Translate the conversation into one detailed research brief that will guide
a team of researchers. Today's date is {}.

- Write in the first person, from the user's perspective.
- Include every detail, preference and constraint the user stated.
- Leave dimensions the user did not specify open; do not invent constraints.
- Name preferred source types (official sites, primary papers) when the user
  implied them.

Answer with the research_brief tool."#,
        today()
    )
}

pub fn supervisor_system(max_concurrent: usize, max_iterations: u32) -> String {
    format!(
        r#"You lead a research team. Today's date is {date}.
Your job is to call conduct_research to delegate research on the brief the user
gives you, one self-contained topic per call.

Tools:
- conduct_research: delegate one topic to a dedicated researcher. Write the
  topic in full detail; researchers cannot see the brief or each other's work.
- reflect: think through what you have learned and what is missing before
  deciding the next step.
- think: short scratchpad notes.
- research_complete: call this once the findings answer the brief.

Limits:
- At most {max_concurrent} conduct_research calls run per turn; extra calls are
  deferred and must be re-issued next turn.
- At most {max_iterations} delegation rounds in total. Prefer fewer, broader
  topics; use parallel topics only for clearly independent subjects such as
  comparing several options.
- Stop when you can answer confidently; do not delegate for perfection."#,
        date = today(),
        max_concurrent = max_concurrent,
        max_iterations = max_iterations,
    )
}

pub fn researcher_system(tool_names: &[String], max_tool_calls: u32) -> String {
    format!(
        r#"You are a research assistant investigating one topic. Today's date is {date}.
Use the available tools ({tools}) to gather information, then call
research_complete when you have enough to answer the topic.

- Start with broad searches, then narrow down to fill the gaps.
- Use think to assess each result before the next search.
- Stop once you can answer comprehensively or the last searches return
  information you already have.
- You may run at most {max_tool_calls} rounds of tool calls."#,
        date = today(),
        tools = tool_names.join(", "),
        max_tool_calls = max_tool_calls,
    )
}

pub fn compression_system() -> String {
    format!(
        r#"You clean up research findings gathered by tool calls and web searches.
Today's date is {}.

Rewrite every relevant fact verbatim or near-verbatim; do not summarize away
information. Remove only clearly irrelevant or duplicate material.

Output format:
**Queries and Tool Calls Made**
**Fully Comprehensive Findings**
**List of All Relevant Sources (with citations in the report)**

Cite sources inline as [1], [2] and end with a ### Sources section listing each
source once as "[n] Title: URL"."#,
        today()
    )
}

pub fn compression_request(topic: &str) -> String {
    format!(
        "All of the messages above are research on the topic: {}\n\
         Clean up these findings following the output format. Keep every \
         relevant statement and its source.",
        topic
    )
}

pub fn final_report(brief: &str, messages: &[Message], findings: &str) -> String {
    format!(
        r#"Write a comprehensive, well-structured answer to the research brief.
Today's date is {date}.

<Research Brief>
{brief}
</Research Brief>

<Conversation>
{conversation}
</Conversation>

<Findings>
{findings}
</Findings>

- Answer in the language the user wrote in.
- Use markdown headings and one section per major theme.
- Cite sources inline as [1], [2] and finish with a ### Sources section
  listing each source once as "[n] Title: URL", numbered sequentially."#,
        date = today(),
        brief = brief,
        conversation = transcript(messages),
        findings = findings,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_skips_empty_messages() {
        let messages = vec![
            Message::user("What is Rust?"),
            Message::assistant_empty(),
            Message::tool_result("c1", "web_search", "Rust is a language", false),
        ];
        let text = transcript(&messages);
        assert_eq!(
            text,
            "User: What is Rust?\n\nTool (web_search): Rust is a language"
        );
    }

    #[test]
    fn test_supervisor_prompt_states_limits() {
        let prompt = supervisor_system(3, 4);
        assert!(prompt.contains("At most 3 conduct_research"));
        assert!(prompt.contains("At most 4 delegation rounds"));
    }
}
