//! Fetch a web page and reduce it to readable text

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header::CONTENT_TYPE, redirect::Policy};
use scraper::{Html, Selector};
use sleuth_research::{ResearchTool, ToolExecutionError};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Containers tried in order before falling back to the whole document
const CONTENT_SELECTORS: [&str; 6] = ["main", "article", "[role=main]", ".content", "#content", "body"];

/// `fetch_url` tool
pub struct FetchUrlTool {
    client: Client,
    max_chars: usize,
}

impl FetchUrlTool {
    pub fn new(max_chars: usize) -> reqwest::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("Mozilla/5.0 (compatible; sleuth/", env!("CARGO_PKG_VERSION"), ")"))
            .redirect(Policy::limited(5))
            .build()?;
        Ok(Self { client, max_chars })
    }

    async fn fetch(&self, url: Url) -> Result<String, ToolExecutionError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ToolExecutionError::Failed(format!("failed to fetch {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolExecutionError::Failed(format!("HTTP {} fetching {}", status, url)));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_lowercase();
        let is_html = content_type.contains("text/html") || content_type.is_empty();
        let is_text = content_type.contains("text/plain") || content_type.contains("text/markdown");
        if !is_html && !is_text {
            return Err(ToolExecutionError::Failed(format!(
                "unsupported content type '{}' at {}",
                content_type, url
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ToolExecutionError::Failed(format!("failed to read {}: {}", url, e)))?;

        let text = if is_html {
            extract_text_from_html(&body)
        } else {
            clean_extracted_text(&body)
        };

        Ok(format!(
            "Content from {}:\n\n{}",
            url,
            truncate_at_boundary(&text, self.max_chars)
        ))
    }
}

#[async_trait]
impl ResearchTool for FetchUrlTool {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch a web page and return its readable text. Use this to read a \
         promising search result in full."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "Absolute http(s) URL to fetch"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<String, ToolExecutionError> {
        let raw = arguments["url"].as_str().unwrap_or_default();
        let url = parse_http_url(raw)?;

        tracing::debug!(url = %url, "fetching page");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ToolExecutionError::Cancelled),
            result = self.fetch(url) => result,
        }
    }
}

fn parse_http_url(raw: &str) -> Result<Url, ToolExecutionError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| ToolExecutionError::InvalidArguments(format!("invalid URL '{}': {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(ToolExecutionError::InvalidArguments(format!(
            "unsupported URL scheme '{}'",
            scheme
        ))),
    }
}

/// Readable text of the main content area, or of the whole page
fn extract_text_from_html(html: &str) -> String {
    let document = Html::parse_document(html);

    for selector in CONTENT_SELECTORS {
        let Ok(selector) = Selector::parse(selector) else {
            continue;
        };
        if let Some(element) = document.select(&selector).next() {
            let cleaned = clean_extracted_text(&element.text().collect::<Vec<_>>().join(" "));
            if cleaned.len() > 100 {
                return cleaned;
            }
        }
    }

    clean_extracted_text(&document.root_element().text().collect::<Vec<_>>().join(" "))
}

/// Collapse whitespace within lines; blank lines become a single paragraph break
fn clean_extracted_text(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut pending_break = false;

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            pending_break = true;
            continue;
        }
        if !result.is_empty() {
            result.push_str(if pending_break { "\n\n" } else { " " });
        }
        let mut words = line.split_whitespace();
        if let Some(first) = words.next() {
            result.push_str(first);
            for word in words {
                result.push(' ');
                result.push_str(word);
            }
        }
        pending_break = false;
    }

    result
}

fn truncate_at_boundary(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let end = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let cut = text[..end].rfind(char::is_whitespace).unwrap_or(end);
    format!("{}\n\n[truncated at {} characters]", text[..cut].trim_end(), max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_extracted_text() {
        assert_eq!(clean_extracted_text("  hello   world  \n  again "), "hello world again");
        assert_eq!(clean_extracted_text("first\n\n\n\nsecond"), "first\n\nsecond");
        assert_eq!(clean_extracted_text("\n\n"), "");
    }

    #[test]
    fn test_extract_prefers_main_content() {
        let filler = "Body text about the topic. ".repeat(10);
        let html = format!(
            "<html><body><nav>Home | About</nav><main><p>{}</p></main><footer>(c)</footer></body></html>",
            filler
        );
        let text = extract_text_from_html(&html);
        assert!(text.starts_with("Body text about the topic."));
        assert!(!text.contains("Home | About"));
    }

    #[test]
    fn test_extract_short_page_falls_back_to_document() {
        let text = extract_text_from_html("<html><body><p>Short page</p></body></html>");
        assert_eq!(text, "Short page");
    }

    #[test]
    fn test_truncate_at_boundary() {
        assert_eq!(truncate_at_boundary("short", 10), "short");
        let out = truncate_at_boundary("alpha beta gamma delta", 12);
        assert!(out.starts_with("alpha beta\n\n[truncated"));
    }

    #[test]
    fn test_parse_http_url() {
        assert!(parse_http_url("https://example.com/page").is_ok());
        assert!(matches!(
            parse_http_url("ftp://example.com/file"),
            Err(ToolExecutionError::InvalidArguments(_))
        ));
        assert!(matches!(parse_http_url("not a url"), Err(ToolExecutionError::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn test_bad_scheme_is_rejected_before_fetching() {
        let tool = FetchUrlTool::new(1000).unwrap();
        let err = tool
            .execute(serde_json::json!({ "url": "file:///etc/passwd" }), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported URL scheme"));
    }
}
