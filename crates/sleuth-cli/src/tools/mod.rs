//! Domain tools handed to researchers

mod fetch;
mod search;

pub use fetch::FetchUrlTool;
pub use search::WebSearchTool;

use std::sync::Arc;

use sleuth_research::ToolRegistry;

use crate::config::Config;

/// Registry with page fetching, plus web search when a Tavily key is available
pub fn build_registry(config: &Config) -> anyhow::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(FetchUrlTool::new(config.search.max_page_chars)?))?;

    match config.tavily_api_key() {
        Some(key) => {
            registry.register(Arc::new(WebSearchTool::new(key, config.search.max_results)?))?;
        }
        None => tracing::warn!("no Tavily API key configured; web_search is unavailable"),
    }

    Ok(registry)
}
