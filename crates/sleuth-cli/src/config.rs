//! Configuration file support

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sleuth_ai::{Provider, ProviderBackend};
use sleuth_research::ResearchConfig;
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration for sleuth
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Limits and per-stage models
    pub research: ResearchConfig,
    /// API keys (alternative to environment variables)
    pub api_keys: ApiKeys,
    /// Endpoint overrides, e.g. a remote Ollama host
    pub base_urls: BaseUrls,
    pub search: SearchSettings,
}

/// API key configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub anthropic: Option<String>,
    pub openai: Option<String>,
    pub groq: Option<String>,
    pub openrouter: Option<String>,
    pub tavily: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseUrls {
    pub anthropic: Option<String>,
    pub openai: Option<String>,
    pub ollama: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Results requested per search
    pub max_results: u32,
    /// Characters kept from a fetched page
    pub max_page_chars: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            max_results: 5,
            max_page_chars: 20_000,
        }
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sleuth")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("SLEUTH_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from `path`; a missing file means defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .research
            .validate()
            .with_context(|| format!("invalid [research] table in {}", path.display()))?;
        Ok(config)
    }

    /// Write the example config if no file exists yet
    pub fn init(path: &Path) -> std::io::Result<PathBuf> {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, example_config())?;
        Ok(path.to_path_buf())
    }

    /// Get the Tavily key, checking config then env
    pub fn tavily_api_key(&self) -> Option<String> {
        self.api_keys
            .tavily
            .clone()
            .or_else(|| std::env::var("TAVILY_API_KEY").ok())
    }

    /// Build the model backend; providers without a configured key fall back
    /// to their environment variable at call time
    pub fn backend(&self) -> ProviderBackend {
        let mut backend = ProviderBackend::new();
        for (provider, key) in [
            (Provider::Anthropic, &self.api_keys.anthropic),
            (Provider::OpenAI, &self.api_keys.openai),
            (Provider::Groq, &self.api_keys.groq),
            (Provider::OpenRouter, &self.api_keys.openrouter),
        ] {
            if let Some(key) = key {
                backend = backend.with_api_key(provider, key.clone());
            }
        }
        for (provider, url) in [
            (Provider::Anthropic, &self.base_urls.anthropic),
            (Provider::OpenAI, &self.base_urls.openai),
            (Provider::Ollama, &self.base_urls.ollama),
        ] {
            if let Some(url) = url {
                backend = backend.with_base_url(provider, url.clone());
            }
        }
        backend
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# sleuth configuration file
# Place at ~/.config/sleuth/config.toml (Linux), or point SLEUTH_CONFIG_PATH at it

[research]
# Delegation rounds the supervisor may run
max_researcher_iterations = 6
# Tool-call rounds per researcher before it must summarize
max_react_tool_calls = 10
# Researchers running at once
max_concurrent_research_units = 5
max_overflow_retries = 3
max_structured_output_retries = 3
# Ask a clarifying question before researching when the request is ambiguous
allow_clarification = true

# Model ids are "provider:model-name"; providers: anthropic, openai, groq, openrouter, ollama
[research.brief_model]
model = "anthropic:claude-sonnet-4-5"
max_tokens = 8192

[research.research_model]
model = "anthropic:claude-sonnet-4-5"
max_tokens = 10000

[research.compression_model]
model = "anthropic:claude-haiku-4-5"
max_tokens = 8192

[research.final_report_model]
model = "anthropic:claude-sonnet-4-5"
max_tokens = 10000

[search]
max_results = 5
max_page_chars = 20000

# API keys (optional - can also use environment variables)
# It's recommended to use environment variables instead for security
[api_keys]
# anthropic = "sk-ant-..."
# openai = "sk-..."
# tavily = "tvly-..."

[base_urls]
# ollama = "http://localhost:11434/v1"
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses_to_defaults() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.research, ResearchConfig::default());
        assert_eq!(config.search.max_results, 5);
        assert!(config.api_keys.tavily.is_none());
    }

    #[test]
    fn test_partial_config() {
        let config: Config = toml::from_str(
            r#"
            [research]
            max_concurrent_research_units = 2

            [api_keys]
            tavily = "tvly-test"
            "#,
        )
        .unwrap();
        assert_eq!(config.research.max_concurrent_research_units, 2);
        assert_eq!(config.research.max_researcher_iterations, 6);
        assert_eq!(config.tavily_api_key().as_deref(), Some("tvly-test"));
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/sleuth/config.toml")).unwrap();
        assert_eq!(config.research, ResearchConfig::default());
    }

    #[test]
    fn test_invalid_research_table_is_rejected() {
        let path = std::env::temp_dir().join(format!("sleuth-config-{}.toml", std::process::id()));
        fs::write(&path, "[research]\nmax_concurrent_research_units = 0\n").unwrap();
        let err = Config::load(&path).unwrap_err();
        fs::remove_file(&path).ok();
        assert!(format!("{:#}", err).contains("max_concurrent_research_units"));
    }
}
