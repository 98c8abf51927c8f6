//! LLM JSON-completion client.
//!
//! One client serves the evaluator, contradiction arbitration, and
//! auto-reflect. Backends: Ollama, any OpenAI-compatible API, or none —
//! with no backend every call errors and callers fall through to their
//! rule-based or queued paths.
//!
//! The client is synchronous; all call sites run on blocking worker threads.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::config::LlmConfig;

/// Provider backend for LLM inference.
#[derive(Debug, Clone)]
pub enum LlmProvider {
    /// Ollama running locally.
    Ollama { base_url: String },
    /// OpenAI-compatible API (also works with Anthropic-compatible proxies).
    OpenAiCompatible { base_url: String, api_key: String },
    /// No LLM available — all calls return an error.
    None,
}

pub struct LlmClient {
    provider: LlmProvider,
    http: reqwest::blocking::Client,
    model: String,
    timeout: Duration,
}

impl LlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let provider = match config.provider.as_str() {
            "ollama" => LlmProvider::Ollama {
                base_url: config.base_url.trim_end_matches('/').to_string(),
            },
            "openai" => LlmProvider::OpenAiCompatible {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                api_key: config.api_key.clone(),
            },
            "none" => LlmProvider::None,
            other => anyhow::bail!("unknown llm provider: {other}. Supported: ollama, openai, none"),
        };

        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build LLM HTTP client")?;

        Ok(Self {
            provider,
            http,
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Create a client with no backend (all calls fail → fallback paths).
    pub fn none() -> Self {
        Self {
            provider: LlmProvider::None,
            http: reqwest::blocking::Client::new(),
            model: String::new(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Whether a backend is configured. Callers use this to skip prompt
    /// assembly entirely when there is nothing to talk to.
    pub fn available(&self) -> bool {
        !matches!(self.provider, LlmProvider::None)
    }

    /// Request a JSON object completion. Returns the parsed value or an
    /// error the caller is expected to swallow.
    pub fn complete_json(&self, system: &str, user: &str) -> Result<Value> {
        let text = match &self.provider {
            LlmProvider::None => anyhow::bail!("no LLM provider configured"),
            LlmProvider::Ollama { base_url } => self.generate_ollama(base_url, system, user)?,
            LlmProvider::OpenAiCompatible { base_url, api_key } => {
                self.generate_openai(base_url, api_key, system, user)?
            }
        };

        let stripped = strip_code_fences(&text);
        serde_json::from_str(stripped)
            .with_context(|| format!("LLM returned non-JSON output: {}", preview(stripped)))
    }

    fn generate_ollama(&self, base_url: &str, system: &str, user: &str) -> Result<String> {
        let url = format!("{base_url}/api/generate");
        let body = json!({
            "model": self.model,
            "prompt": format!("{system}\n\n{user}"),
            "stream": false,
            "format": "json",
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .context("ollama request failed")?;
        anyhow::ensure!(
            response.status().is_success(),
            "ollama returned HTTP {}",
            response.status()
        );

        let json: Value = response.json().context("failed to parse ollama response")?;
        let text = json["response"].as_str().unwrap_or("").to_string();
        debug!(chars = text.len(), "ollama completion received");
        Ok(text)
    }

    fn generate_openai(
        &self,
        base_url: &str,
        api_key: &str,
        system: &str,
        user: &str,
    ) -> Result<String> {
        let url = format!("{base_url}/chat/completions");
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "response_format": {"type": "json_object"},
        });

        let mut request = self.http.post(&url).json(&body).timeout(self.timeout);
        if !api_key.is_empty() {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().context("openai request failed")?;
        anyhow::ensure!(
            response.status().is_success(),
            "openai endpoint returned HTTP {}",
            response.status()
        );

        let json: Value = response.json().context("failed to parse openai response")?;
        let text = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        debug!(chars = text.len(), "openai completion received");
        Ok(text)
    }
}

/// Strip a surrounding markdown code fence, if the model added one.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

fn preview(s: &str) -> &str {
    let end = s
        .char_indices()
        .take_while(|(i, _)| *i < 120)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(s.len());
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_client_is_unavailable() {
        let client = LlmClient::none();
        assert!(!client.available());
        assert!(client.complete_json("sys", "user").is_err());
    }

    #[test]
    fn strips_code_fences() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }

    #[test]
    fn from_config_rejects_unknown_provider() {
        let mut config = crate::config::LlmConfig::default();
        config.provider = "mystery".into();
        assert!(LlmClient::from_config(&config).is_err());
    }
}
