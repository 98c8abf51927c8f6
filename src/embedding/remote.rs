//! Remote HTTP embedding provider (OpenAI-compatible `/embeddings`).
//!
//! Synchronous [`reqwest::blocking`] client — the store's write path runs on
//! blocking worker threads, so no async plumbing is needed here. Any network
//! or shape failure surfaces as an error and the caller degrades to storing
//! the fragment without a vector.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

use super::{l2_normalize, EmbeddingProvider};
use crate::config::EmbeddingConfig;

pub struct RemoteEmbeddingProvider {
    http: reqwest::blocking::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

impl RemoteEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build embedding HTTP client")?;

        Ok(Self {
            http,
            url: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dims: config.dims,
        })
    }
}

impl EmbeddingProvider for RemoteEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut request = self.http.post(&self.url).json(&serde_json::json!({
            "model": self.model,
            "input": text,
        }));
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().context("embedding request failed")?;
        anyhow::ensure!(
            response.status().is_success(),
            "embedding endpoint returned HTTP {}",
            response.status()
        );

        let body: EmbeddingsResponse = response
            .json()
            .context("failed to parse embeddings response")?;
        let row = body
            .data
            .into_iter()
            .next()
            .context("embeddings response contained no vectors")?;

        anyhow::ensure!(
            row.embedding.len() == self.dims,
            "embedding has {} dims, expected {}",
            row.embedding.len(),
            self.dims
        );

        Ok(l2_normalize(&row.embedding))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}
