use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::embed::{EmbedError, Embedder};

/// OpenAI-compatible embeddings client.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: SecretString,
}

impl OpenAiEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: SecretString,
        timeout: Duration,
    ) -> Result<Self, EmbedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| EmbedError::Transport(error.to_string()))?;

        Ok(Self { client, base_url: base_url.into(), model: model.into(), api_key })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&serde_json::json!({ "model": self.model, "input": text }))
            .send()
            .await
            .map_err(|error| EmbedError::Transport(error.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Provider(format!("embedding api error {status}: {body}")));
        }

        let payload: EmbeddingResponse = response
            .json()
            .await
            .map_err(|error| EmbedError::Provider(format!("invalid embedding payload: {error}")))?;

        let embedding = payload
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .ok_or_else(|| EmbedError::Provider("no embedding returned".to_string()))?;

        debug!(
            event_name = "embed.completed",
            model = %self.model,
            dimensions = embedding.len(),
            chars = text.len(),
            "embedded text"
        );

        Ok(embedding)
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}
