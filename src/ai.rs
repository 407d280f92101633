use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

/// Embedding backend. The same trait serves chunk ingestion and query-time
/// similarity search so both sides always use the same vector space.
#[async_trait]
pub trait Embedder: Send + Sync + 'static {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow!("embedding backend returned no vectors"))
    }
}

/// Text generation backend.
#[async_trait]
pub trait Generator: Send + Sync + 'static {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Embedder speaking a small JSON contract:
/// `POST {endpoint} {"model": .., "input": [..]}` → `{"embeddings": [[..]]}`.
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbedder {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        }
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut request = self.client.post(&self.endpoint).json(&json!({
            "model": self.model,
            "input": texts,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("embedding request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("embedding backend returned {status}: {body}"));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .context("embedding response was not valid JSON")?;
        if parsed.embeddings.len() != texts.len() {
            return Err(anyhow!(
                "embedding backend returned {} vectors for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            ));
        }
        Ok(parsed.embeddings)
    }
}

/// Generator speaking a small JSON contract:
/// `POST {endpoint} {"model": .., "prompt": ..}` → `{"text": ..}`.
pub struct HttpGenerator {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpGenerator {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        }
    }
}

#[derive(Deserialize)]
struct GenerationResponse {
    text: String,
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let mut request = self.client.post(&self.endpoint).json(&json!({
            "model": self.model,
            "prompt": prompt,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("generation request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("generation backend returned {status}: {body}"));
        }

        let parsed: GenerationResponse = response
            .json()
            .await
            .context("generation response was not valid JSON")?;
        Ok(parsed.text)
    }
}
