//! Text embedding providers.
//!
//! Knowledge entries are embedded before being upserted into the vector
//! index, and chat questions are embedded at query time. Two hosted
//! providers are supported:
//!
//! - `openai` — `POST /v1/embeddings`, key from `OPENAI_API_KEY`.
//! - `cohere` — `POST /v2/embed`, key from `COHERE_API_KEY`. Cohere
//!   distinguishes document embeddings from query embeddings via
//!   `input_type`, so callers must say which side of the search they are on.
//!
//! With `provider = "disabled"` every call fails with a clear error;
//! callers that treat vectors as best-effort log and continue.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::config::EmbeddingConfig;

const OPENAI_URL: &str = "https://api.openai.com/v1/embeddings";
const COHERE_URL: &str = "https://api.cohere.com/v2/embed";

/// Which side of a semantic search a text is on. Only Cohere's API
/// distinguishes the two, but all call sites state their intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Document,
    Query,
}

impl InputType {
    fn as_cohere_str(&self) -> &'static str {
        match self {
            InputType::Document => "search_document",
            InputType::Query => "search_query",
        }
    }
}

/// Embed a batch of texts. Returns one vector per input, in order.
pub async fn embed_texts(
    config: &EmbeddingConfig,
    texts: &[String],
    input_type: InputType,
) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let model = config
        .model
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("embedding.model not configured"))?;

    let embeddings = match config.provider.as_str() {
        "openai" => embed_openai(config, model, texts).await?,
        "cohere" => embed_cohere(config, model, texts, input_type).await?,
        "disabled" => bail!("Embeddings are disabled"),
        other => bail!("Unknown embedding provider: {}", other),
    };

    if embeddings.len() != texts.len() {
        bail!(
            "Embedding count mismatch: sent {} texts, got {} vectors",
            texts.len(),
            embeddings.len()
        );
    }
    if let Some(dims) = config.dims {
        for v in &embeddings {
            if v.len() != dims {
                bail!("Embedding dimension mismatch: expected {}, got {}", dims, v.len());
            }
        }
    }

    Ok(embeddings)
}

/// Embed a single search query.
pub async fn embed_query(config: &EmbeddingConfig, text: &str) -> Result<Vec<f32>> {
    let mut vectors = embed_texts(config, &[text.to_string()], InputType::Query).await?;
    vectors
        .pop()
        .ok_or_else(|| anyhow::anyhow!("Embedding provider returned no vector"))
}

/// Embed a single document for indexing.
pub async fn embed_document(config: &EmbeddingConfig, text: &str) -> Result<Vec<f32>> {
    let mut vectors = embed_texts(config, &[text.to_string()], InputType::Document).await?;
    vectors
        .pop()
        .ok_or_else(|| anyhow::anyhow!("Embedding provider returned no vector"))
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .context("Failed to build HTTP client")
}

/// POST a JSON body with retry on 429/5xx and network errors.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    auth_header: &str,
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(url)
            .header("Authorization", auth_header)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response.json().await.context("Invalid embedding response");
                }
                let text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow::anyhow!("Embedding API error {}: {}", status, text));
                    continue;
                }
                bail!("Embedding API error {}: {}", status, text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding request failed after retries")))
}

#[derive(Deserialize)]
struct OpenAiEmbeddingItem {
    embedding: Vec<f32>,
    index: usize,
}

async fn embed_openai(
    config: &EmbeddingConfig,
    model: &str,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let api_key = std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY not set")?;

    let body = serde_json::json!({
        "model": model,
        "input": texts,
    });

    let json = post_with_retry(
        &http_client(config)?,
        OPENAI_URL,
        &format!("Bearer {}", api_key),
        &body,
        config.max_retries,
    )
    .await?;

    let mut items: Vec<OpenAiEmbeddingItem> =
        serde_json::from_value(json.get("data").cloned().unwrap_or_default())
            .context("Invalid OpenAI embedding response")?;
    // The API documents order preservation, but the index field is
    // authoritative.
    items.sort_by_key(|i| i.index);
    Ok(items.into_iter().map(|i| i.embedding).collect())
}

async fn embed_cohere(
    config: &EmbeddingConfig,
    model: &str,
    texts: &[String],
    input_type: InputType,
) -> Result<Vec<Vec<f32>>> {
    let api_key = std::env::var("COHERE_API_KEY").context("COHERE_API_KEY not set")?;

    let body = serde_json::json!({
        "model": model,
        "texts": texts,
        "input_type": input_type.as_cohere_str(),
        "embedding_types": ["float"],
    });

    let json = post_with_retry(
        &http_client(config)?,
        COHERE_URL,
        &format!("Bearer {}", api_key),
        &body,
        config.max_retries,
    )
    .await?;

    let vectors: Vec<Vec<f32>> = serde_json::from_value(
        json.get("embeddings")
            .and_then(|e| e.get("float"))
            .cloned()
            .unwrap_or_default(),
    )
    .context("Invalid Cohere embedding response")?;

    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_batch_short_circuits() {
        let config = EmbeddingConfig::default();
        let out = embed_texts(&config, &[], InputType::Document).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_provider_errors() {
        let config = EmbeddingConfig {
            model: Some("m".to_string()),
            ..EmbeddingConfig::default()
        };
        let err = embed_query(&config, "hello").await.unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn test_cohere_input_types() {
        assert_eq!(InputType::Document.as_cohere_str(), "search_document");
        assert_eq!(InputType::Query.as_cohere_str(), "search_query");
    }
}
