//! Hosted vector index client (Pinecone serverless).
//!
//! Two namespaces back the copilot's retrieval:
//! - `"global"` — admin-curated knowledge shared across tenants.
//! - one namespace per user, keyed by the user id, for private entries.
//!
//! The control plane (`api.pinecone.io`) resolves the index host once and
//! caches it; all upsert/query/delete traffic then goes straight to the
//! data plane. Vector operations are best-effort throughout the app: a
//! failure here degrades retrieval quality, it never fails a write to the
//! database.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::config::Config;

const CONTROL_PLANE_URL: &str = "https://api.pinecone.io";
const API_VERSION: &str = "2025-01";

/// Namespace holding the shared, admin-managed knowledge.
pub const GLOBAL_NAMESPACE: &str = "global";

/// One retrieval hit: the vector id and its similarity score.
#[derive(Debug, Clone, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    #[serde(default)]
    pub score: f64,
}

/// Result of querying both namespaces. Either side may be empty if that
/// query failed; a failure is logged, not propagated.
#[derive(Debug, Default)]
pub struct DualQueryResult {
    pub global: Vec<VectorMatch>,
    pub user: Vec<VectorMatch>,
}

pub struct VectorIndex {
    config: Arc<Config>,
    client: reqwest::Client,
    /// Data-plane host for the index, resolved lazily from the control plane.
    host: OnceCell<String>,
}

impl VectorIndex {
    pub fn new(config: Arc<Config>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.vector.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            host: OnceCell::new(),
        }
    }

    fn api_key(&self) -> Result<String> {
        self.config
            .vector
            .api_key()
            .ok_or_else(|| anyhow::anyhow!("PINECONE_API_KEY not set"))
    }

    /// Resolve the index host, creating the index if it does not exist.
    /// The result is cached for the life of the process.
    pub async fn ensure_index(&self) -> Result<String> {
        let host = self
            .host
            .get_or_try_init(|| self.resolve_or_create_index())
            .await?;
        Ok(host.clone())
    }

    async fn resolve_or_create_index(&self) -> Result<String> {
        let api_key = self.api_key()?;
        let name = &self.config.vector.index_name;

        let resp = self
            .client
            .get(format!("{}/indexes/{}", CONTROL_PLANE_URL, name))
            .header("Api-Key", &api_key)
            .header("X-Pinecone-Api-Version", API_VERSION)
            .send()
            .await
            .context("Vector control plane unreachable")?;

        if resp.status().is_success() {
            let desc: serde_json::Value = resp.json().await?;
            return host_from_description(&desc);
        }

        if resp.status().as_u16() != 404 {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Vector index describe failed {}: {}", status, text);
        }

        let dims = self
            .config
            .embedding
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required to create the index"))?;

        tracing::info!(index = %name, dims, "creating vector index");
        let create = self
            .client
            .post(format!("{}/indexes", CONTROL_PLANE_URL))
            .header("Api-Key", &api_key)
            .header("X-Pinecone-Api-Version", API_VERSION)
            .json(&json!({
                "name": name,
                "dimension": dims,
                "metric": "cosine",
                "spec": {
                    "serverless": {
                        "cloud": self.config.vector.cloud,
                        "region": self.config.vector.region,
                    }
                }
            }))
            .send()
            .await
            .context("Vector index create failed")?;

        if !create.status().is_success() {
            let status = create.status();
            let text = create.text().await.unwrap_or_default();
            bail!("Vector index create failed {}: {}", status, text);
        }

        let desc: serde_json::Value = create.json().await?;
        host_from_description(&desc)
    }

    /// Upsert one vector into a namespace.
    pub async fn upsert(
        &self,
        namespace: &str,
        id: &str,
        values: &[f32],
        metadata: serde_json::Value,
    ) -> Result<()> {
        let host = self.ensure_index().await?;
        let resp = self
            .client
            .post(format!("https://{}/vectors/upsert", host))
            .header("Api-Key", self.api_key()?)
            .header("X-Pinecone-Api-Version", API_VERSION)
            .json(&json!({
                "namespace": namespace,
                "vectors": [{ "id": id, "values": values, "metadata": metadata }],
            }))
            .send()
            .await
            .context("Vector upsert failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Vector upsert failed {}: {}", status, text);
        }
        Ok(())
    }

    /// Query one namespace, returning up to `top_k` matches.
    pub async fn query(
        &self,
        namespace: &str,
        values: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorMatch>> {
        let host = self.ensure_index().await?;
        let resp = self
            .client
            .post(format!("https://{}/query", host))
            .header("Api-Key", self.api_key()?)
            .header("X-Pinecone-Api-Version", API_VERSION)
            .json(&json!({
                "namespace": namespace,
                "vector": values,
                "topK": top_k,
                "includeMetadata": false,
            }))
            .send()
            .await
            .context("Vector query failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Vector query failed {}: {}", status, text);
        }

        #[derive(Deserialize)]
        struct QueryResponse {
            #[serde(default)]
            matches: Vec<VectorMatch>,
        }
        let parsed: QueryResponse = resp.json().await.context("Invalid query response")?;
        Ok(parsed.matches)
    }

    /// Query the global namespace and a user namespace concurrently.
    /// Each side degrades independently: a failed query logs a warning
    /// and contributes no matches.
    pub async fn query_both(&self, user_namespace: &str, values: &[f32]) -> DualQueryResult {
        let (global, user) = tokio::join!(
            self.query(GLOBAL_NAMESPACE, values, self.config.vector.top_k_global),
            self.query(user_namespace, values, self.config.vector.top_k_user),
        );

        DualQueryResult {
            global: global.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "global namespace query failed");
                Vec::new()
            }),
            user: user.unwrap_or_else(|e| {
                tracing::warn!(error = %e, namespace = %user_namespace, "user namespace query failed");
                Vec::new()
            }),
        }
    }

    /// Delete vectors by id from a namespace.
    pub async fn delete(&self, namespace: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let host = self.ensure_index().await?;
        let resp = self
            .client
            .post(format!("https://{}/vectors/delete", host))
            .header("Api-Key", self.api_key()?)
            .header("X-Pinecone-Api-Version", API_VERSION)
            .json(&json!({ "namespace": namespace, "ids": ids }))
            .send()
            .await
            .context("Vector delete failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Vector delete failed {}: {}", status, text);
        }
        Ok(())
    }
}

fn host_from_description(desc: &serde_json::Value) -> Result<String> {
    desc.get("host")
        .and_then(|h| h.as_str())
        .map(|h| h.to_string())
        .ok_or_else(|| anyhow::anyhow!("Index description missing host"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_from_description() {
        let desc = serde_json::json!({
            "name": "idx",
            "host": "idx-abc123.svc.aped-4627-b74a.pinecone.io"
        });
        assert_eq!(
            host_from_description(&desc).unwrap(),
            "idx-abc123.svc.aped-4627-b74a.pinecone.io"
        );
    }

    #[test]
    fn test_host_missing_is_error() {
        assert!(host_from_description(&serde_json::json!({ "name": "idx" })).is_err());
    }

    #[test]
    fn test_match_parsing_defaults_score() {
        let m: VectorMatch = serde_json::from_value(serde_json::json!({ "id": "kb-1" })).unwrap();
        assert_eq!(m.id, "kb-1");
        assert_eq!(m.score, 0.0);
    }
}
