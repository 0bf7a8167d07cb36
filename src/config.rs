use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub db: DbConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub market: MarketConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Allowed CORS origins. Empty means allow any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_secret_key")]
    pub secret_key: String,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_minutes: i64,
    /// Emails granted access to the admin knowledge routes.
    #[serde(default)]
    pub admin_emails: Vec<String>,
}

fn default_secret_key() -> String {
    "change-me-to-a-random-64-char-string-in-production".to_string()
}
fn default_token_ttl() -> i64 {
    30
}

impl AuthConfig {
    /// JWT signing secret. `BRIEF_FORGE_SECRET_KEY` overrides the config value.
    pub fn secret(&self) -> String {
        std::env::var("BRIEF_FORGE_SECRET_KEY").unwrap_or_else(|_| self.secret_key.clone())
    }

    pub fn is_admin(&self, email: &str) -> bool {
        self.admin_emails.iter().any(|e| e == email)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AiConfig {
    #[serde(default = "default_ai_model")]
    pub model: String,
    #[serde(default = "default_chat_max_tokens")]
    pub chat_max_tokens: u32,
    #[serde(default = "default_brief_max_tokens")]
    pub brief_max_tokens: u32,
    #[serde(default = "default_ai_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_ai_max_retries")]
    pub max_retries: u32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            model: default_ai_model(),
            chat_max_tokens: default_chat_max_tokens(),
            brief_max_tokens: default_brief_max_tokens(),
            timeout_secs: default_ai_timeout_secs(),
            max_retries: default_ai_max_retries(),
        }
    }
}

fn default_ai_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_chat_max_tokens() -> u32 {
    2048
}
fn default_brief_max_tokens() -> u32 {
    4096
}
fn default_ai_timeout_secs() -> u64 {
    120
}
fn default_ai_max_retries() -> u32 {
    3
}

impl AiConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.is_empty())
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key().is_some()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_embedding_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            max_retries: default_embedding_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_max_retries() -> u32 {
    5
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    #[serde(default = "default_index_name")]
    pub index_name: String,
    #[serde(default = "default_vector_cloud")]
    pub cloud: String,
    #[serde(default = "default_vector_region")]
    pub region: String,
    #[serde(default = "default_top_k")]
    pub top_k_global: usize,
    #[serde(default = "default_top_k")]
    pub top_k_user: usize,
    #[serde(default = "default_vector_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            index_name: default_index_name(),
            cloud: default_vector_cloud(),
            region: default_vector_region(),
            top_k_global: default_top_k(),
            top_k_user: default_top_k(),
            timeout_secs: default_vector_timeout_secs(),
        }
    }
}

fn default_index_name() -> String {
    "brief-forge".to_string()
}
fn default_vector_cloud() -> String {
    "aws".to_string()
}
fn default_vector_region() -> String {
    "us-east-1".to_string()
}
fn default_top_k() -> usize {
    3
}
fn default_vector_timeout_secs() -> u64 {
    15
}

impl VectorConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var("PINECONE_API_KEY").ok().filter(|k| !k.is_empty())
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key().is_some()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketConfig {
    #[serde(default = "default_market_base_url")]
    pub base_url: String,
    #[serde(default = "default_market_web_base_url")]
    pub web_base_url: String,
    #[serde(default = "default_market_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_market_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_image_proxy_hosts")]
    pub image_proxy_allowed_hosts: Vec<String>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            base_url: default_market_base_url(),
            web_base_url: default_market_web_base_url(),
            cache_ttl_secs: default_market_cache_ttl_secs(),
            timeout_secs: default_market_timeout_secs(),
            image_proxy_allowed_hosts: default_image_proxy_hosts(),
        }
    }
}

fn default_market_base_url() -> String {
    "https://openapi.fastmoss.com".to_string()
}
fn default_market_web_base_url() -> String {
    "https://www.fastmoss.com/api".to_string()
}
fn default_market_cache_ttl_secs() -> u64 {
    300
}
fn default_market_timeout_secs() -> u64 {
    15
}
fn default_image_proxy_hosts() -> Vec<String> {
    vec!["s.500fd.com".to_string(), "p16-oec-va.ibyteimg.com".to_string()]
}

impl MarketConfig {
    pub fn client_id(&self) -> Option<String> {
        std::env::var("FASTMOSS_CLIENT_ID").ok().filter(|k| !k.is_empty())
    }

    pub fn client_secret(&self) -> Option<String> {
        std::env::var("FASTMOSS_CLIENT_SECRET").ok().filter(|k| !k.is_empty())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.server.bind.trim().is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }

    if config.auth.token_ttl_minutes < 1 {
        anyhow::bail!("auth.token_ttl_minutes must be >= 1");
    }

    if config.embedding.is_enabled() {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "cohere" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or cohere.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_minimal_config_defaults() {
        let (_dir, path) = write_config(
            r#"
[server]
bind = "127.0.0.1:8080"

[db]
path = "/tmp/app.sqlite"

[auth]
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.auth.token_ttl_minutes, 30);
        assert_eq!(config.embedding.provider, "disabled");
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.market.cache_ttl_secs, 300);
        assert_eq!(config.vector.top_k_global, 3);
    }

    #[test]
    fn test_embedding_requires_model_and_dims() {
        let (_dir, path) = write_config(
            r#"
[server]
bind = "127.0.0.1:8080"

[db]
path = "/tmp/app.sqlite"

[auth]

[embedding]
provider = "cohere"
"#,
        );
        let err = load_config(&path).unwrap_err().to_string();
        assert!(err.contains("embedding.model"));
    }

    #[test]
    fn test_unknown_embedding_provider_rejected() {
        let (_dir, path) = write_config(
            r#"
[server]
bind = "127.0.0.1:8080"

[db]
path = "/tmp/app.sqlite"

[auth]

[embedding]
provider = "bedrock"
model = "m"
dims = 1024
"#,
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_admin_emails() {
        let (_dir, path) = write_config(
            r#"
[server]
bind = "127.0.0.1:8080"

[db]
path = "/tmp/app.sqlite"

[auth]
admin_emails = ["ops@example.com"]
"#,
        );
        let config = load_config(&path).unwrap();
        assert!(config.auth.is_admin("ops@example.com"));
        assert!(!config.auth.is_admin("user@example.com"));
    }
}
