//! TOML configuration.
//!
//! Every section except `[db]`, `[storage]` and `[server]` has defaults, so a
//! minimal config file only needs to say where things live and which secret
//! signs preview URLs. Provider secrets such as
//! `OPENAI_API_KEY` are read from the environment, never from the file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Dimensionality of the embedding vectors stored for every chunk.
pub const DEFAULT_EMBEDDING_DIMS: usize = 1536;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Where raw document bytes live and how preview URLs are signed.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default)]
    pub signing_secret: String,
    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,
    /// Upper bound for caller-requested signed URL lifetimes.
    #[serde(default = "default_max_signed_url_ttl_secs")]
    pub max_signed_url_ttl_secs: u64,
}

impl StorageConfig {
    /// `requested` (or the default TTL) capped at `max_signed_url_ttl_secs`.
    pub fn signed_url_ttl(&self, requested: Option<u64>) -> Duration {
        let secs = requested
            .unwrap_or(self.signed_url_ttl_secs)
            .min(self.max_signed_url_ttl_secs);
        Duration::from_secs(secs)
    }
}

fn default_public_base_url() -> String {
    "http://127.0.0.1:7431/files".to_string()
}
fn default_signed_url_ttl_secs() -> u64 {
    3600
}
fn default_max_signed_url_ttl_secs() -> u64 {
    24 * 3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// How far back from a chunk's hard end to look for a natural breakpoint.
    #[serde(default = "default_boundary_window")]
    pub boundary_window: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            boundary_window: default_boundary_window(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_boundary_window() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dims")]
    pub dims: usize,
    /// Base URL of the provider. Defaults depend on the provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,
    /// Maximum number of in-flight embedding calls during one ingestion run.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: default_embedding_dims(),
            url: None,
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            timeout_secs: default_timeout_secs(),
            max_input_tokens: default_max_input_tokens(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-ada-002".to_string()
}
fn default_embedding_dims() -> usize {
    DEFAULT_EMBEDDING_DIMS
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_retry_max_ms() -> u64 {
    32_000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_input_tokens() -> usize {
    8191
}
fn default_concurrency() -> usize {
    4
}

impl EmbeddingConfig {
    /// Per-request HTTP timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Outer deadline for one `embed` call. The provider retries inside it,
    /// so it covers every attempt plus the longest possible backoff sleeps.
    pub fn call_budget(&self) -> Duration {
        self.timeout() * (self.max_retries + 1)
            + Duration::from_millis(self.retry_max_ms) * self.max_retries
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_provider")]
    pub provider: String,
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Retries for opening the stream. Fragments are never replayed.
    #[serde(default = "default_completion_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Longest allowed silence between two streamed fragments.
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_completion_provider(),
            model: default_completion_model(),
            url: None,
            temperature: None,
            max_retries: default_completion_retries(),
            retry_base_ms: default_retry_base_ms(),
            connect_timeout_secs: default_timeout_secs(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            system_prompt: None,
        }
    }
}

fn default_completion_provider() -> String {
    "openai".to_string()
}
fn default_completion_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_completion_retries() -> u32 {
    2
}
fn default_inactivity_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_context_budget")]
    pub context_budget_bytes: usize,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            context_budget_bytes: default_context_budget(),
            search_timeout_secs: default_search_timeout_secs(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_context_budget() -> usize {
    3000
}
fn default_search_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_extract_timeout_secs")]
    pub extract_timeout_secs: u64,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
            extract_timeout_secs: default_extract_timeout_secs(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_extract_timeout_secs() -> u64 {
    60
}
fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// Bearer tokens accepted by the HTTP server, mapped to user ids.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate storage
    if config.storage.signing_secret.trim().is_empty() {
        anyhow::bail!("storage.signing_secret must be set");
    }
    if config.storage.signed_url_ttl_secs == 0 {
        anyhow::bail!("storage.signed_url_ttl_secs must be > 0");
    }
    if config.storage.max_signed_url_ttl_secs > 365 * 24 * 3600 {
        anyhow::bail!("storage.max_signed_url_ttl_secs must be at most one year");
    }
    if config.storage.signed_url_ttl_secs > config.storage.max_signed_url_ttl_secs {
        anyhow::bail!("storage.signed_url_ttl_secs must be <= storage.max_signed_url_ttl_secs");
    }

    // Validate chunking
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be < chunking.chunk_size");
    }

    // Validate embedding
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.concurrency == 0 {
        anyhow::bail!("embedding.concurrency must be >= 1");
    }
    match config.embedding.provider.as_str() {
        "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai or ollama.",
            other
        ),
    }

    match config.completion.provider.as_str() {
        "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown completion provider: '{}'. Must be openai or ollama.",
            other
        ),
    }
    if config.completion.inactivity_timeout_secs == 0 {
        anyhow::bail!("completion.inactivity_timeout_secs must be > 0");
    }

    // Validate retrieval
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    Ok(())
}
