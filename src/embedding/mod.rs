//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and two HTTP backends:
//! - **[`OpenAIProvider`]** calls the OpenAI embeddings API.
//! - **[`OllamaProvider`]** calls a local Ollama instance's `/api/embed` endpoint.
//!
//! Also provides vector utilities for storing and comparing embeddings:
//! - [`cosine_similarity`] computes similarity between two embedding vectors
//! - [`vec_to_blob`] encodes a `Vec<f32>` as little-endian bytes for SQLite BLOB storage
//! - [`blob_to_vec`] decodes a SQLite BLOB back into a `Vec<f32>`
//!
//! # Retry Strategy
//!
//! Both providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and timeouts → retry
//! - Backoff: `retry_base_ms · 2^(attempt-1)`, capped at `retry_max_ms`
//!
//! When the budget runs out the caller gets [`EmbeddingError::Exhausted`].

use anyhow::bail;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::config::EmbeddingConfig;
use crate::retry::RetryPolicy;

/// Rough characters-per-token ratio used to bound provider input.
const CHARS_PER_TOKEN: usize = 4;

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Network failure, timeout, 429 or 5xx. Retried.
    #[error("transient embedding failure: {0}")]
    Transient(String),
    /// Rejected by the provider (bad key, bad request). Not retried.
    #[error("embedding request rejected: {0}")]
    Fatal(String),
    #[error("malformed embedding response: {0}")]
    Malformed(String),
    #[error("embedding failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl EmbeddingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmbeddingError::Transient(_))
    }
}

/// Trait for embedding providers.
///
/// Every vector returned by [`embed`](EmbeddingProvider::embed) has exactly
/// [`dims`](EmbeddingProvider::dims) components.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-ada-002"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embeds one text. Over-long input is truncated, not rejected.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Shared HTTP plumbing for the remote providers.
struct HttpEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    retry: RetryPolicy,
    max_input_tokens: usize,
}

impl HttpEmbedder {
    fn new(config: &EmbeddingConfig, default_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            model: config.model.clone(),
            dims: config.dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| default_url.to_string())
                .trim_end_matches('/')
                .to_string(),
            retry: retry_policy(config),
            max_input_tokens: config.max_input_tokens,
        })
    }

    /// POSTs `body` to `path`, retrying transient failures, and returns the
    /// decoded JSON response.
    async fn post_json(
        &self,
        provider: &str,
        path: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, EmbeddingError> {
        let endpoint = format!("{}{}", self.url, path);
        let client = &self.client;
        let endpoint = endpoint.as_str();

        let what = format!("{} embedding request", provider);
        self.retry
            .run(&what, EmbeddingError::is_retryable, move || async move {
                let mut request = client.post(endpoint).json(body);
                if let Some(token) = bearer {
                    request = request.bearer_auth(token);
                }

                let response = request
                    .send()
                    .await
                    .map_err(|e| EmbeddingError::Transient(e.to_string()))?;
                let status = response.status();

                if status.is_success() {
                    return response
                        .json::<serde_json::Value>()
                        .await
                        .map_err(|e| EmbeddingError::Malformed(e.to_string()));
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    Err(EmbeddingError::Transient(format!(
                        "{} API error {}: {}",
                        provider, status, body_text
                    )))
                } else {
                    Err(EmbeddingError::Fatal(format!(
                        "{} API error {}: {}",
                        provider, status, body_text
                    )))
                }
            })
            .await
            .map_err(|(err, attempts)| match err {
                EmbeddingError::Transient(last) => EmbeddingError::Exhausted { attempts, last },
                other => other,
            })
    }

    fn check_dims(&self, vec: Vec<f32>) -> Result<Vec<f32>, EmbeddingError> {
        if vec.len() != self.dims {
            return Err(EmbeddingError::Malformed(format!(
                "expected {} dimensions, got {}",
                self.dims,
                vec.len()
            )));
        }
        Ok(vec)
    }
}

fn retry_policy(config: &EmbeddingConfig) -> RetryPolicy {
    RetryPolicy::new(
        config.max_retries,
        Duration::from_millis(config.retry_base_ms),
        Duration::from_millis(config.retry_max_ms),
    )
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls `POST {url}/v1/embeddings` with the configured model. [`new`](Self::new)
/// reads the key from `OPENAI_API_KEY`.
pub struct OpenAIProvider {
    http: HttpEmbedder,
    api_key: String,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) => key,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &EmbeddingConfig, api_key: String) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpEmbedder::new(config, DEFAULT_OPENAI_URL)?,
            api_key,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.http.model
    }

    fn dims(&self) -> usize {
        self.http.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let input = truncate_input(text, self.http.max_input_tokens);
        let body = serde_json::json!({
            "model": self.http.model,
            "input": input,
        });
        let json = self
            .http
            .post_json("OpenAI", "/v1/embeddings", Some(&self.api_key), &body)
            .await?;
        self.http.check_dims(parse_openai_response(&json)?)
    }
}

/// Extracts `data[0].embedding` from an OpenAI embeddings response.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<f32>, EmbeddingError> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .ok_or_else(|| EmbeddingError::Malformed("missing data[0].embedding".to_string()))?;
    parse_vector(embedding)
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured Ollama URL (default: `http://localhost:11434`).
/// Requires Ollama to be running with an embedding model pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    http: HttpEmbedder,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpEmbedder::new(config, DEFAULT_OLLAMA_URL)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.http.model
    }

    fn dims(&self) -> usize {
        self.http.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let input = truncate_input(text, self.http.max_input_tokens);
        let body = serde_json::json!({
            "model": self.http.model,
            "input": input,
        });
        let json = self.http.post_json("Ollama", "/api/embed", None, &body).await?;
        self.http.check_dims(parse_ollama_response(&json)?)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<f32>, EmbeddingError> {
    let embedding = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
        .ok_or_else(|| EmbeddingError::Malformed("missing embeddings[0]".to_string()))?;
    parse_vector(embedding)
}

fn parse_vector(value: &serde_json::Value) -> Result<Vec<f32>, EmbeddingError> {
    let items = value
        .as_array()
        .ok_or_else(|| EmbeddingError::Malformed("embedding is not an array".to_string()))?;
    items
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| EmbeddingError::Malformed("non-numeric embedding component".to_string()))
        })
        .collect()
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
pub fn create_provider(config: &EmbeddingConfig) -> anyhow::Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Cuts `text` to at most `max_tokens` worth of characters (4 per token),
/// always at a character boundary.
pub fn truncate_input(text: &str, max_tokens: usize) -> &str {
    let max_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Chunk embeddings are persisted as packed little-endian `f32`s, four bytes
/// per component.
///
/// ```rust
/// use docchat::embedding::{blob_to_vec, vec_to_blob};
///
/// let embedding = vec![0.25f32, -1.0];
/// let packed = vec_to_blob(&embedding);
/// assert_eq!(packed.len(), 8);
/// assert_eq!(blob_to_vec(&packed), embedding);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Inverse of [`vec_to_blob`]. Trailing bytes that do not form a whole `f32`
/// are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, or a zero vector.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let sim = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_truncate_input_char_boundary() {
        assert_eq!(truncate_input("short", 10), "short");
        assert_eq!(truncate_input("abcdefghij", 2), "abcdefgh");
        // 4 chars per token, multi-byte chars counted once each.
        assert_eq!(truncate_input("ééééé", 1), "éééé");
        assert_eq!(truncate_input("anything", 0), "");
    }

    #[test]
    fn test_parse_openai_response() {
        let json = serde_json::json!({
            "data": [{ "embedding": [0.5, -1.0, 2.0], "index": 0 }]
        });
        assert_eq!(parse_openai_response(&json).unwrap(), vec![0.5, -1.0, 2.0]);

        let bad = serde_json::json!({ "data": [] });
        assert!(matches!(
            parse_openai_response(&bad),
            Err(EmbeddingError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({ "embeddings": [[1.0, 2.0]] });
        assert_eq!(parse_ollama_response(&json).unwrap(), vec![1.0, 2.0]);

        let bad = serde_json::json!({ "embeddings": [["x"]] });
        assert!(parse_ollama_response(&bad).is_err());
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(EmbeddingError::Transient("503".into()).is_retryable());
        assert!(!EmbeddingError::Fatal("401".into()).is_retryable());
        assert!(!EmbeddingError::Malformed("x".into()).is_retryable());
    }

    #[test]
    fn test_create_provider_rejects_unknown() {
        let config = EmbeddingConfig {
            provider: "magic".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_provider(&config).is_err());
    }

    #[test]
    fn test_ollama_default_url() {
        let provider = OllamaProvider::new(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.http.url, DEFAULT_OLLAMA_URL);
        assert_eq!(provider.dims(), 1536);
    }
}
