//! Streaming chat completion.
//!
//! [`ChatModel`] opens a completion stream and yields text fragments as the
//! provider produces them:
//! - **[`OpenAIChatModel`]** calls `POST {url}/v1/chat/completions` with
//!   `stream: true` and decodes server-sent events (`data:` lines, terminated
//!   by `data: [DONE]`).
//! - **[`OllamaChatModel`]** calls `POST {url}/api/chat` and decodes NDJSON
//!   (terminated by an object with `"done": true`).
//!
//! Opening the stream is retried for transient failures (network errors,
//! 429, 5xx). Once fragments have started flowing nothing is replayed: a
//! broken or truncated stream surfaces as [`CompletionError::Stream`].

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;

use crate::config::CompletionConfig;
use crate::retry::RetryPolicy;

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("transient completion failure: {0}")]
    Transient(String),
    #[error("completion request rejected: {0}")]
    Fatal(String),
    /// The stream broke, carried an error frame or ended without its terminator.
    #[error("completion stream failed: {0}")]
    Stream(String),
    #[error("completion failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl CompletionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CompletionError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::Assistant,
            content: content.into(),
        }
    }
}

/// Text fragments in arrival order. Dropping the stream closes the
/// provider connection.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, CompletionError>> + Send>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Opens a completion stream for `messages`. Returns once the provider
    /// has accepted the request.
    async fn stream_chat(&self, messages: &[PromptMessage]) -> Result<TokenStream, CompletionError>;
}

// ============ Frame decoding ============

/// Incremental decoder for a line-oriented streaming body.
pub trait FrameDecoder {
    /// Feeds raw bytes, which may end mid-line, and returns every fragment
    /// completed by them.
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, CompletionError>;

    /// Flushes a trailing unterminated line. Fails if the stream never
    /// reached its terminator.
    fn finish(&mut self) -> Result<Vec<String>, CompletionError>;

    fn is_done(&self) -> bool;
}

/// Removes and returns every complete line in `buf`, without line endings.
fn take_lines(buf: &mut Vec<u8>) -> Result<Vec<String>, CompletionError> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = buf.drain(..=pos).collect();
        lines.push(line_to_string(raw)?);
    }
    Ok(lines)
}

fn line_to_string(raw: Vec<u8>) -> Result<String, CompletionError> {
    let line = String::from_utf8(raw)
        .map_err(|e| CompletionError::Stream(format!("invalid UTF-8 in stream: {}", e)))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Decoder for OpenAI server-sent events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Option<String>, CompletionError> {
        // Blank separators, comments and non-data fields carry no text.
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }

        let value: serde_json::Value = serde_json::from_str(data)
            .map_err(|e| CompletionError::Stream(format!("bad SSE payload: {}", e)))?;
        if let Some(err) = value.get("error") {
            return Err(CompletionError::Stream(err.to_string()));
        }

        Ok(value
            .pointer("/choices/0/delta/content")
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
            .map(str::to_string))
    }

    fn decode_lines(&mut self, lines: Vec<String>) -> Result<Vec<String>, CompletionError> {
        let mut fragments = Vec::new();
        for line in lines {
            if self.done {
                break;
            }
            if let Some(fragment) = self.decode_line(&line)? {
                fragments.push(fragment);
            }
        }
        Ok(fragments)
    }
}

impl FrameDecoder for SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, CompletionError> {
        self.buf.extend_from_slice(bytes);
        let lines = take_lines(&mut self.buf)?;
        self.decode_lines(lines)
    }

    fn finish(&mut self) -> Result<Vec<String>, CompletionError> {
        let rest = std::mem::take(&mut self.buf);
        let fragments = if rest.is_empty() {
            Vec::new()
        } else {
            let line = line_to_string(rest)?;
            self.decode_lines(vec![line])?
        };
        if !self.done {
            return Err(CompletionError::Stream(
                "stream ended before [DONE]".to_string(),
            ));
        }
        Ok(fragments)
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

/// Decoder for Ollama's newline-delimited JSON.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
    done: bool,
}

impl NdjsonDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Option<String>, CompletionError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let value: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| CompletionError::Stream(format!("bad NDJSON frame: {}", e)))?;
        if let Some(err) = value.get("error") {
            return Err(CompletionError::Stream(err.to_string()));
        }
        if value.get("done").and_then(|d| d.as_bool()) == Some(true) {
            self.done = true;
        }
        Ok(value
            .pointer("/message/content")
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
            .map(str::to_string))
    }

    fn decode_lines(&mut self, lines: Vec<String>) -> Result<Vec<String>, CompletionError> {
        let mut fragments = Vec::new();
        for line in lines {
            if self.done {
                break;
            }
            if let Some(fragment) = self.decode_line(&line)? {
                fragments.push(fragment);
            }
        }
        Ok(fragments)
    }
}

impl FrameDecoder for NdjsonDecoder {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, CompletionError> {
        self.buf.extend_from_slice(bytes);
        let lines = take_lines(&mut self.buf)?;
        self.decode_lines(lines)
    }

    fn finish(&mut self) -> Result<Vec<String>, CompletionError> {
        let rest = std::mem::take(&mut self.buf);
        let fragments = if rest.is_empty() {
            Vec::new()
        } else {
            let line = line_to_string(rest)?;
            self.decode_lines(vec![line])?
        };
        if !self.done {
            return Err(CompletionError::Stream(
                "stream ended before done frame".to_string(),
            ));
        }
        Ok(fragments)
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

struct DecodeState<S, D> {
    bytes: Pin<Box<S>>,
    decoder: D,
    pending: VecDeque<String>,
    finished: bool,
}

/// Turns a raw byte stream into a [`TokenStream`]. Reading stops at the
/// protocol terminator or the first error.
pub fn decode_stream<S, B, E, D>(bytes: S, decoder: D) -> TokenStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
    D: FrameDecoder + Send + 'static,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        decoder,
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(fragment) = st.pending.pop_front() {
                return Some((Ok(fragment), st));
            }
            if st.finished {
                return None;
            }

            match st.bytes.next().await {
                Some(Ok(chunk)) => match st.decoder.push(chunk.as_ref()) {
                    Ok(fragments) => {
                        st.pending.extend(fragments);
                        if st.decoder.is_done() {
                            st.finished = true;
                        }
                    }
                    Err(e) => {
                        st.finished = true;
                        return Some((Err(e), st));
                    }
                },
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(CompletionError::Stream(e.to_string())), st));
                }
                None => {
                    st.finished = true;
                    match st.decoder.finish() {
                        Ok(fragments) => st.pending.extend(fragments),
                        Err(e) => return Some((Err(e), st)),
                    }
                }
            }
        }
    }))
}

// ============ HTTP plumbing ============

struct HttpChat {
    client: reqwest::Client,
    model: String,
    url: String,
    temperature: Option<f32>,
    retry: RetryPolicy,
    connect_timeout: Duration,
}

impl HttpChat {
    fn new(config: &CompletionConfig, default_url: &str) -> anyhow::Result<Self> {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        // No overall timeout: a streamed answer may legitimately take minutes.
        // Silence between fragments is bounded by the orchestrator instead.
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| default_url.to_string())
                .trim_end_matches('/')
                .to_string(),
            temperature: config.temperature,
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.retry_base_ms),
                Duration::from_millis(config.retry_base_ms.saturating_mul(8)),
            ),
            connect_timeout,
        })
    }

    fn request_body(&self, messages: &[PromptMessage]) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if let Some(temperature) = self.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        body
    }

    /// Sends the request and waits for response headers, retrying transient
    /// failures. Returns the response with its body unread.
    async fn open(
        &self,
        provider: &str,
        path: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, CompletionError> {
        let endpoint = format!("{}{}", self.url, path);
        let endpoint = endpoint.as_str();
        let client = &self.client;
        let connect_timeout = self.connect_timeout;

        let what = format!("{} completion request", provider);
        self.retry
            .run(&what, CompletionError::is_retryable, move || async move {
                let mut request = client.post(endpoint).json(body);
                if let Some(token) = bearer {
                    request = request.bearer_auth(token);
                }

                let response = match tokio::time::timeout(connect_timeout, request.send()).await {
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => return Err(CompletionError::Transient(e.to_string())),
                    Err(_) => {
                        return Err(CompletionError::Transient(format!(
                            "no response within {:?}",
                            connect_timeout
                        )))
                    }
                };

                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    Err(CompletionError::Transient(format!(
                        "{} API error {}: {}",
                        provider, status, body_text
                    )))
                } else {
                    Err(CompletionError::Fatal(format!(
                        "{} API error {}: {}",
                        provider, status, body_text
                    )))
                }
            })
            .await
            .map_err(|(err, attempts)| match err {
                CompletionError::Transient(last) => CompletionError::Exhausted { attempts, last },
                other => other,
            })
    }
}

// ============ OpenAI ============

pub struct OpenAIChatModel {
    http: HttpChat,
    api_key: String,
}

impl OpenAIChatModel {
    /// Reads the key from `OPENAI_API_KEY`.
    pub fn new(config: &CompletionConfig) -> anyhow::Result<Self> {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) => key,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &CompletionConfig, api_key: String) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpChat::new(config, DEFAULT_OPENAI_URL)?,
            api_key,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAIChatModel {
    fn model_name(&self) -> &str {
        &self.http.model
    }

    async fn stream_chat(&self, messages: &[PromptMessage]) -> Result<TokenStream, CompletionError> {
        let body = self.http.request_body(messages);
        let response = self
            .http
            .open("OpenAI", "/v1/chat/completions", Some(&self.api_key), &body)
            .await?;
        Ok(decode_stream(response.bytes_stream(), SseDecoder::default()))
    }
}

// ============ Ollama ============

pub struct OllamaChatModel {
    http: HttpChat,
}

impl OllamaChatModel {
    pub fn new(config: &CompletionConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpChat::new(config, DEFAULT_OLLAMA_URL)?,
        })
    }
}

#[async_trait]
impl ChatModel for OllamaChatModel {
    fn model_name(&self) -> &str {
        &self.http.model
    }

    async fn stream_chat(&self, messages: &[PromptMessage]) -> Result<TokenStream, CompletionError> {
        let body = self.http.request_body(messages);
        let response = self.http.open("Ollama", "/api/chat", None, &body).await?;
        Ok(decode_stream(response.bytes_stream(), NdjsonDecoder::default()))
    }
}

/// Create the [`ChatModel`] named by `completion.provider` (`openai` or `ollama`).
pub fn create_chat_model(config: &CompletionConfig) -> anyhow::Result<Box<dyn ChatModel>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAIChatModel::new(config)?)),
        "ollama" => Ok(Box::new(OllamaChatModel::new(config)?)),
        other => bail!("Unknown completion provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse_frame(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
        )
    }

    #[test]
    fn test_sse_frames_split_across_reads() {
        let body = format!("{}{}data: [DONE]\n\n", sse_frame("Hel"), sse_frame("lo"));
        let bytes = body.as_bytes();
        let mut decoder = SseDecoder::default();
        let mut fragments = Vec::new();
        for piece in bytes.chunks(7) {
            fragments.extend(decoder.push(piece).unwrap());
        }
        fragments.extend(decoder.finish().unwrap());
        assert_eq!(fragments, vec!["Hel", "lo"]);
        assert!(decoder.is_done());
    }

    #[test]
    fn test_sse_ignores_role_only_and_comment_frames() {
        let mut decoder = SseDecoder::default();
        let body = ": keep-alive\n\ndata: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n";
        assert!(decoder.push(body.as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn test_sse_without_done_is_error() {
        let mut decoder = SseDecoder::default();
        assert_eq!(decoder.push(sse_frame("partial").as_bytes()).unwrap(), vec!["partial"]);
        assert!(matches!(decoder.finish(), Err(CompletionError::Stream(_))));
    }

    #[test]
    fn test_sse_error_payload() {
        let mut decoder = SseDecoder::default();
        let err = decoder
            .push(b"data: {\"error\":{\"message\":\"overloaded\"}}\n")
            .unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }

    #[test]
    fn test_ndjson_decoding() {
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hi\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\" there\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}"
        );
        let mut decoder = NdjsonDecoder::default();
        let mut fragments = Vec::new();
        for piece in body.as_bytes().chunks(5) {
            fragments.extend(decoder.push(piece).unwrap());
        }
        fragments.extend(decoder.finish().unwrap());
        assert_eq!(fragments, vec!["Hi", " there"]);
    }

    #[test]
    fn test_ndjson_truncated_is_error() {
        let mut decoder = NdjsonDecoder::default();
        decoder
            .push(b"{\"message\":{\"content\":\"Hi\"},\"done\":false}\n")
            .unwrap();
        assert!(decoder.finish().is_err());
    }

    #[tokio::test]
    async fn test_decode_stream_yields_fragments_in_order() {
        let body = format!("{}{}data: [DONE]\n\n", sse_frame("a"), sse_frame("b"));
        let pieces: Vec<Result<Vec<u8>, String>> =
            body.as_bytes().chunks(3).map(|c| Ok(c.to_vec())).collect();
        let stream = decode_stream(futures::stream::iter(pieces), SseDecoder::default());
        let out: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(out, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_decode_stream_surfaces_transport_error() {
        let pieces: Vec<Result<Vec<u8>, String>> = vec![
            Ok(sse_frame("a").into_bytes()),
            Err("connection reset".to_string()),
        ];
        let mut stream = decode_stream(futures::stream::iter(pieces), SseDecoder::default());
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(CompletionError::Stream(_))
        ));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_request_body_includes_temperature_only_when_set() {
        let mut config = CompletionConfig::default();
        let http = HttpChat::new(&config, DEFAULT_OPENAI_URL).unwrap();
        let body = http.request_body(&[PromptMessage::user("hi")]);
        assert!(body.get("temperature").is_none());
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["stream"], true);

        config.temperature = Some(0.2);
        let http = HttpChat::new(&config, DEFAULT_OPENAI_URL).unwrap();
        assert!(http.request_body(&[]).get("temperature").is_some());
    }
}
