//! Fakes and fixtures shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tempfile::TempDir;

use docchat::completion::{ChatModel, CompletionError, PromptMessage, TokenStream};
use docchat::config::{load_config, Config};
use docchat::embedding::{EmbeddingError, EmbeddingProvider};

pub const DIMS: usize = 256;

/// Deterministic embedder: character-trigram counts hashed into `DIMS`
/// buckets. Identical text always yields an identical vector, and texts that
/// share more trigrams score higher.
pub struct HashEmbedder {
    pub calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

pub fn trigram_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    let chars: Vec<char> = text.to_lowercase().chars().collect();
    for window in chars.windows(3) {
        // FNV-1a over the trigram's chars.
        let mut h: u64 = 0xcbf29ce484222325;
        for c in window {
            h ^= *c as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        v[(h % DIMS as u64) as usize] += 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "trigram-hash"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(trigram_vector(text))
    }
}

/// Fails every call whose text contains `needle`.
pub struct FailingEmbedder {
    pub needle: String,
}

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.contains(&self.needle) {
            Err(EmbeddingError::Fatal("HTTP 401: invalid api key".to_string()))
        } else {
            Ok(trigram_vector(text))
        }
    }
}

/// Streams a fixed list of tokens, one every `delay`, and records the last
/// prompt it was given. With `fail_at_end` the stream breaks after the last
/// token instead of finishing.
pub struct ScriptedModel {
    pub tokens: Vec<String>,
    pub delay: Duration,
    pub fail_at_end: bool,
    pub last_prompt: std::sync::Mutex<Vec<PromptMessage>>,
}

impl ScriptedModel {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            delay: Duration::from_millis(0),
            fail_at_end: false,
            last_prompt: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Sends `tokens`, then a stream error.
    pub fn failing_after(tokens: &[&str]) -> Self {
        Self {
            fail_at_end: true,
            ..Self::new(tokens)
        }
    }

    /// `count` numbered tokens: `"t0 "`, `"t1 "`, ...
    pub fn numbered(count: usize, delay: Duration) -> Self {
        Self {
            tokens: (0..count).map(|i| format!("t{} ", i)).collect(),
            delay,
            fail_at_end: false,
            last_prompt: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn prompt(&self) -> Vec<PromptMessage> {
        self.last_prompt.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn stream_chat(&self, messages: &[PromptMessage]) -> Result<TokenStream, CompletionError> {
        *self.last_prompt.lock().unwrap() = messages.to_vec();
        let delay = self.delay;
        let tokens = futures::stream::iter(self.tokens.clone()).then(move |token| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(token)
        });
        let failure = futures::stream::iter(
            self.fail_at_end
                .then(|| Err(CompletionError::Stream("connection reset".to_string()))),
        );
        Ok(Box::pin(tokens.chain(failure)))
    }
}

/// Writes a minimal config rooted in `tmp` and loads it.
pub fn test_config(tmp: &TempDir) -> (Config, PathBuf) {
    let root = tmp.path();
    let content = format!(
        r#"[db]
path = "{root}/data/docchat.sqlite"

[storage]
root = "{root}/blobs"
public_base_url = "http://127.0.0.1:7431/files"
signing_secret = "test-secret"

[embedding]
dims = {dims}

[server]
bind = "127.0.0.1:0"

[auth.tokens]
alice-token = "alice"
bob-token = "bob"
"#,
        root = root.display(),
        dims = DIMS,
    );
    let path = root.join("docchat.toml");
    std::fs::write(&path, content).unwrap();
    (load_config(&path).unwrap(), path)
}

/// A PDF with one page per entry of `pages`, each showing its text in
/// Helvetica.
pub fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
    let page_count = pages.len();
    let mut out = Vec::new();
    let mut offsets = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");

    // 1: catalog, 2: page tree, 3: font, then (page, contents) pairs.
    let kids: Vec<String> = (0..page_count).map(|i| format!("{} 0 R", 4 + 2 * i)).collect();

    offsets.push(out.len());
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    offsets.push(out.len());
    out.extend_from_slice(
        format!(
            "2 0 obj << /Type /Pages /Kids [{}] /Count {} >> endobj\n",
            kids.join(" "),
            page_count
        )
        .as_bytes(),
    );
    offsets.push(out.len());
    out.extend_from_slice(
        b"3 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
    );

    for (i, text) in pages.iter().enumerate() {
        let page_obj = 4 + 2 * i;
        let contents_obj = page_obj + 1;
        offsets.push(out.len());
        out.extend_from_slice(
            format!(
                "{} 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {} 0 R /Resources << /Font << /F1 3 0 R >> >> >> endobj\n",
                page_obj, contents_obj
            )
            .as_bytes(),
        );
        let stream = format!("BT /F1 12 Tf 72 700 Td ({}) Tj ET", text);
        offsets.push(out.len());
        out.extend_from_slice(
            format!(
                "{} 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
                contents_obj,
                stream.len(),
                stream
            )
            .as_bytes(),
        );
    }

    let object_count = offsets.len() + 1;
    let xref_start = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", object_count).as_bytes());
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in &offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(
        format!("trailer << /Size {} /Root 1 0 R >>\nstartxref\n", object_count).as_bytes(),
    );
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

/// `len` characters with no whitespace or punctuation, varied enough that
/// every window of a few hundred characters is distinct.
pub fn unbroken_text(len: usize) -> String {
    (0..len)
        .map(|i| (b'a' + ((i * 7 + i / 13 + i / 101) % 26) as u8) as char)
        .collect()
}

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}
