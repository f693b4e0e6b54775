//! Ingestion pipeline orchestration.
//!
//! Turns an uploaded PDF into searchable chunks:
//! blob download → text extraction → chunking → embedding → storage.
//!
//! A run either writes every chunk of the document or nothing at all. Chunks
//! are embedded with bounded concurrency, and the first failure aborts the
//! run before the store is touched. Existing chunks are replaced in a single
//! transaction, so re-processing a document never leaves it half-indexed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;

use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, Config};
use crate::embedding::EmbeddingProvider;
use crate::error::{with_timeout, Error, Result};
use crate::extract::{extract_pages, join_pages, ExtractError};
use crate::models::{Chunk, ChunkMetadata, Document};
use crate::storage::{storage_key, BlobStore};
use crate::store::Store;

/// Tunables for [`IngestPipeline`].
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub chunking: ChunkingConfig,
    /// Maximum in-flight embedding calls per run.
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub extract_timeout: Duration,
    pub embed_timeout: Duration,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunking: config.chunking.clone(),
            concurrency: config.embedding.concurrency.max(1),
            fetch_timeout: Duration::from_secs(config.ingest.fetch_timeout_secs),
            extract_timeout: Duration::from_secs(config.ingest.extract_timeout_secs),
            embed_timeout: config.embedding.call_budget(),
        }
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            concurrency: 4,
            fetch_timeout: Duration::from_secs(30),
            extract_timeout: Duration::from_secs(60),
            embed_timeout: Duration::from_secs(60),
        }
    }
}

/// A new document to register.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub user_id: String,
    pub folder_id: String,
    /// Original file name; becomes the default label.
    pub file_name: String,
    pub label: Option<String>,
    pub bytes: Vec<u8>,
}

/// Outcome of a successful [`IngestPipeline::process`] run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub pages: usize,
    pub chunks_written: usize,
    /// Chunks from an earlier run that were replaced.
    pub chunks_replaced: usize,
}

/// Document lifecycle that needs no model provider: upload, status and
/// deletion.
pub struct DocumentLibrary {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    max_upload_bytes: usize,
}

impl DocumentLibrary {
    pub fn new(store: Arc<dyn Store>, blobs: Arc<dyn BlobStore>, max_upload_bytes: usize) -> Self {
        Self {
            store,
            blobs,
            max_upload_bytes,
        }
    }

    /// Stores the raw bytes and registers the document. The document stays
    /// unprocessed until [`IngestPipeline::process`] succeeds.
    pub async fn upload(&self, request: UploadRequest) -> Result<Document> {
        if request.bytes.len() > self.max_upload_bytes {
            return Err(Error::InvalidRequest(format!(
                "file is {} bytes, limit is {}",
                request.bytes.len(),
                self.max_upload_bytes
            )));
        }
        if !request.bytes.starts_with(b"%PDF-") {
            return Err(Error::InvalidRequest("only PDF files are accepted".to_string()));
        }

        let now = Utc::now();
        let doc = Document {
            id: uuid::Uuid::new_v4().to_string(),
            storage_key: storage_key(&request.user_id, &request.folder_id, &request.file_name, now),
            label: request.label.unwrap_or_else(|| request.file_name.clone()),
            user_id: request.user_id,
            folder_id: request.folder_id,
            created_at: now,
        };

        self.blobs.put(&doc.storage_key, &request.bytes).await?;
        if let Err(e) = self.store.insert_document(&doc).await {
            // Do not leave an orphaned object behind.
            if let Err(cleanup) = self.blobs.delete(&doc.storage_key).await {
                tracing::warn!("failed to remove {} after insert error: {}", doc.storage_key, cleanup);
            }
            return Err(e.into());
        }

        tracing::info!(
            document_id = %doc.id,
            storage_key = %doc.storage_key,
            bytes = request.bytes.len(),
            "document uploaded"
        );
        Ok(doc)
    }

    pub async fn get(&self, document_id: &str) -> Result<Document> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or_else(|| Error::NotFound(document_id.to_string()))
    }

    pub async fn chunk_count(&self, document_id: &str) -> Result<usize> {
        Ok(self.store.count_chunks(document_id).await?)
    }

    /// Deletes the document, its chunks, its transcript and its raw bytes.
    pub async fn delete(&self, document_id: &str) -> Result<()> {
        let doc = self.get(document_id).await?;
        self.store.delete_document(&doc.id).await?;
        self.blobs.delete(&doc.storage_key).await?;
        tracing::info!(document_id, "document deleted");
        Ok(())
    }
}

pub struct IngestPipeline {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: IngestSettings,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            store,
            blobs,
            embedder,
            settings,
        }
    }

    /// Extracts, chunks, embeds and stores `document_id`, replacing any
    /// chunks from a previous run.
    pub async fn process(&self, document_id: &str) -> Result<IngestReport> {
        let started = Instant::now();

        let doc = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| Error::NotFound(document_id.to_string()))?;

        let bytes = with_timeout(
            "document download",
            self.settings.fetch_timeout,
            self.blobs.download(&doc.storage_key),
        )
        .await?;

        let pages = self.extract(bytes).await?;
        let text = join_pages(&pages);
        let pieces = chunk_text(&text, &self.settings.chunking);
        tracing::debug!(
            document_id,
            pages = pages.len(),
            chunks = pieces.len(),
            "extracted and chunked"
        );

        let embeddings = self.embed_all(document_id, &pieces).await?;

        let now = Utc::now();
        let chunks: Vec<Chunk> = pieces
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(index, (content, embedding))| Chunk {
                id: uuid::Uuid::new_v4().to_string(),
                document_id: doc.id.clone(),
                user_id: doc.user_id.clone(),
                chunk_index: index as i64,
                content,
                embedding,
                metadata: ChunkMetadata {
                    file_name: doc.storage_key.clone(),
                },
                created_at: now,
            })
            .collect();

        let replaced = self.store.replace_chunks(&doc.id, &chunks).await?;

        tracing::info!(
            document_id,
            chunks = chunks.len(),
            replaced,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "document processed"
        );

        Ok(IngestReport {
            document_id: doc.id,
            pages: pages.len(),
            chunks_written: chunks.len(),
            chunks_replaced: replaced,
        })
    }

    /// A document is processed once it has at least one chunk.
    pub async fn is_processed(&self, document_id: &str) -> Result<bool> {
        Ok(self.store.count_chunks(document_id).await? > 0)
    }

    /// PDF parsing is CPU-bound and can panic on hostile input, so it runs on
    /// the blocking pool.
    async fn extract(&self, bytes: Vec<u8>) -> Result<Vec<String>> {
        let after = self.settings.extract_timeout;
        let task = tokio::task::spawn_blocking(move || extract_pages(&bytes));

        let joined = tokio::time::timeout(after, task)
            .await
            .map_err(|_| Error::Timeout {
                operation: "text extraction",
                after,
            })?;
        let pages = joined
            .map_err(|e| ExtractError::Pdf(format!("extraction task failed: {}", e)))??;
        Ok(pages)
    }

    /// Each in-flight call owns its inputs, so the run stays `Send` when it
    /// is driven from a spawned task or an axum handler.
    async fn embed_all(&self, document_id: &str, pieces: &[String]) -> Result<Vec<Vec<f32>>> {
        let after = self.settings.embed_timeout;

        futures::stream::iter(pieces.to_vec().into_iter().enumerate())
            .map(|(index, text)| {
                let embedder = Arc::clone(&self.embedder);
                let document_id = document_id.to_string();
                async move {
                    with_timeout("embedding", after, embedder.embed(&text))
                        .await
                        .map_err(|source| {
                            tracing::warn!(
                                document_id = %document_id,
                                chunk_index = index,
                                "embedding failed: {}",
                                source
                            );
                            Error::Processing {
                                document_id,
                                chunk_index: index,
                                source: Box::new(source),
                            }
                        })
                }
            })
            .buffered(self.settings.concurrency.max(1))
            .try_collect()
            .await
    }
}
