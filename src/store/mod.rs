//! Storage abstraction for documents, embedded chunks and chat transcripts.
//!
//! The [`Store`] trait covers everything the ingestion pipeline and the chat
//! orchestrator persist, so both run unchanged against SQLite in production
//! ([`SqliteStore`]) and against [`InMemoryStore`] in tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::embedding::cosine_similarity;
use crate::models::{ChatTurn, Chunk, Document, ScoredChunk};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Foreign-key, uniqueness or check violation, e.g. a chunk whose
    /// document does not exist.
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// The backend could not be reached or was busy. Retried by the store.
    #[error("store unavailable: {0}")]
    Connectivity(String),
    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Connectivity(_))
    }
}

/// Restricts a vector search. Filters apply before ranking.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Exact match on the chunk's `metadata.file_name`.
    pub file_name: String,
    pub user_id: Option<String>,
    pub document_id: Option<String>,
}

impl SearchFilter {
    pub fn by_file_name(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Self::default()
        }
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        chunk.metadata.file_name == self.file_name
            && self.user_id.as_deref().map_or(true, |u| chunk.user_id == u)
            && self
                .document_id
                .as_deref()
                .map_or(true, |d| chunk.document_id == d)
    }
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_document`](Store::insert_document) | Register an uploaded document |
/// | [`get_document`](Store::get_document) | Fetch a document row |
/// | [`delete_document`](Store::delete_document) | Delete a document with its chunks and turns |
/// | [`insert_chunk`](Store::insert_chunk) | Append one embedded chunk |
/// | [`replace_chunks`](Store::replace_chunks) | Atomically swap a document's chunks |
/// | [`count_chunks`](Store::count_chunks) | Number of chunks for a document |
/// | [`list_chunks`](Store::list_chunks) | A document's chunks by index |
/// | [`search`](Store::search) | Filtered cosine-similarity search |
/// | [`append_turn`](Store::append_turn) | Persist one chat message |
/// | [`transcript`](Store::transcript) | A document's chat history, oldest first |
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_document(&self, doc: &Document) -> Result<(), StoreError>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError>;

    /// Returns `false` when no such document existed.
    async fn delete_document(&self, id: &str) -> Result<bool, StoreError>;

    /// Fails with [`StoreError::Constraint`] when the owning document is missing.
    async fn insert_chunk(&self, chunk: &Chunk) -> Result<(), StoreError>;

    /// Deletes every chunk of `document_id` and inserts `chunks`, all or
    /// nothing. Returns how many chunks were removed.
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<usize, StoreError>;

    async fn count_chunks(&self, document_id: &str) -> Result<usize, StoreError>;

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError>;

    /// Returns at most `k` chunks matching `filter`, most similar first.
    /// Equal scores keep insertion order.
    async fn search(
        &self,
        query_vec: &[f32],
        filter: &SearchFilter,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError>;

    async fn append_turn(&self, turn: &ChatTurn) -> Result<(), StoreError>;

    /// Turns ordered by `(created_at, insertion order)`.
    async fn transcript(&self, document_id: &str) -> Result<Vec<ChatTurn>, StoreError>;
}

/// Scores `candidates` (given in insertion order) against `query_vec` and
/// keeps the best `k`.
pub(crate) fn rank(query_vec: &[f32], candidates: Vec<Chunk>, k: usize) -> Vec<ScoredChunk> {
    if k == 0 {
        return Vec::new();
    }

    let mut scored: Vec<ScoredChunk> = candidates
        .into_iter()
        .map(|chunk| {
            let score = cosine_similarity(query_vec, &chunk.embedding);
            ScoredChunk { chunk, score }
        })
        .collect();

    // Stable sort: ties stay in insertion order.
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(k);
    scored
}
