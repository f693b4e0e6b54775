//! In-memory [`Store`] implementation for tests and embedding in other hosts.
//!
//! All state sits behind a single `tokio::sync::RwLock`, so
//! [`replace_chunks`](Store::replace_chunks) is atomic with respect to readers.
//! Vector search is brute-force cosine similarity over the filtered chunks.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::models::{ChatTurn, Chunk, Document, ScoredChunk};

use super::{rank, SearchFilter, Store, StoreError};

#[derive(Default)]
struct Inner {
    docs: HashMap<String, Document>,
    /// Insertion order is search tie-break order.
    chunks: Vec<Chunk>,
    /// Kept in append order, which breaks `created_at` ties.
    turns: Vec<ChatTurn>,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing_document(document_id: &str) -> StoreError {
    StoreError::Constraint(format!("document {} does not exist", document_id))
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_document(&self, doc: &Document) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.docs.contains_key(&doc.id) {
            return Err(StoreError::Constraint(format!(
                "document {} already exists",
                doc.id
            )));
        }
        inner.docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.inner.read().await.docs.get(id).cloned())
    }

    async fn delete_document(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.docs.remove(id).is_none() {
            return Ok(false);
        }
        inner.chunks.retain(|c| c.document_id != id);
        inner.turns.retain(|t| t.document_id != id);
        Ok(true)
    }

    async fn insert_chunk(&self, chunk: &Chunk) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.docs.contains_key(&chunk.document_id) {
            return Err(missing_document(&chunk.document_id));
        }
        if inner
            .chunks
            .iter()
            .any(|c| c.document_id == chunk.document_id && c.chunk_index == chunk.chunk_index)
        {
            return Err(StoreError::Constraint(format!(
                "chunk {} of document {} already exists",
                chunk.chunk_index, chunk.document_id
            )));
        }
        inner.chunks.push(chunk.clone());
        Ok(())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.docs.contains_key(document_id) {
            return Err(missing_document(document_id));
        }
        if let Some(stray) = chunks.iter().find(|c| c.document_id != document_id) {
            return Err(missing_document(&stray.document_id));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = chunks.iter().find(|c| !seen.insert(c.chunk_index)) {
            return Err(StoreError::Constraint(format!(
                "chunk {} of document {} appears twice",
                dup.chunk_index, document_id
            )));
        }

        let before = inner.chunks.len();
        inner.chunks.retain(|c| c.document_id != document_id);
        let removed = before - inner.chunks.len();
        inner.chunks.extend(chunks.iter().cloned());
        Ok(removed)
    }

    async fn count_chunks(&self, document_id: &str) -> Result<usize, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .chunks
            .iter()
            .filter(|c| c.document_id == document_id)
            .count())
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let inner = self.inner.read().await;
        let mut chunks: Vec<Chunk> = inner
            .chunks
            .iter()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn search(
        &self,
        query_vec: &[f32],
        filter: &SearchFilter,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let inner = self.inner.read().await;
        let candidates: Vec<Chunk> = inner
            .chunks
            .iter()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        Ok(rank(query_vec, candidates, k))
    }

    async fn append_turn(&self, turn: &ChatTurn) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.docs.contains_key(&turn.document_id) {
            return Err(missing_document(&turn.document_id));
        }
        inner.turns.push(turn.clone());
        Ok(())
    }

    async fn transcript(&self, document_id: &str) -> Result<Vec<ChatTurn>, StoreError> {
        let inner = self.inner.read().await;
        let mut turns: Vec<ChatTurn> = inner
            .turns
            .iter()
            .filter(|t| t.document_id == document_id)
            .cloned()
            .collect();
        // Stable: equal timestamps keep append order.
        turns.sort_by_key(|t| t.created_at);
        Ok(turns)
    }
}
