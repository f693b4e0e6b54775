//! Query-time retrieval: embed the question, then search one document's
//! chunks by cosine similarity.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::embedding::EmbeddingProvider;
use crate::error::{with_timeout, Result};
use crate::store::{SearchFilter, Store};

/// One retrieved chunk, most relevant first.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub score: f32,
}

pub struct Retriever {
    store: Arc<dyn Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    embed_timeout: Duration,
    search_timeout: Duration,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        embed_timeout: Duration,
        search_timeout: Duration,
    ) -> Self {
        Self {
            store,
            embedder,
            embed_timeout,
            search_timeout,
        }
    }

    /// Deadline for embedding one query, provider retries included.
    pub fn embed_timeout(&self) -> Duration {
        self.embed_timeout
    }

    /// Top `k` chunks tagged with `file_name`. No matches is an empty vec,
    /// not an error.
    pub async fn retrieve(&self, file_name: &str, query: &str, k: usize) -> Result<Vec<RetrievedChunk>> {
        self.retrieve_filtered(&SearchFilter::by_file_name(file_name), query, k)
            .await
    }

    pub async fn retrieve_filtered(
        &self,
        filter: &SearchFilter,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self.embed_query(query).await?;
        self.search(filter, &query_vec, k).await
    }

    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        with_timeout("query embedding", self.embed_timeout, self.embedder.embed(query)).await
    }

    pub async fn search(
        &self,
        filter: &SearchFilter,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let hits = with_timeout(
            "vector search",
            self.search_timeout,
            self.store.search(query_vec, filter, k),
        )
        .await?;

        tracing::debug!(file_name = %filter.file_name, k, hits = hits.len(), "retrieved chunks");

        Ok(hits
            .into_iter()
            .map(|hit| RetrievedChunk {
                chunk_id: hit.chunk.id,
                document_id: hit.chunk.document_id,
                chunk_index: hit.chunk.chunk_index,
                content: hit.chunk.content,
                score: hit.score,
            })
            .collect())
    }

    /// Chunk texts only, in rank order.
    pub async fn retrieve_texts(&self, file_name: &str, query: &str, k: usize) -> Result<Vec<String>> {
        Ok(self
            .retrieve(file_name, query, k)
            .await?
            .into_iter()
            .map(|c| c.content)
            .collect())
    }
}
