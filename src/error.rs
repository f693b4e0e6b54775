//! Crate-level error type.
//!
//! Each component owns a narrow error enum ([`ExtractError`], [`EmbeddingError`],
//! [`StoreError`], [`FetchError`], [`AuthError`], [`CompletionError`]); the
//! pipeline and orchestrator boundaries lift them into [`Error`], which adds the
//! aggregate failures and a generic, user-safe message for each case.

use std::time::Duration;
use thiserror::Error;

use crate::auth::AuthError;
use crate::completion::CompletionError;
use crate::embedding::EmbeddingError;
use crate::extract::ExtractError;
use crate::storage::FetchError;
use crate::store::StoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("failed to fetch document bytes: {0}")]
    Fetch(#[from] FetchError),

    #[error("text extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("completion failed: {0}")]
    Completion(#[from] CompletionError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Ingestion aborted; nothing was written for the document.
    #[error("processing failed for document {document_id} at chunk {chunk_index}: {source}")]
    Processing {
        document_id: String,
        chunk_index: usize,
        #[source]
        source: Box<Error>,
    },

    /// The assistant turn could not be written after its stream completed.
    #[error("failed to persist assistant turn: {0}")]
    Persistence(#[source] StoreError),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// The message shown to end users. Never includes provider or database
    /// detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "document not found",
            Error::Auth(AuthError::Forbidden) => "forbidden",
            Error::Auth(_) => "unauthorized",
            Error::InvalidRequest(_) => "invalid request",
            Error::Processing { .. }
            | Error::Fetch(_)
            | Error::Extraction(_) => "processing failed",
            Error::Embedding(_)
            | Error::Store(_)
            | Error::Completion(_)
            | Error::Persistence(_)
            | Error::Timeout { .. } => "error processing your request",
        }
    }
}

/// Runs `fut` under `after`, mapping expiry to [`Error::Timeout`].
pub async fn with_timeout<T, E, F>(operation: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, E>>,
    E: Into<Error>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(Error::Timeout { operation, after }),
    }
}
