//! Component wiring.
//!
//! [`Storage`] opens the database and blob store and is all that the
//! document-lifecycle commands need. [`App`] adds the model providers and the
//! ingestion and chat services built on them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::auth::{Authenticator, StaticTokenAuth};
use crate::chat::{ChatOrchestrator, ChatSettings};
use crate::completion::{create_chat_model, ChatModel};
use crate::config::Config;
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::ingest::{DocumentLibrary, IngestPipeline, IngestSettings};
use crate::migrate::run_migrations;
use crate::retrieval::Retriever;
use crate::storage::{BlobStore, FsBlobStore};
use crate::store::{SqliteStore, Store};

/// Persistent state: relational store plus raw document bytes.
#[derive(Clone)]
pub struct Storage {
    pub store: Arc<dyn Store>,
    pub blobs: Arc<dyn BlobStore>,
}

impl Storage {
    /// Connects to the database, applies migrations and opens the blob root.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        run_migrations(&pool).await?;
        Ok(Self {
            store: Arc::new(SqliteStore::new(pool)),
            blobs: Arc::new(FsBlobStore::from_config(&config.storage)),
        })
    }

    pub fn library(&self, config: &Config) -> DocumentLibrary {
        DocumentLibrary::new(
            self.store.clone(),
            self.blobs.clone(),
            config.ingest.max_upload_bytes,
        )
    }
}

/// Every service the CLI and HTTP server dispatch to.
#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub storage: Storage,
    pub auth: Arc<dyn Authenticator>,
    pub library: Arc<DocumentLibrary>,
    pub ingest: Arc<IngestPipeline>,
    pub retriever: Arc<Retriever>,
    pub chat: Arc<ChatOrchestrator>,
}

impl App {
    /// Opens storage and builds the configured embedding and completion
    /// providers. Fails if a provider's credentials are missing.
    pub async fn build(config: Config) -> Result<Self> {
        let storage = Storage::open(&config).await?;
        let embedder: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
        let model: Arc<dyn ChatModel> = Arc::from(create_chat_model(&config.completion)?);
        let auth: Arc<dyn Authenticator> = Arc::new(StaticTokenAuth::from_config(&config.auth));
        Ok(Self::from_parts(config, storage, embedder, model, auth))
    }

    /// Wires already-built components. Tests use this to swap in fakes.
    pub fn from_parts(
        config: Config,
        storage: Storage,
        embedder: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn ChatModel>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let retriever = Arc::new(Retriever::new(
            storage.store.clone(),
            embedder.clone(),
            config.embedding.call_budget(),
            Duration::from_secs(config.retrieval.search_timeout_secs),
        ));
        let ingest = Arc::new(IngestPipeline::new(
            storage.store.clone(),
            storage.blobs.clone(),
            embedder,
            IngestSettings::from_config(&config),
        ));
        let chat = Arc::new(ChatOrchestrator::new(
            storage.store.clone(),
            retriever.clone(),
            model,
            ChatSettings::from_config(&config),
        ));

        tracing::debug!(
            embedding = %config.embedding.provider,
            completion = %config.completion.provider,
            "application wired"
        );

        Self {
            library: Arc::new(storage.library(&config)),
            config: Arc::new(config),
            storage,
            auth,
            ingest,
            retriever,
            chat,
        }
    }
}
