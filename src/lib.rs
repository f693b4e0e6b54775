//! # docchat
//!
//! Retrieval-augmented chat over uploaded PDF documents.
//!
//! A document is uploaded once, then processed: its text is extracted,
//! split into overlapping chunks, embedded and stored. Each chat turn embeds
//! the question, retrieves the most similar chunks of that one document,
//! packs them into a bounded context and streams the model's answer back while
//! recording both sides of the conversation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────┐   ┌──────────┐
//! │  Blobs   │──▶│ Extract → Chunk → Embed  │──▶│  SQLite   │
//! │ (PDFs)   │   │     (ingest pipeline)    │   │ chunks    │
//! └──────────┘   └──────────────────────────┘   └────┬─────┘
//!                                                    │
//!        ┌───────────────────────────────────────────┘
//!        ▼
//! ┌──────────────┐   ┌───────────┐   ┌─────────────┐
//! │  Retrieval   │──▶│  Context  │──▶│ Chat model  │──▶ streamed answer
//! └──────────────┘   └───────────┘   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docchat init
//! docchat upload ./report.pdf --user alice --folder inbox
//! docchat process <document-id>
//! docchat chat <document-id> "What were the Q3 numbers?" --user alice
//! docchat serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Documents, chunks, chat turns |
//! | [`extract`] | PDF text extraction |
//! | [`chunk`] | Boundary-aware text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Vector store and transcript persistence |
//! | [`storage`] | Raw document bytes and signed URLs |
//! | [`ingest`] | Upload and ingestion pipeline |
//! | [`retrieval`] | Query embedding and similarity search |
//! | [`context`] | Context assembly under a byte budget |
//! | [`completion`] | Streaming chat-completion providers |
//! | [`chat`] | Chat turn orchestration |
//! | [`auth`] | Bearer tokens and document ownership |
//! | [`server`] | HTTP API |
//! | [`app`] | Component wiring |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod auth;
pub mod chat;
pub mod chunk;
pub mod completion;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod retrieval;
pub mod retry;
pub mod server;
pub mod storage;
pub mod store;
