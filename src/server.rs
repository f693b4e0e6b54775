//! HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/process-document` | Ingest an uploaded document |
//! | `POST` | `/api/chat` | Stream an answer as `text/plain` |
//! | `GET`  | `/api/documents/{id}/status` | Whether the document has chunks |
//! | `GET`  | `/api/documents/{id}/transcript` | Stored chat history |
//! | `GET`  | `/api/documents/{id}/signed-url` | Time-limited preview URL |
//! | `GET`  | `/files/{*key}` | Raw bytes behind a signed URL |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Every `/api` route requires `Authorization: Bearer <token>`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `forbidden` (403),
//! `not_found` (404), `timeout` (408), `internal` (500). Messages come from
//! [`Error::user_message`] and never carry provider or database detail.
//! `POST /api/process-document` reports pipeline failures as
//! `{"success": false, "error": "processing failed"}` with status 500.

use std::io;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::app::App;
use crate::auth::{authorize_document, bearer_token, AuthError};
use crate::chat::ChatRequest;
use crate::error::Error;
use crate::models::{Document, Role};
use crate::storage::FetchError;

/// Fragments buffered between the model stream and the HTTP body.
const STREAM_BUFFER: usize = 8;

/// Binds to `[server].bind` and serves until the process is terminated.
pub async fn run_server(app: App) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(app)).await?;
    Ok(())
}

/// All routes with CORS and request tracing applied.
pub fn router(app: App) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/process-document", post(handle_process_document))
        .route("/api/chat", post(handle_chat))
        .route("/api/documents/{id}/status", get(handle_status))
        .route("/api/documents/{id}/transcript", get(handle_transcript))
        .route("/api/documents/{id}/signed-url", get(handle_signed_url))
        .route("/files/{*key}", get(handle_file))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let (status, code) = match &err {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::Auth(AuthError::Forbidden) => (StatusCode::FORBIDDEN, "forbidden"),
            Error::Auth(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Error::Timeout { .. } => (StatusCode::REQUEST_TIMEOUT, "timeout"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!("request failed: {}", err);
        }
        // Validation messages are ours and safe to echo back.
        let message = match err {
            Error::InvalidRequest(detail) => detail,
            other => other.user_message().to_string(),
        };
        AppError {
            status,
            code,
            message,
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        Error::Auth(err).into()
    }
}

/// Resolves the bearer token in `headers` to a user id.
async fn caller(app: &App, headers: &HeaderMap) -> Result<String, AppError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let token = bearer_token(value)?;
    Ok(app.auth.authenticate(token).await?)
}

/// Loads a document the caller owns.
async fn owned_document(app: &App, user_id: &str, document_id: &str) -> Result<Document, AppError> {
    let doc = app.library.get(document_id).await?;
    authorize_document(user_id, &doc)?;
    Ok(doc)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ POST /api/process-document ============

#[derive(Deserialize)]
struct ProcessRequest {
    document_id: String,
}

#[derive(Serialize)]
struct ProcessResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
}

async fn handle_process_document(
    State(app): State<App>,
    headers: HeaderMap,
    Json(req): Json<ProcessRequest>,
) -> Result<Response, AppError> {
    let user_id = caller(&app, &headers).await?;
    if req.document_id.trim().is_empty() {
        return Err(bad_request("document_id must not be empty"));
    }
    owned_document(&app, &user_id, &req.document_id).await?;

    match app.ingest.process(&req.document_id).await {
        Ok(report) => Ok(Json(ProcessResponse {
            success: true,
            chunks: Some(report.chunks_written),
            error: None,
        })
        .into_response()),
        Err(err @ (Error::NotFound(_) | Error::Auth(_) | Error::InvalidRequest(_))) => {
            Err(err.into())
        }
        Err(err) => {
            tracing::error!(document_id = %req.document_id, "processing failed: {}", err);
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ProcessResponse {
                    success: false,
                    chunks: None,
                    error: Some("processing failed"),
                }),
            )
                .into_response())
        }
    }
}

// ============ POST /api/chat ============

#[derive(Deserialize)]
struct ChatMessage {
    role: Role,
    content: String,
}

#[derive(Deserialize)]
struct ChatBody {
    document_id: String,
    file_name: String,
    /// Only the last message is used; history comes from the store.
    messages: Vec<ChatMessage>,
}

async fn handle_chat(
    State(app): State<App>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Result<Response, AppError> {
    let user_id = caller(&app, &headers).await?;
    let message = match body.messages.last() {
        Some(m) if m.role == Role::User => m.content.clone(),
        Some(_) => return Err(bad_request("last message must have role user")),
        None => return Err(bad_request("messages must not be empty")),
    };

    let turn = app
        .chat
        .prepare(ChatRequest {
            document_id: body.document_id,
            user_id,
            file_name: body.file_name,
            message,
        })
        .await?;

    let (tx, rx) = mpsc::channel::<String>(STREAM_BUFFER);
    let (failed_tx, failed_rx) = oneshot::channel::<io::Error>();
    tokio::spawn(async move {
        if let Err(e) = turn.stream_to(tx).await {
            tracing::warn!("chat stream ended early: {}", e);
            let _ = failed_tx.send(io::Error::other(e.user_message()));
        }
    });

    // A turn that fails after the 200 went out aborts the chunked body
    // instead of ending it cleanly, so clients never take a truncated answer
    // for a complete one.
    let fragments = ReceiverStream::new(rx).map(Ok::<_, io::Error>);
    let failure = futures::stream::once(failed_rx)
        .filter_map(|outcome| async move { outcome.ok().map(Err) });
    let body = Body::from_stream(fragments.chain(failure));
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

// ============ GET /api/documents/{id}/status ============

#[derive(Serialize)]
struct StatusResponse {
    document_id: String,
    processed: bool,
    chunks: usize,
}

async fn handle_status(
    State(app): State<App>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let user_id = caller(&app, &headers).await?;
    let doc = owned_document(&app, &user_id, &id).await?;
    let chunks = app.library.chunk_count(&doc.id).await?;
    Ok(Json(StatusResponse {
        document_id: doc.id,
        processed: chunks > 0,
        chunks,
    }))
}

// ============ GET /api/documents/{id}/transcript ============

#[derive(Serialize)]
struct TranscriptTurn {
    role: Role,
    content: String,
    created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct TranscriptResponse {
    turns: Vec<TranscriptTurn>,
}

async fn handle_transcript(
    State(app): State<App>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<TranscriptResponse>, AppError> {
    let user_id = caller(&app, &headers).await?;
    let doc = owned_document(&app, &user_id, &id).await?;
    let turns = app
        .storage
        .store
        .transcript(&doc.id)
        .await
        .map_err(Error::from)?
        .into_iter()
        .map(|t| TranscriptTurn {
            role: t.role,
            content: t.content,
            created_at: t.created_at,
        })
        .collect();
    Ok(Json(TranscriptResponse { turns }))
}

// ============ GET /api/documents/{id}/signed-url ============

#[derive(Deserialize)]
struct SignedUrlQuery {
    /// Capped at `[storage].max_signed_url_ttl_secs`.
    ttl: Option<u64>,
}

#[derive(Serialize)]
struct SignedUrlResponse {
    url: String,
    expires_in: u64,
}

async fn handle_signed_url(
    State(app): State<App>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<SignedUrlQuery>,
) -> Result<Json<SignedUrlResponse>, AppError> {
    let user_id = caller(&app, &headers).await?;
    let doc = owned_document(&app, &user_id, &id).await?;
    let ttl = app.config.storage.signed_url_ttl(query.ttl);
    let url = app
        .storage
        .blobs
        .signed_url(&doc.storage_key, ttl)
        .map_err(Error::from)?;
    Ok(Json(SignedUrlResponse {
        url,
        expires_in: ttl.as_secs(),
    }))
}

// ============ GET /files/{*key} ============

#[derive(Deserialize)]
struct FileQuery {
    expires: i64,
    signature: String,
}

async fn handle_file(
    State(app): State<App>,
    Path(key): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Response, AppError> {
    if !app
        .storage
        .blobs
        .verify_signed(&key, query.expires, &query.signature)
    {
        return Err(AppError {
            status: StatusCode::FORBIDDEN,
            code: "forbidden",
            message: "invalid or expired signature".to_string(),
        });
    }
    let bytes = match app.storage.blobs.download(&key).await {
        Ok(bytes) => bytes,
        Err(FetchError::Missing(_)) => return Err(Error::NotFound(key).into()),
        Err(e) => return Err(Error::from(e).into()),
    };
    Ok(([(header::CONTENT_TYPE, "application/pdf")], bytes).into_response())
}
