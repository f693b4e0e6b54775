//! HTTP API against a live server on an ephemeral port.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tempfile::TempDir;

use common::{pdf_with_pages, test_config, HashEmbedder, ScriptedModel};
use docchat::app::{App, Storage};
use docchat::auth::StaticTokenAuth;
use docchat::ingest::UploadRequest;
use docchat::models::Document;
use docchat::server::router;

struct TestServer {
    _tmp: TempDir,
    base: String,
    app: App,
    client: reqwest::Client,
}

async fn start(model: ScriptedModel) -> TestServer {
    let tmp = TempDir::new().unwrap();
    let (config, _) = test_config(&tmp);
    let storage = Storage::open(&config).await.unwrap();
    let auth = Arc::new(StaticTokenAuth::from_config(&config.auth));
    let app = App::from_parts(
        config,
        storage,
        Arc::new(HashEmbedder::new()),
        Arc::new(model),
        auth,
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = router(app.clone());
    tokio::spawn(async move {
        axum::serve(listener, served).await.unwrap();
    });

    TestServer {
        _tmp: tmp,
        base: format!("http://{}", addr),
        app,
        client: reqwest::Client::new(),
    }
}

impl TestServer {
    async fn upload(&self, user: &str, pages: &[&str]) -> Document {
        self.app
            .library
            .upload(UploadRequest {
                user_id: user.to_string(),
                folder_id: "inbox".to_string(),
                file_name: "brief.pdf".to_string(),
                label: None,
                bytes: pdf_with_pages(pages),
            })
            .await
            .unwrap()
    }

    async fn post(&self, path: &str, token: Option<&str>, body: Value) -> reqwest::Response {
        let mut req = self.client.post(format!("{}{}", self.base, path)).json(&body);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req.send().await.unwrap()
    }

    async fn get(&self, path: &str, token: Option<&str>) -> reqwest::Response {
        let mut req = self.client.get(format!("{}{}", self.base, path));
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req.send().await.unwrap()
    }
}

#[tokio::test]
async fn test_health() {
    let server = start(ScriptedModel::new(&[])).await;
    let resp = server.get("/health", None).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_api_requires_bearer_token() {
    let server = start(ScriptedModel::new(&[])).await;
    let doc = server.upload("alice", &["hello"]).await;

    let resp = server
        .post("/api/process-document", None, json!({ "document_id": doc.id }))
        .await;
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");

    let resp = server
        .get(&format!("/api/documents/{}/status", doc.id), Some("wrong-token"))
        .await;
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_other_users_document_is_forbidden() {
    let server = start(ScriptedModel::new(&[])).await;
    let doc = server.upload("alice", &["private"]).await;

    let resp = server
        .get(&format!("/api/documents/{}/status", doc.id), Some("bob-token"))
        .await;
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "forbidden");
}

#[tokio::test]
async fn test_unknown_document_is_not_found() {
    let server = start(ScriptedModel::new(&[])).await;
    let resp = server
        .post(
            "/api/process-document",
            Some("alice-token"),
            json!({ "document_id": "does-not-exist" }),
        )
        .await;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
    assert_eq!(body["error"]["message"], "document not found");
}

#[tokio::test]
async fn test_process_then_status() {
    let server = start(ScriptedModel::new(&[])).await;
    let doc = server.upload("alice", &["Revenue grew", "Costs fell"]).await;

    let status_path = format!("/api/documents/{}/status", doc.id);
    let before: Value = server
        .get(&status_path, Some("alice-token"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(before["processed"], false);
    assert_eq!(before["chunks"], 0);

    let resp = server
        .post(
            "/api/process-document",
            Some("alice-token"),
            json!({ "document_id": doc.id }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    let chunks = body["chunks"].as_u64().unwrap();
    assert!(chunks >= 1);

    let after: Value = server
        .get(&status_path, Some("alice-token"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(after["document_id"], doc.id);
    assert_eq!(after["processed"], true);
    assert_eq!(after["chunks"].as_u64().unwrap(), chunks);
}

#[tokio::test]
async fn test_process_failure_hides_detail() {
    let server = start(ScriptedModel::new(&[])).await;
    let doc = server.upload("alice", &["soon gone"]).await;
    server
        .app
        .storage
        .blobs
        .delete(&doc.storage_key)
        .await
        .unwrap();

    let resp = server
        .post(
            "/api/process-document",
            Some("alice-token"),
            json!({ "document_id": doc.id }),
        )
        .await;
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "success": false, "error": "processing failed" }));
}

#[tokio::test]
async fn test_chat_streams_plain_text_and_records_transcript() {
    let server = start(ScriptedModel::new(&["Revenue ", "grew ", "by 12%."])).await;
    let doc = server.upload("alice", &["Revenue grew by 12% this quarter"]).await;
    server.app.ingest.process(&doc.id).await.unwrap();

    let resp = server
        .post(
            "/api/chat",
            Some("alice-token"),
            json!({
                "document_id": doc.id,
                "file_name": doc.storage_key,
                "messages": [
                    { "role": "user", "content": "ignored earlier message" },
                    { "role": "assistant", "content": "ignored reply" },
                    { "role": "user", "content": "How much did revenue grow?" }
                ]
            }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));

    let mut body = String::new();
    let mut stream = resp.bytes_stream();
    while let Some(bytes) = stream.next().await {
        body.push_str(std::str::from_utf8(&bytes.unwrap()).unwrap());
    }
    assert_eq!(body, "Revenue grew by 12%.");

    // The assistant turn is written after the last fragment is sent.
    let transcript_path = format!("/api/documents/{}/transcript", doc.id);
    let mut turns = Vec::new();
    for _ in 0..50 {
        let transcript: Value = server
            .get(&transcript_path, Some("alice-token"))
            .await
            .json()
            .await
            .unwrap();
        turns = transcript["turns"].as_array().unwrap().clone();
        if turns.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0]["role"], "user");
    assert_eq!(turns[0]["content"], "How much did revenue grow?");
    assert_eq!(turns[1]["role"], "assistant");
    assert_eq!(turns[1]["content"], "Revenue grew by 12%.");
}

#[tokio::test]
async fn test_chat_rejects_mismatched_file_name() {
    let server = start(ScriptedModel::new(&["never"])).await;
    let doc = server.upload("alice", &["content"]).await;

    let resp = server
        .post(
            "/api/chat",
            Some("alice-token"),
            json!({
                "document_id": doc.id,
                "file_name": "alice/inbox/someone-else.pdf",
                "messages": [{ "role": "user", "content": "hi" }]
            }),
        )
        .await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_chat_requires_trailing_user_message() {
    let server = start(ScriptedModel::new(&["never"])).await;
    let doc = server.upload("alice", &["content"]).await;

    let resp = server
        .post(
            "/api/chat",
            Some("alice-token"),
            json!({
                "document_id": doc.id,
                "file_name": doc.storage_key,
                "messages": []
            }),
        )
        .await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_signed_url_serves_file() {
    let server = start(ScriptedModel::new(&[])).await;
    let doc = server.upload("alice", &["preview me"]).await;

    let resp = server
        .get(
            &format!("/api/documents/{}/signed-url?ttl=120", doc.id),
            Some("alice-token"),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["expires_in"], 120);
    let url = body["url"].as_str().unwrap();
    let (_, path_and_query) = url.split_once("/files/").unwrap();

    let resp = server.get(&format!("/files/{}", path_and_query), None).await;
    assert_eq!(resp.status(), 200);
    let bytes = resp.bytes().await.unwrap();
    assert!(bytes.starts_with(b"%PDF-"));

    let tampered = path_and_query.replace("signature=", "signature=00");
    let resp = server.get(&format!("/files/{}", tampered), None).await;
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn test_broken_chat_stream_aborts_body() {
    let server = start(ScriptedModel::failing_after(&["The answer ", "is "])).await;
    let doc = server.upload("alice", &["The answer is 42"]).await;
    server.app.ingest.process(&doc.id).await.unwrap();

    let resp = server
        .post(
            "/api/chat",
            Some("alice-token"),
            json!({
                "document_id": doc.id,
                "file_name": doc.storage_key,
                "messages": [{ "role": "user", "content": "What is the answer?" }]
            }),
        )
        .await;
    assert_eq!(resp.status(), 200);

    let mut received = String::new();
    let mut transport_error = false;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => received.push_str(std::str::from_utf8(&bytes).unwrap()),
            Err(_) => {
                transport_error = true;
                break;
            }
        }
    }
    assert!(transport_error, "body ended cleanly after {:?}", received);
    assert!("The answer is ".starts_with(&received));

    let transcript: Value = server
        .get(&format!("/api/documents/{}/transcript", doc.id), Some("alice-token"))
        .await
        .json()
        .await
        .unwrap();
    let turns = transcript["turns"].as_array().unwrap();
    assert!(turns.iter().all(|t| t["role"] == "user"));
}

#[tokio::test]
async fn test_client_disconnect_cancels_turn() {
    // 100 fragments 20ms apart: about 2s to finish if nobody hangs up.
    let server = start(ScriptedModel::numbered(100, Duration::from_millis(20))).await;
    let doc = server.upload("alice", &["Long story"]).await;
    server.app.ingest.process(&doc.id).await.unwrap();

    let resp = server
        .post(
            "/api/chat",
            Some("alice-token"),
            json!({
                "document_id": doc.id,
                "file_name": doc.storage_key,
                "messages": [{ "role": "user", "content": "Tell me everything" }]
            }),
        )
        .await;
    assert_eq!(resp.status(), 200);

    let mut stream = resp.bytes_stream();
    let first = stream.next().await.unwrap().unwrap();
    assert!(first.starts_with(b"t0 "));
    drop(stream);

    // Well past the time the full answer would have taken.
    tokio::time::sleep(Duration::from_millis(3000)).await;

    let transcript: Value = server
        .get(&format!("/api/documents/{}/transcript", doc.id), Some("alice-token"))
        .await
        .json()
        .await
        .unwrap();
    let turns = transcript["turns"].as_array().unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0]["role"], "user");
}

#[tokio::test]
async fn test_signed_url_ttl_is_capped() {
    let server = start(ScriptedModel::new(&[])).await;
    let doc = server.upload("alice", &["preview me"]).await;
    let max = server.app.config.storage.max_signed_url_ttl_secs;

    for ttl in ["315360000000", "9223372036854775807", "18446744073709551615"] {
        let resp = server
            .get(
                &format!("/api/documents/{}/signed-url?ttl={}", doc.id, ttl),
                Some("alice-token"),
            )
            .await;
        assert_eq!(resp.status(), 200, "ttl {}", ttl);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["expires_in"].as_u64().unwrap(), max);

        let url = body["url"].as_str().unwrap();
        let expires: i64 = url
            .split("expires=")
            .nth(1)
            .and_then(|rest| rest.split('&').next())
            .unwrap()
            .parse()
            .unwrap();
        assert!(expires <= chrono::Utc::now().timestamp() + max as i64);
    }
}

#[tokio::test]
async fn test_query_embedding_deadline_allows_retries() {
    let server = start(ScriptedModel::new(&[])).await;
    let embedding = &server.app.config.embedding;
    assert_eq!(server.app.retriever.embed_timeout(), embedding.call_budget());
    assert!(server.app.retriever.embed_timeout() > embedding.timeout());
}
