//! SQLite-backed [`Store`] implementation.
//!
//! Vectors are stored as little-endian `f32` BLOBs next to the chunk text and
//! ranked in process after the SQL filter has narrowed the candidates.
//! Foreign keys with `ON DELETE CASCADE` keep chunks and chat turns tied to
//! their document; the pool must be opened with foreign keys enabled
//! ([`db::connect`](crate::db::connect) does this).
//!
//! Busy/locked databases and pool or I/O failures are retried with a short
//! backoff; constraint violations are returned as-is.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{ChatTurn, Chunk, ChunkMetadata, Document, Role, ScoredChunk};
use crate::retry::RetryPolicy;

use super::{rank, SearchFilter, Store, StoreError};

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => match db_err.kind() {
                sqlx::error::ErrorKind::UniqueViolation
                | sqlx::error::ErrorKind::ForeignKeyViolation
                | sqlx::error::ErrorKind::NotNullViolation
                | sqlx::error::ErrorKind::CheckViolation => {
                    StoreError::Constraint(db_err.message().to_string())
                }
                _ => {
                    // Extended result codes keep the primary code in the low byte.
                    let primary = db_err
                        .code()
                        .and_then(|c| c.parse::<i32>().ok())
                        .map(|c| c & 0xff);
                    match primary {
                        Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => {
                            StoreError::Connectivity(db_err.message().to_string())
                        }
                        _ => StoreError::Database(db_err.message().to_string()),
                    }
                }
            },
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connectivity(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(err.to_string())
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::new(3, Duration::from_millis(50), Duration::from_secs(1)),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn retrying<T, F, Fut>(&self, what: &str, op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.retry
            .run(what, StoreError::is_retryable, op)
            .await
            .map_err(|(err, _)| err)
    }
}

fn to_micros(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", micros)))
}

fn document_from_row(row: &SqliteRow) -> Result<Document, StoreError> {
    Ok(Document {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        folder_id: row.try_get("folder_id")?,
        storage_key: row.try_get("storage_key")?,
        label: row.try_get("label")?,
        created_at: from_micros(row.try_get("created_at")?)?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk, StoreError> {
    let metadata_json: String = row.try_get("metadata_json")?;
    let metadata: ChunkMetadata = serde_json::from_str(&metadata_json)
        .map_err(|e| StoreError::Corrupt(format!("chunk metadata: {}", e)))?;
    let blob: Vec<u8> = row.try_get("embedding")?;

    Ok(Chunk {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        user_id: row.try_get("user_id")?,
        chunk_index: row.try_get("chunk_index")?,
        content: row.try_get("content")?,
        embedding: blob_to_vec(&blob),
        metadata,
        created_at: from_micros(row.try_get("created_at")?)?,
    })
}

fn turn_from_row(row: &SqliteRow) -> Result<ChatTurn, StoreError> {
    let role: String = row.try_get("role")?;
    Ok(ChatTurn {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        document_id: row.try_get("document_id")?,
        role: role.parse::<Role>().map_err(StoreError::Corrupt)?,
        content: row.try_get("content")?,
        created_at: from_micros(row.try_get("created_at")?)?,
    })
}

const CHUNK_COLUMNS: &str =
    "id, document_id, user_id, chunk_index, content, metadata_json, embedding, created_at";

async fn insert_chunk_row<'e, E>(executor: E, chunk: &Chunk) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let metadata_json = serde_json::to_string(&chunk.metadata)
        .map_err(|e| StoreError::Corrupt(format!("chunk metadata: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO chunks (id, document_id, user_id, chunk_index, content,
                            file_name, metadata_json, embedding, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.document_id)
    .bind(&chunk.user_id)
    .bind(chunk.chunk_index)
    .bind(&chunk.content)
    .bind(&chunk.metadata.file_name)
    .bind(metadata_json)
    .bind(vec_to_blob(&chunk.embedding))
    .bind(to_micros(&chunk.created_at))
    .execute(executor)
    .await?;

    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_document(&self, doc: &Document) -> Result<(), StoreError> {
        let pool = &self.pool;
        self.retrying("insert document", move || async move {
            sqlx::query(
                r#"
                INSERT INTO documents (id, user_id, folder_id, storage_key, label, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&doc.id)
            .bind(&doc.user_id)
            .bind(&doc.folder_id)
            .bind(&doc.storage_key)
            .bind(&doc.label)
            .bind(to_micros(&doc.created_at))
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let pool = &self.pool;
        self.retrying("get document", move || async move {
            let row = sqlx::query(
                "SELECT id, user_id, folder_id, storage_key, label, created_at FROM documents WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(pool)
            .await?;
            row.as_ref().map(document_from_row).transpose()
        })
        .await
    }

    async fn delete_document(&self, id: &str) -> Result<bool, StoreError> {
        let pool = &self.pool;
        self.retrying("delete document", move || async move {
            let result = sqlx::query("DELETE FROM documents WHERE id = ?")
                .bind(id)
                .execute(pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn insert_chunk(&self, chunk: &Chunk) -> Result<(), StoreError> {
        let pool = &self.pool;
        self.retrying("insert chunk", move || async move {
            insert_chunk_row(pool, chunk).await
        })
        .await
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<usize, StoreError> {
        let pool = &self.pool;
        self.retrying("replace chunks", move || async move {
            let mut tx = pool.begin().await?;

            let exists: bool =
                sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ?")
                    .bind(document_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if !exists {
                return Err(StoreError::Constraint(format!(
                    "document {} does not exist",
                    document_id
                )));
            }

            let removed = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
                .bind(document_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();

            for chunk in chunks {
                insert_chunk_row(&mut *tx, chunk).await?;
            }

            tx.commit().await?;
            Ok(removed as usize)
        })
        .await
    }

    async fn count_chunks(&self, document_id: &str) -> Result<usize, StoreError> {
        let pool = &self.pool;
        self.retrying("count chunks", move || async move {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
                .bind(document_id)
                .fetch_one(pool)
                .await?;
            Ok(count as usize)
        })
        .await
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let pool = &self.pool;
        self.retrying("list chunks", move || async move {
            let rows = sqlx::query(&format!(
                "SELECT {} FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC",
                CHUNK_COLUMNS
            ))
            .bind(document_id)
            .fetch_all(pool)
            .await?;
            rows.iter().map(chunk_from_row).collect()
        })
        .await
    }

    async fn search(
        &self,
        query_vec: &[f32],
        filter: &SearchFilter,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let pool = &self.pool;
        let candidates = self
            .retrying("search chunks", move || async move {
                let rows = sqlx::query(&format!(
                    r#"
                    SELECT {} FROM chunks
                    WHERE file_name = ?
                      AND (? IS NULL OR user_id = ?)
                      AND (? IS NULL OR document_id = ?)
                    ORDER BY seq ASC
                    "#,
                    CHUNK_COLUMNS
                ))
                .bind(&filter.file_name)
                .bind(filter.user_id.as_deref())
                .bind(filter.user_id.as_deref())
                .bind(filter.document_id.as_deref())
                .bind(filter.document_id.as_deref())
                .fetch_all(pool)
                .await?;
                rows.iter().map(chunk_from_row).collect::<Result<Vec<_>, _>>()
            })
            .await?;

        Ok(rank(query_vec, candidates, k))
    }

    async fn append_turn(&self, turn: &ChatTurn) -> Result<(), StoreError> {
        let pool = &self.pool;
        self.retrying("append chat turn", move || async move {
            sqlx::query(
                r#"
                INSERT INTO chat_turns (id, user_id, document_id, role, content, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&turn.id)
            .bind(&turn.user_id)
            .bind(&turn.document_id)
            .bind(turn.role.as_str())
            .bind(&turn.content)
            .bind(to_micros(&turn.created_at))
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn transcript(&self, document_id: &str) -> Result<Vec<ChatTurn>, StoreError> {
        let pool = &self.pool;
        self.retrying("load transcript", move || async move {
            let rows = sqlx::query(
                r#"
                SELECT id, user_id, document_id, role, content, created_at
                FROM chat_turns
                WHERE document_id = ?
                ORDER BY created_at ASC, seq ASC
                "#,
            )
            .bind(document_id)
            .fetch_all(pool)
            .await?;
            rows.iter().map(turn_from_row).collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let options = SqliteConnectOptions::new()
            .filename(tmp.path().join("test.sqlite"))
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    fn doc(id: &str) -> Document {
        Document {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            folder_id: "folder-1".to_string(),
            storage_key: format!("user-1/{}.pdf", id),
            label: "label".to_string(),
            created_at: DateTime::from_timestamp_micros(1_700_000_000_000_000).unwrap(),
        }
    }

    fn chunk(doc: &Document, index: i64, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: format!("{}-{}", doc.id, index),
            document_id: doc.id.clone(),
            user_id: doc.user_id.clone(),
            chunk_index: index,
            content: format!("content {}", index),
            embedding,
            metadata: ChunkMetadata {
                file_name: doc.storage_key.clone(),
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_document_roundtrip() {
        let (_tmp, store) = test_store().await;
        let d = doc("a");
        store.insert_document(&d).await.unwrap();
        assert_eq!(store.get_document("a").await.unwrap(), Some(d));
        assert_eq!(store.get_document("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_chunk_without_document_is_constraint() {
        let (_tmp, store) = test_store().await;
        let err = store
            .insert_chunk(&chunk(&doc("ghost"), 0, vec![1.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_replace_and_list_chunks() {
        let (_tmp, store) = test_store().await;
        let d = doc("a");
        store.insert_document(&d).await.unwrap();

        let first = vec![chunk(&d, 0, vec![1.0, 0.0]), chunk(&d, 1, vec![0.0, 1.0])];
        assert_eq!(store.replace_chunks(&d.id, &first).await.unwrap(), 0);

        let second = vec![chunk(&d, 0, vec![0.5, 0.5])];
        let mut second = second;
        second[0].id = "replacement".to_string();
        assert_eq!(store.replace_chunks(&d.id, &second).await.unwrap(), 2);

        let listed = store.list_chunks(&d.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "replacement");
        assert_eq!(listed[0].embedding, vec![0.5, 0.5]);
        assert_eq!(listed[0].metadata.file_name, d.storage_key);
    }

    #[tokio::test]
    async fn test_replace_chunks_failure_keeps_old_chunks() {
        let (_tmp, store) = test_store().await;
        let d = doc("a");
        store.insert_document(&d).await.unwrap();
        store.replace_chunks(&d.id, &[chunk(&d, 0, vec![1.0])]).await.unwrap();

        // Duplicate chunk_index violates UNIQUE(document_id, chunk_index).
        let mut dup = vec![chunk(&d, 5, vec![1.0]), chunk(&d, 5, vec![1.0])];
        dup[1].id = "other".to_string();
        assert!(store.replace_chunks(&d.id, &dup).await.is_err());

        let listed = store.list_chunks(&d.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].chunk_index, 0);
    }

    #[tokio::test]
    async fn test_delete_cascades_to_chunks_and_turns() {
        let (_tmp, store) = test_store().await;
        let d = doc("a");
        store.insert_document(&d).await.unwrap();
        store.insert_chunk(&chunk(&d, 0, vec![1.0])).await.unwrap();
        store
            .append_turn(&ChatTurn::new(&d.user_id, &d.id, Role::User, "hello"))
            .await
            .unwrap();

        assert!(store.delete_document(&d.id).await.unwrap());
        assert_eq!(store.count_chunks(&d.id).await.unwrap(), 0);
        assert!(store.transcript(&d.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_filter_and_order() {
        let (_tmp, store) = test_store().await;
        let a = doc("a");
        let b = doc("b");
        store.insert_document(&a).await.unwrap();
        store.insert_document(&b).await.unwrap();
        store
            .replace_chunks(
                &a.id,
                &[
                    chunk(&a, 0, vec![0.0, 1.0]),
                    chunk(&a, 1, vec![1.0, 0.0]),
                    chunk(&a, 2, vec![2.0, 0.0]),
                ],
            )
            .await
            .unwrap();
        store
            .replace_chunks(&b.id, &[chunk(&b, 0, vec![1.0, 0.0])])
            .await
            .unwrap();

        let hits = store
            .search(&[1.0, 0.0], &SearchFilter::by_file_name(&a.storage_key), 10)
            .await
            .unwrap();
        let indices: Vec<i64> = hits.iter().map(|h| h.chunk.chunk_index).collect();
        // 1 and 2 tie at similarity 1.0 and keep insertion order.
        assert_eq!(indices, vec![1, 2, 0]);
        assert!(hits.iter().all(|h| h.chunk.document_id == "a"));

        let top = store
            .search(&[1.0, 0.0], &SearchFilter::by_file_name(&a.storage_key), 1)
            .await
            .unwrap();
        assert_eq!(top.len(), 1);

        let zero = store
            .search(&[1.0, 0.0], &SearchFilter::by_file_name(&a.storage_key), 0)
            .await
            .unwrap();
        assert!(zero.is_empty());
    }

    #[tokio::test]
    async fn test_transcript_orders_by_time_then_insertion() {
        let (_tmp, store) = test_store().await;
        let d = doc("a");
        store.insert_document(&d).await.unwrap();

        let ts = Utc::now();
        for (i, role) in [Role::User, Role::Assistant, Role::User].into_iter().enumerate() {
            let mut turn = ChatTurn::new(&d.user_id, &d.id, role, format!("t{}", i + 1));
            turn.created_at = ts;
            store.append_turn(&turn).await.unwrap();
        }

        let turns = store.transcript(&d.id).await.unwrap();
        let contents: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["t1", "t2", "t3"]);
        assert_eq!(turns[1].role, Role::Assistant);
    }
}
