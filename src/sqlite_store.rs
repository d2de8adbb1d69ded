//! SQLite-backed [`Store`] implementation.
//!
//! Multi-row replacements (chunks, embeddings) run in one transaction so
//! readers never observe a half-written snapshot.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use codescope_core::embedding::{blob_to_vec, vec_to_blob};
use codescope_core::models::{
    CodeChunk, EmbeddingRecord, IndexStats, Language, SkippedFile, Snapshot, SnapshotStatus,
};
use codescope_core::report::AnalysisReport;
use codescope_core::session::ConversationTurn;
use codescope_core::store::Store;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn snapshot_from_row(row: &SqliteRow) -> Result<Snapshot> {
    let status: String = row.get("status");
    Ok(Snapshot {
        id: row.get("id"),
        source: row.get("source"),
        created_at: row.get("created_at"),
        status: status.parse::<SnapshotStatus>()?,
        file_count: row.get::<i64, _>("file_count") as u64,
        stats: IndexStats {
            chunks: row.get::<i64, _>("chunk_count") as u64,
            embedded: row.get::<i64, _>("embedded_count") as u64,
            embedding_failed: row.get::<i64, _>("embedding_failed_count") as u64,
            skipped: row.get::<i64, _>("skipped_count") as u64,
        },
        error: row.get("error"),
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<CodeChunk> {
    let language: String = row.get("language");
    Ok(CodeChunk {
        id: row.get("id"),
        snapshot_id: row.get("snapshot_id"),
        path: row.get("path"),
        language: language.parse::<Language>()?,
        start_line: row.get::<i64, _>("start_line") as u32,
        end_line: row.get::<i64, _>("end_line") as u32,
        start_byte: row.get::<i64, _>("start_byte") as u64,
        end_byte: row.get::<i64, _>("end_byte") as u64,
        ordinal: row.get::<i64, _>("ordinal") as u32,
        text: row.get("text"),
        hash: row.get("hash"),
    })
}

fn turn_from_row(row: &SqliteRow) -> Result<ConversationTurn> {
    let used: String = row.get("used_chunk_ids");
    Ok(ConversationTurn {
        index: row.get::<i64, _>("turn_index") as u32,
        question: row.get("question"),
        context_summary: row.get("context_summary"),
        answer: row.get("answer"),
        used_chunk_ids: serde_json::from_str(&used).context("corrupt used_chunk_ids column")?,
        asked_at: row.get("asked_at"),
    })
}

fn report_from_row(row: &SqliteRow) -> Result<AnalysisReport> {
    let body: String = row.get("body_json");
    serde_json::from_str(&body).context("corrupt report body")
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (id, source, created_at, status, file_count, chunk_count,
                                   embedded_count, embedding_failed_count, skipped_count, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.id)
        .bind(&snapshot.source)
        .bind(snapshot.created_at)
        .bind(snapshot.status.as_str())
        .bind(snapshot.file_count as i64)
        .bind(snapshot.stats.chunks as i64)
        .bind(snapshot.stats.embedded as i64)
        .bind(snapshot.stats.embedding_failed as i64)
        .bind(snapshot.stats.skipped as i64)
        .bind(&snapshot.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE snapshots SET
                status = ?, file_count = ?, chunk_count = ?, embedded_count = ?,
                embedding_failed_count = ?, skipped_count = ?, error = ?
            WHERE id = ?
            "#,
        )
        .bind(snapshot.status.as_str())
        .bind(snapshot.file_count as i64)
        .bind(snapshot.stats.chunks as i64)
        .bind(snapshot.stats.embedded as i64)
        .bind(snapshot.stats.embedding_failed as i64)
        .bind(snapshot.stats.skipped as i64)
        .bind(&snapshot.error)
        .bind(&snapshot.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("snapshot {} not found", snapshot.id);
        }
        Ok(())
    }

    async fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        let row = sqlx::query("SELECT * FROM snapshots WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        let rows = sqlx::query("SELECT * FROM snapshots ORDER BY created_at DESC, rowid DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn delete_snapshot(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        for table in ["embeddings", "skipped_files", "chunks", "reports", "conversation_turns"] {
            sqlx::query(&format!("DELETE FROM {} WHERE snapshot_id = ?", table))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        let result = sqlx::query("DELETE FROM snapshots WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn replace_chunks(
        &self,
        snapshot_id: &str,
        chunks: &[CodeChunk],
        skipped: &[SkippedFile],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for table in ["embeddings", "skipped_files", "chunks"] {
            sqlx::query(&format!("DELETE FROM {} WHERE snapshot_id = ?", table))
                .bind(snapshot_id)
                .execute(&mut *tx)
                .await?;
        }

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, snapshot_id, path, language, start_line, end_line,
                                    start_byte, end_byte, ordinal, text, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(snapshot_id)
            .bind(&chunk.path)
            .bind(chunk.language.as_str())
            .bind(chunk.start_line as i64)
            .bind(chunk.end_line as i64)
            .bind(chunk.start_byte as i64)
            .bind(chunk.end_byte as i64)
            .bind(chunk.ordinal as i64)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;
        }

        for file in skipped {
            sqlx::query(
                "INSERT OR REPLACE INTO skipped_files (snapshot_id, path, reason, size_bytes) VALUES (?, ?, ?, ?)",
            )
            .bind(snapshot_id)
            .bind(&file.path)
            .bind(file.reason.as_str())
            .bind(file.size_bytes as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_chunks(&self, snapshot_id: &str) -> Result<Vec<CodeChunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE snapshot_id = ? ORDER BY ordinal")
            .bind(snapshot_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn list_skipped(&self, snapshot_id: &str) -> Result<Vec<SkippedFile>> {
        let rows = sqlx::query(
            "SELECT path, reason, size_bytes FROM skipped_files WHERE snapshot_id = ? ORDER BY path",
        )
        .bind(snapshot_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let reason: String = row.get("reason");
                Ok(SkippedFile {
                    path: row.get("path"),
                    reason: reason.parse()?,
                    size_bytes: row.get::<i64, _>("size_bytes") as u64,
                })
            })
            .collect()
    }

    async fn replace_embeddings(&self, snapshot_id: &str, records: &[EmbeddingRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM embeddings WHERE snapshot_id = ?")
            .bind(snapshot_id)
            .execute(&mut *tx)
            .await?;

        for record in records {
            if record.snapshot_id != snapshot_id {
                anyhow::bail!(
                    "embedding for chunk {} belongs to snapshot {}",
                    record.chunk_id,
                    record.snapshot_id
                );
            }
            // The subselect makes the insert a no-op for chunks of other snapshots.
            let result = sqlx::query(
                r#"
                INSERT INTO embeddings (chunk_id, snapshot_id, model, dims, handle, embedding)
                SELECT id, snapshot_id, ?, ?, ?, ? FROM chunks WHERE id = ? AND snapshot_id = ?
                "#,
            )
            .bind(&record.model)
            .bind(record.vector.len() as i64)
            .bind(record.handle as i64)
            .bind(vec_to_blob(&record.vector))
            .bind(&record.chunk_id)
            .bind(snapshot_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                anyhow::bail!("embedding for unknown chunk {}", record.chunk_id);
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_embeddings(&self, snapshot_id: &str) -> Result<Vec<EmbeddingRecord>> {
        let rows = sqlx::query(
            "SELECT chunk_id, snapshot_id, model, handle, embedding FROM embeddings WHERE snapshot_id = ? ORDER BY handle",
        )
        .bind(snapshot_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                EmbeddingRecord {
                    chunk_id: row.get("chunk_id"),
                    snapshot_id: row.get("snapshot_id"),
                    model: row.get("model"),
                    handle: row.get::<i64, _>("handle") as u32,
                    vector: blob_to_vec(&blob),
                }
            })
            .collect())
    }

    async fn save_report(&self, report: &AnalysisReport) -> Result<()> {
        let body = serde_json::to_string(report)?;
        sqlx::query(
            r#"
            INSERT INTO reports (id, snapshot_id, started_at, finished_at, body_json)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                finished_at = excluded.finished_at,
                body_json = excluded.body_json
            "#,
        )
        .bind(&report.id)
        .bind(&report.snapshot_id)
        .bind(report.started_at)
        .bind(report.finished_at)
        .bind(&body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_report(&self, snapshot_id: &str) -> Result<Option<AnalysisReport>> {
        let row = sqlx::query(
            "SELECT body_json FROM reports WHERE snapshot_id = ? ORDER BY finished_at DESC, rowid DESC LIMIT 1",
        )
        .bind(snapshot_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(report_from_row).transpose()
    }

    async fn get_report(&self, run_id: &str) -> Result<Option<AnalysisReport>> {
        let row = sqlx::query("SELECT body_json FROM reports WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(report_from_row).transpose()
    }

    async fn append_turn(&self, session_id: &str, snapshot_id: &str, turn: &ConversationTurn) -> Result<u32> {
        // One statement, so the index is read and claimed under the same
        // write lock even when several processes share the database.
        let row = sqlx::query(
            r#"
            INSERT INTO conversation_turns (snapshot_id, session_id, turn_index, question,
                                            context_summary, answer, used_chunk_ids, asked_at)
            SELECT ?, ?, COALESCE(MAX(turn_index) + 1, 0), ?, ?, ?, ?, ?
            FROM conversation_turns
            WHERE snapshot_id = ? AND session_id = ?
            RETURNING turn_index
            "#,
        )
        .bind(snapshot_id)
        .bind(session_id)
        .bind(&turn.question)
        .bind(&turn.context_summary)
        .bind(&turn.answer)
        .bind(serde_json::to_string(&turn.used_chunk_ids)?)
        .bind(turn.asked_at)
        .bind(snapshot_id)
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to append a turn to session {}", session_id))?;
        Ok(row.get::<i64, _>("turn_index") as u32)
    }

    async fn list_turns(&self, session_id: &str, snapshot_id: &str) -> Result<Vec<ConversationTurn>> {
        let rows = sqlx::query(
            "SELECT * FROM conversation_turns WHERE snapshot_id = ? AND session_id = ? ORDER BY turn_index",
        )
        .bind(snapshot_id)
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(turn_from_row).collect()
    }

    async fn clear_session(&self, session_id: &str, snapshot_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM conversation_turns WHERE snapshot_id = ? AND session_id = ?")
            .bind(snapshot_id)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use codescope_core::models::SkipReason;
    use tempfile::TempDir;

    async fn store(tmp: &TempDir) -> SqliteStore {
        let config = Config::with_db(tmp.path().join("data/codescope.sqlite"));
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn chunk(snap: &str, id: &str, ordinal: u32) -> CodeChunk {
        CodeChunk {
            id: id.to_string(),
            snapshot_id: snap.to_string(),
            path: "src/lib.rs".to_string(),
            language: Language::Rust,
            start_line: 1,
            end_line: 3,
            start_byte: 0,
            end_byte: 20,
            ordinal,
            text: "fn main() {}\n".to_string(),
            hash: "abc".to_string(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let mut snap = Snapshot::pending("s1", "./repo", 42);
        store.insert_snapshot(&snap).await.unwrap();
        snap.mark_indexed(IndexStats {
            chunks: 3,
            embedded: 2,
            embedding_failed: 1,
            skipped: 4,
        });
        store.update_snapshot(&snap).await.unwrap();
        assert_eq!(store.get_snapshot("s1").await.unwrap(), Some(snap));
        assert!(store.get_snapshot("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_second_ties_resolve_to_last_inserted() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        // Ids sort the other way round from insertion.
        store.insert_snapshot(&Snapshot::pending("zzz", "./repo", 100)).await.unwrap();
        store.insert_snapshot(&Snapshot::pending("aaa", "./repo", 100)).await.unwrap();
        let ids: Vec<String> = store.list_snapshots().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["aaa", "zzz"]);

        let settings = codescope_core::analysis::AnalysisSettings::default();
        for id in ["run-z", "run-a"] {
            let report = AnalysisReport::assemble(id, "aaa", &settings, 10, 20, vec![]);
            store.save_report(&report).await.unwrap();
        }
        assert_eq!(store.latest_report("aaa").await.unwrap().unwrap().id, "run-a");
    }

    #[tokio::test]
    async fn test_chunks_skipped_and_embeddings() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        store.insert_snapshot(&Snapshot::pending("s1", "./repo", 1)).await.unwrap();
        store.insert_snapshot(&Snapshot::pending("s2", "./repo", 2)).await.unwrap();
        let skipped = SkippedFile {
            path: "big.bin".to_string(),
            reason: SkipReason::TooLarge,
            size_bytes: 9_000_000,
        };
        store
            .replace_chunks("s1", &[chunk("s1", "a", 0), chunk("s1", "b", 1)], &[skipped.clone()])
            .await
            .unwrap();
        store.replace_chunks("s2", &[chunk("s2", "c", 0)], &[]).await.unwrap();

        assert_eq!(store.list_chunks("s1").await.unwrap().len(), 2);
        assert_eq!(store.list_skipped("s1").await.unwrap(), vec![skipped]);

        let record = |chunk_id: &str, snap: &str, handle| EmbeddingRecord {
            chunk_id: chunk_id.to_string(),
            snapshot_id: snap.to_string(),
            model: "m".to_string(),
            handle,
            vector: vec![0.6, 0.8],
        };
        store
            .replace_embeddings("s1", &[record("a", "s1", 0), record("b", "s1", 1)])
            .await
            .unwrap();
        // A chunk of another snapshot is rejected and the old set survives.
        assert!(store.replace_embeddings("s1", &[record("c", "s1", 0)]).await.is_err());
        let stored = store.list_embeddings("s1").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].vector, vec![0.6, 0.8]);

        assert!(store.delete_snapshot("s1").await.unwrap());
        assert!(store.list_embeddings("s1").await.unwrap().is_empty());
        assert_eq!(store.list_chunks("s2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_turns_and_sessions() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        store.insert_snapshot(&Snapshot::pending("s1", "./repo", 1)).await.unwrap();
        let turn = ConversationTurn {
            index: 0,
            question: "where is main?".to_string(),
            context_summary: "0 turns, 1 chunks, 0 report excerpts".to_string(),
            answer: "src/main.rs".to_string(),
            used_chunk_ids: vec!["a".to_string()],
            asked_at: 5,
        };
        assert_eq!(store.append_turn("default", "s1", &turn).await.unwrap(), 0);
        assert_eq!(store.list_turns("default", "s1").await.unwrap(), vec![turn]);
        assert_eq!(store.clear_session("default", "s1").await.unwrap(), 1);
        assert!(store.list_turns("default", "s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_writers_get_distinct_turn_indexes() {
        let tmp = TempDir::new().unwrap();
        let first = store(&tmp).await;
        // A second pool on the same file stands in for another process.
        let second = store(&tmp).await;
        first.insert_snapshot(&Snapshot::pending("s1", "./repo", 1)).await.unwrap();

        // Both writers loaded the same (empty) session, so both think the
        // next index is 0.
        let stale = ConversationTurn {
            index: 0,
            question: "q".to_string(),
            context_summary: String::new(),
            answer: "a".to_string(),
            used_chunk_ids: vec![],
            asked_at: 1,
        };
        let (a, b) = tokio::join!(
            first.append_turn("default", "s1", &stale),
            second.append_turn("default", "s1", &stale)
        );
        let mut indexes = vec![a.unwrap(), b.unwrap()];
        indexes.sort();
        assert_eq!(indexes, vec![0, 1]);

        let turns = first.list_turns("default", "s1").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert!(turns.iter().all(|t| t.answer == "a"));
    }
}
