//! Storage abstraction for codescope.
//!
//! The [`Store`] trait covers everything the ingestion, analysis and chat
//! pipelines persist: snapshots with their chunks, skipped files and
//! embeddings, analysis reports, and conversation turns. The SQLite
//! backend lives in the application crate; [`memory::InMemoryStore`] backs
//! tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{CodeChunk, EmbeddingRecord, SkippedFile, Snapshot};
use crate::report::AnalysisReport;
use crate::session::ConversationTurn;

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_snapshot`](Store::insert_snapshot) | Record a new snapshot |
/// | [`update_snapshot`](Store::update_snapshot) | Persist status and statistics transitions |
/// | [`replace_chunks`](Store::replace_chunks) | Replace a snapshot's chunks and skipped files |
/// | [`replace_embeddings`](Store::replace_embeddings) | Replace a snapshot's embedding records |
/// | [`save_report`](Store::save_report) | Persist an assembled analysis report |
/// | [`append_turn`](Store::append_turn) | Append one conversation turn at the next index |
/// | [`delete_snapshot`](Store::delete_snapshot) | Remove a snapshot and everything it owns |
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    async fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>>;

    /// All snapshots, newest first.
    async fn list_snapshots(&self) -> Result<Vec<Snapshot>>;

    /// Delete a snapshot with its chunks, embeddings, reports and sessions.
    ///
    /// Returns `false` when the snapshot did not exist.
    async fn delete_snapshot(&self, id: &str) -> Result<bool>;

    /// Replace all chunks and skipped files of a snapshot.
    ///
    /// Embeddings of the snapshot are dropped as well, since they refer to
    /// the previous chunk set.
    async fn replace_chunks(
        &self,
        snapshot_id: &str,
        chunks: &[CodeChunk],
        skipped: &[SkippedFile],
    ) -> Result<()>;

    /// Chunks of a snapshot in ordinal order.
    async fn list_chunks(&self, snapshot_id: &str) -> Result<Vec<CodeChunk>>;

    async fn list_skipped(&self, snapshot_id: &str) -> Result<Vec<SkippedFile>>;

    /// Replace all embedding records of a snapshot in one step.
    async fn replace_embeddings(&self, snapshot_id: &str, records: &[EmbeddingRecord]) -> Result<()>;

    /// Embedding records of a snapshot ordered by handle.
    async fn list_embeddings(&self, snapshot_id: &str) -> Result<Vec<EmbeddingRecord>>;

    async fn save_report(&self, report: &AnalysisReport) -> Result<()>;

    /// The most recently finished report of a snapshot.
    async fn latest_report(&self, snapshot_id: &str) -> Result<Option<AnalysisReport>>;

    async fn get_report(&self, run_id: &str) -> Result<Option<AnalysisReport>>;

    /// Append a turn at the next free index of the session and return that
    /// index. `turn.index` is ignored, so concurrent writers never collide.
    async fn append_turn(&self, session_id: &str, snapshot_id: &str, turn: &ConversationTurn) -> Result<u32>;

    /// Turns of a session in index order.
    async fn list_turns(&self, session_id: &str, snapshot_id: &str) -> Result<Vec<ConversationTurn>>;

    /// Remove every turn of a session. Returns the number removed.
    async fn clear_session(&self, session_id: &str, snapshot_id: &str) -> Result<u64>;
}
