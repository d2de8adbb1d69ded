//! In-memory [`Store`] implementation for tests.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Nothing survives
//! the process.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{CodeChunk, EmbeddingRecord, SkippedFile, Snapshot};
use crate::report::AnalysisReport;
use crate::session::ConversationTurn;

use super::Store;

#[derive(Default)]
struct Tables {
    snapshots: HashMap<String, Snapshot>,
    /// Snapshot ids in insertion order.
    inserted: Vec<String>,
    chunks: HashMap<String, Vec<CodeChunk>>,
    skipped: HashMap<String, Vec<SkippedFile>>,
    embeddings: HashMap<String, Vec<EmbeddingRecord>>,
    reports: Vec<AnalysisReport>,
    /// Keyed by (snapshot id, session id).
    turns: HashMap<(String, String), Vec<ConversationTurn>>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

fn session_key(session_id: &str, snapshot_id: &str) -> (String, String) {
    (snapshot_id.to_string(), session_id.to_string())
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut t = self.write()?;
        if t.snapshots.contains_key(&snapshot.id) {
            anyhow::bail!("snapshot {} already exists", snapshot.id);
        }
        t.snapshots.insert(snapshot.id.clone(), snapshot.clone());
        t.inserted.push(snapshot.id.clone());
        Ok(())
    }

    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut t = self.write()?;
        match t.snapshots.get_mut(&snapshot.id) {
            Some(existing) => {
                *existing = snapshot.clone();
                Ok(())
            }
            None => anyhow::bail!("snapshot {} not found", snapshot.id),
        }
    }

    async fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        Ok(self.read()?.snapshots.get(id).cloned())
    }

    async fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        let t = self.read()?;
        // Newest insertion first, then a stable sort keeps that order
        // among snapshots created in the same second.
        let mut all: Vec<Snapshot> = t
            .inserted
            .iter()
            .rev()
            .filter_map(|id| t.snapshots.get(id).cloned())
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn delete_snapshot(&self, id: &str) -> Result<bool> {
        let mut t = self.write()?;
        let existed = t.snapshots.remove(id).is_some();
        t.inserted.retain(|existing| existing != id);
        t.chunks.remove(id);
        t.skipped.remove(id);
        t.embeddings.remove(id);
        t.reports.retain(|r| r.snapshot_id != id);
        t.turns.retain(|(snap, _), _| snap != id);
        Ok(existed)
    }

    async fn replace_chunks(
        &self,
        snapshot_id: &str,
        chunks: &[CodeChunk],
        skipped: &[SkippedFile],
    ) -> Result<()> {
        let mut t = self.write()?;
        let mut sorted = chunks.to_vec();
        sorted.sort_by_key(|c| c.ordinal);
        t.chunks.insert(snapshot_id.to_string(), sorted);
        t.skipped.insert(snapshot_id.to_string(), skipped.to_vec());
        t.embeddings.remove(snapshot_id);
        Ok(())
    }

    async fn list_chunks(&self, snapshot_id: &str) -> Result<Vec<CodeChunk>> {
        Ok(self.read()?.chunks.get(snapshot_id).cloned().unwrap_or_default())
    }

    async fn list_skipped(&self, snapshot_id: &str) -> Result<Vec<SkippedFile>> {
        Ok(self.read()?.skipped.get(snapshot_id).cloned().unwrap_or_default())
    }

    async fn replace_embeddings(&self, snapshot_id: &str, records: &[EmbeddingRecord]) -> Result<()> {
        let mut t = self.write()?;
        let known = t.chunks.get(snapshot_id).map(Vec::as_slice).unwrap_or_default();
        if let Some(orphan) = records
            .iter()
            .find(|r| r.snapshot_id != snapshot_id || !known.iter().any(|c| c.id == r.chunk_id))
        {
            anyhow::bail!("embedding for unknown chunk {}", orphan.chunk_id);
        }
        let mut sorted = records.to_vec();
        sorted.sort_by_key(|r| r.handle);
        t.embeddings.insert(snapshot_id.to_string(), sorted);
        Ok(())
    }

    async fn list_embeddings(&self, snapshot_id: &str) -> Result<Vec<EmbeddingRecord>> {
        Ok(self.read()?.embeddings.get(snapshot_id).cloned().unwrap_or_default())
    }

    async fn save_report(&self, report: &AnalysisReport) -> Result<()> {
        let mut t = self.write()?;
        t.reports.retain(|r| r.id != report.id);
        t.reports.push(report.clone());
        Ok(())
    }

    async fn latest_report(&self, snapshot_id: &str) -> Result<Option<AnalysisReport>> {
        Ok(self
            .read()?
            .reports
            .iter()
            .filter(|r| r.snapshot_id == snapshot_id)
            .max_by_key(|r| r.finished_at)
            .cloned())
    }

    async fn get_report(&self, run_id: &str) -> Result<Option<AnalysisReport>> {
        Ok(self.read()?.reports.iter().find(|r| r.id == run_id).cloned())
    }

    async fn append_turn(&self, session_id: &str, snapshot_id: &str, turn: &ConversationTurn) -> Result<u32> {
        let mut t = self.write()?;
        let turns = t.turns.entry(session_key(session_id, snapshot_id)).or_default();
        let index = turns.iter().map(|existing| existing.index + 1).max().unwrap_or(0);
        turns.push(ConversationTurn {
            index,
            ..turn.clone()
        });
        Ok(index)
    }

    async fn list_turns(&self, session_id: &str, snapshot_id: &str) -> Result<Vec<ConversationTurn>> {
        let mut turns = self
            .read()?
            .turns
            .get(&session_key(session_id, snapshot_id))
            .cloned()
            .unwrap_or_default();
        turns.sort_by_key(|t| t.index);
        Ok(turns)
    }

    async fn clear_session(&self, session_id: &str, snapshot_id: &str) -> Result<u64> {
        let removed = self.write()?.turns.remove(&session_key(session_id, snapshot_id));
        Ok(removed.map(|t| t.len() as u64).unwrap_or(0))
    }
}
