//! Snapshot ingestion and re-indexing.
//!
//! `ingest` drives one source through the full build phase:
//! source → file tree → chunker → store → embedding index. A new snapshot
//! row is written as `pending` first so a failed run still leaves a
//! `failed` snapshot with its error for `codescope status`.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use codescope_core::chunk::chunk_tree;
use codescope_core::error::IngestionError;
use codescope_core::models::{IndexStats, Snapshot};

use crate::progress::{ProgressEvent, ProgressReporter};
use crate::services::Services;
use crate::source::{load_tree, SourceRef};

/// Ingest `source` into a new snapshot and index it.
///
/// Per-file problems (binary, oversized, undecodable) are recorded as
/// skipped files. The run fails only when the source cannot be read or no
/// file yields a chunk; the snapshot is then marked `failed`.
pub async fn ingest(
    services: &Services,
    source: SourceRef,
    progress: &dyn ProgressReporter,
) -> Result<Snapshot> {
    let mut snapshot = Snapshot::pending(
        Uuid::new_v4().to_string(),
        source.display(),
        Utc::now().timestamp(),
    );
    services.store.insert_snapshot(&snapshot).await?;
    info!(snapshot = %snapshot.id, source = %snapshot.source, "ingest started");

    match build_snapshot(services, &mut snapshot, source, progress).await {
        Ok(()) => {
            services.store.update_snapshot(&snapshot).await?;
            info!(
                snapshot = %snapshot.id,
                chunks = snapshot.stats.chunks,
                embedded = snapshot.stats.embedded,
                failed = snapshot.stats.embedding_failed,
                skipped = snapshot.stats.skipped,
                "ingest finished"
            );
            Ok(snapshot)
        }
        Err(e) => {
            snapshot.mark_failed(format!("{:#}", e));
            services.store.update_snapshot(&snapshot).await?;
            warn!(snapshot = %snapshot.id, error = %format!("{:#}", e), "ingest failed");
            Err(e)
        }
    }
}

async fn build_snapshot(
    services: &Services,
    snapshot: &mut Snapshot,
    source: SourceRef,
    progress: &dyn ProgressReporter,
) -> Result<()> {
    progress.report(ProgressEvent::Loading {
        source: snapshot.source.clone(),
    });

    let config = services.config.clone();
    let tree = tokio::task::spawn_blocking(move || load_tree(&source, &config))
        .await
        .context("source loader panicked")??;
    snapshot.file_count = tree.len() as u64;
    progress.report(ProgressEvent::Chunking {
        files: snapshot.file_count,
    });

    let snapshot_id = snapshot.id.clone();
    let chunker = services.config.chunking.chunker();
    let set = tokio::task::spawn_blocking(move || chunk_tree(&snapshot_id, &tree, &chunker))
        .await
        .context("chunker panicked")?;

    for error in &set.errors {
        warn!(snapshot = %snapshot.id, %error, "file skipped");
    }
    if set.chunks.is_empty() {
        return Err(IngestionError::NoUsableFiles {
            source_ref: snapshot.source.clone(),
        }
        .into());
    }
    info!(
        snapshot = %snapshot.id,
        files = set.chunked_files(),
        chunks = set.chunks.len(),
        skipped = set.skipped.len(),
        "chunked"
    );

    services
        .store
        .replace_chunks(&snapshot.id, &set.chunks, &set.skipped)
        .await?;

    let chunks = set.chunks.len() as u64;
    let skipped = set.skipped.len() as u64;
    let outcome = services
        .index_builder()
        .build(&snapshot.id, set.chunks, progress)
        .await?;

    snapshot.mark_indexed(IndexStats {
        chunks,
        embedded: outcome.embedded,
        embedding_failed: outcome.failed,
        skipped,
    });
    Ok(())
}

/// Re-embed an indexed snapshot's stored chunks and swap the new index in.
///
/// Retrieval keeps using the previous index until the swap.
pub async fn reindex(
    services: &Services,
    snapshot_id: &str,
    progress: &dyn ProgressReporter,
) -> Result<Snapshot> {
    let mut snapshot = services.indexed_snapshot(snapshot_id).await?;
    let chunks = services.store.list_chunks(&snapshot.id).await?;
    let total = chunks.len() as u64;

    let outcome = services
        .index_builder()
        .build(&snapshot.id, chunks, progress)
        .await?;

    let stats = IndexStats {
        chunks: total,
        embedded: outcome.embedded,
        embedding_failed: outcome.failed,
        skipped: snapshot.stats.skipped,
    };
    snapshot.mark_indexed(stats);
    services.store.update_snapshot(&snapshot).await?;
    info!(
        snapshot = %snapshot.id,
        embedded = outcome.embedded,
        failed = outcome.failed,
        "reindex finished"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::DisabledEmbedder;
    use crate::generation::DisabledGenerator;
    use crate::progress::NoProgress;
    use codescope_core::models::SnapshotStatus;
    use codescope_core::store::memory::InMemoryStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn services(dir: &TempDir) -> Services {
        Services::new(
            Config::with_db(dir.path().join("db.sqlite")),
            Arc::new(InMemoryStore::new()),
            Arc::new(DisabledEmbedder),
            Arc::new(DisabledGenerator),
        )
    }

    #[tokio::test]
    async fn test_ingest_directory_without_embeddings() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(repo.join("src")).unwrap();
        std::fs::write(repo.join("src/lib.rs"), "pub fn add(a: i32, b: i32) -> i32 { a + b }\n").unwrap();
        std::fs::write(repo.join("logo.png"), [0x89, b'P', b'N', b'G', 0, 0, 1]).unwrap();

        let services = services(&tmp);
        let snap = ingest(&services, SourceRef::Directory(repo), &NoProgress)
            .await
            .unwrap();
        assert_eq!(snap.status, SnapshotStatus::Indexed);
        assert_eq!(snap.stats.chunks, 1);
        assert_eq!(snap.stats.embedded, 0);
        assert_eq!(snap.stats.skipped, 1);

        let stored = services.store.get_snapshot(&snap.id).await.unwrap().unwrap();
        assert_eq!(stored, snap);
    }

    #[tokio::test]
    async fn test_ingest_without_usable_files_marks_failed() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("empty.py"), "   \n").unwrap();

        let services = services(&tmp);
        let err = ingest(&services, SourceRef::Directory(repo), &NoProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no usable files"));

        let snaps = services.store.list_snapshots().await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].status, SnapshotStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_directory_marks_failed() {
        let tmp = TempDir::new().unwrap();
        let services = services(&tmp);
        let missing = tmp.path().join("nope");
        assert!(ingest(&services, SourceRef::Directory(missing), &NoProgress)
            .await
            .is_err());
        let snaps = services.store.list_snapshots().await.unwrap();
        assert_eq!(snaps[0].status, SnapshotStatus::Failed);
        assert!(snaps[0].error.as_deref().unwrap().contains("source unavailable"));
    }
}
