//! Long-lived handles shared by the commands.
//!
//! [`Services`] bundles the configuration, the persistence store, the
//! embedding and generation providers, and the per-snapshot index
//! registry. CLI commands build one from the config file; tests build one
//! from an [`InMemoryStore`](codescope_core::store::memory::InMemoryStore)
//! and mock providers.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use codescope_core::embedding::Embedder;
use codescope_core::generation::Generator;
use codescope_core::index::IndexRegistry;
use codescope_core::models::{Snapshot, SnapshotStatus};
use codescope_core::retrieve::Retriever;
use codescope_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::generation::create_generator;
use crate::index_build::{load_index, IndexBuilder};
use crate::migrate;
use crate::sqlite_store::SqliteStore;

/// Alias accepted wherever a snapshot id is expected.
pub const LATEST: &str = "latest";

pub struct Services {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub registry: Arc<IndexRegistry>,
    pub retriever: Arc<Retriever>,
}

impl Services {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        let registry = Arc::new(IndexRegistry::new());
        let retriever = Arc::new(Retriever::new(Arc::clone(&embedder), Arc::clone(&registry)));
        Self {
            config,
            store,
            embedder,
            generator,
            registry,
            retriever,
        }
    }

    /// Connect to the configured database and create the providers.
    ///
    /// The schema is applied on open, so `init` is optional.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::apply(&pool).await?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        Ok(Self::new(config, store, embedder, generator))
    }

    pub fn index_builder(&self) -> IndexBuilder {
        IndexBuilder::new(
            Arc::clone(&self.embedder),
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.config.embedding.batch_size,
            self.config.embedding.concurrency,
        )
    }

    /// Resolve an id or `latest` to a stored snapshot.
    pub async fn resolve_snapshot(&self, id: &str) -> Result<Snapshot> {
        if id == LATEST {
            return self
                .store
                .list_snapshots()
                .await?
                .into_iter()
                .find(|s| s.status == SnapshotStatus::Indexed)
                .context("No indexed snapshot yet. Run `codescope ingest <source>` first.");
        }
        self.store
            .get_snapshot(id)
            .await?
            .with_context(|| format!("Snapshot not found: {}", id))
    }

    /// Resolve a snapshot that is ready for search, analysis or chat, and
    /// make sure its index is loaded.
    pub async fn indexed_snapshot(&self, id: &str) -> Result<Snapshot> {
        let snapshot = self.resolve_snapshot(id).await?;
        match snapshot.status {
            SnapshotStatus::Indexed => {}
            SnapshotStatus::Pending => bail!("Snapshot {} is still being ingested", snapshot.id),
            SnapshotStatus::Failed => bail!(
                "Snapshot {} failed to ingest: {}",
                snapshot.id,
                snapshot.error.as_deref().unwrap_or("unknown error")
            ),
        }
        if self.registry.current(&snapshot.id).is_none() {
            load_index(self.store.as_ref(), &self.registry, &snapshot.id).await?;
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledEmbedder;
    use crate::generation::DisabledGenerator;
    use codescope_core::store::memory::InMemoryStore;

    fn services() -> Services {
        Services::new(
            Config::with_db("/tmp/unused.sqlite"),
            Arc::new(InMemoryStore::new()),
            Arc::new(DisabledEmbedder),
            Arc::new(DisabledGenerator),
        )
    }

    #[tokio::test]
    async fn test_latest_skips_failed_snapshots() {
        let services = services();
        let mut old = Snapshot::pending("old", "dir", 1);
        old.mark_indexed(Default::default());
        let mut new = Snapshot::pending("new", "dir", 2);
        new.mark_failed("boom");
        services.store.insert_snapshot(&old).await.unwrap();
        services.store.insert_snapshot(&new).await.unwrap();

        assert_eq!(services.resolve_snapshot(LATEST).await.unwrap().id, "old");
        assert_eq!(services.resolve_snapshot("new").await.unwrap().id, "new");
        assert!(services.resolve_snapshot("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_indexed_snapshot_rejects_failed() {
        let services = services();
        let mut snap = Snapshot::pending("s1", "dir", 1);
        snap.mark_failed("no files");
        services.store.insert_snapshot(&snap).await.unwrap();
        let err = services.indexed_snapshot("s1").await.unwrap_err();
        assert!(err.to_string().contains("no files"));
    }

    #[tokio::test]
    async fn test_indexed_snapshot_loads_index() {
        let services = services();
        let mut snap = Snapshot::pending("s1", "dir", 1);
        snap.mark_indexed(Default::default());
        services.store.insert_snapshot(&snap).await.unwrap();
        services.indexed_snapshot("s1").await.unwrap();
        assert!(services.registry.current("s1").is_some());
    }
}
