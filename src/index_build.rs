//! Embedding index construction.
//!
//! A build is a producer/consumer pipeline. The producer streams chunk
//! batches over a bounded channel; the consumer embeds up to
//! `embedding.concurrency` batches at once (a `Semaphore` bounding tasks
//! in a `JoinSet`). A batch that fails is retried chunk by chunk so only
//! the offending chunks are excluded. Vectors of the wrong length count
//! as permanent failures.
//!
//! The finished index is persisted in one transaction and then swapped
//! into the [`IndexRegistry`]; until that swap, readers keep using the
//! previous index.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use codescope_core::embedding::Embedder;
use codescope_core::index::{IndexRegistry, VectorIndex};
use codescope_core::models::CodeChunk;
use codescope_core::store::Store;

use crate::progress::{ProgressEvent, ProgressReporter};

/// What a build achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOutcome {
    pub embedded: u64,
    pub failed: u64,
}

/// Result of embedding one batch.
struct BatchResult {
    pairs: Vec<(CodeChunk, Vec<f32>)>,
    failed: u64,
}

pub struct IndexBuilder {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn Store>,
    registry: Arc<IndexRegistry>,
    batch_size: usize,
    concurrency: usize,
}

impl IndexBuilder {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn Store>,
        registry: Arc<IndexRegistry>,
        batch_size: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            embedder,
            store,
            registry,
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    /// Embed `chunks`, persist the records, and swap the index in.
    pub async fn build(
        &self,
        snapshot_id: &str,
        chunks: Vec<CodeChunk>,
        progress: &dyn ProgressReporter,
    ) -> Result<BuildOutcome> {
        let total = chunks.len() as u64;

        if !self.embedder.is_enabled() {
            warn!(
                snapshot = snapshot_id,
                "embedding provider is disabled; snapshot is indexed without embeddings"
            );
            self.install(snapshot_id, Vec::new()).await?;
            return Ok(BuildOutcome::default());
        }

        let (tx, mut rx) = mpsc::channel::<Vec<CodeChunk>>(self.concurrency * 2);
        let batch_size = self.batch_size;
        let producer = tokio::spawn(async move {
            let mut iter = chunks.into_iter().peekable();
            while iter.peek().is_some() {
                let batch: Vec<CodeChunk> = iter.by_ref().take(batch_size).collect();
                if tx.send(batch).await.is_err() {
                    break;
                }
            }
        });

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<BatchResult> = JoinSet::new();
        let mut pairs = Vec::with_capacity(total as usize);
        let mut failed = 0u64;
        let mut done = 0u64;

        let mut absorb = |result: BatchResult, pairs: &mut Vec<(CodeChunk, Vec<f32>)>| {
            done += (result.pairs.len() as u64) + result.failed;
            failed += result.failed;
            pairs.extend(result.pairs);
            progress.report(ProgressEvent::Embedding { n: done, total });
        };

        while let Some(batch) = rx.recv().await {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .context("embedding semaphore closed")?;
            let embedder = Arc::clone(&self.embedder);
            tasks.spawn(async move {
                let result = embed_batch(embedder.as_ref(), batch).await;
                drop(permit);
                result
            });

            // Drain finished batches so memory stays bounded.
            while let Some(joined) = tasks.try_join_next() {
                absorb(joined.context("embedding task panicked")?, &mut pairs);
            }
        }
        while let Some(joined) = tasks.join_next().await {
            absorb(joined.context("embedding task panicked")?, &mut pairs);
        }
        producer.await.context("chunk producer panicked")?;

        let embedded = pairs.len() as u64;
        self.install(snapshot_id, pairs).await?;
        info!(snapshot = snapshot_id, embedded, failed, "index built");
        Ok(BuildOutcome { embedded, failed })
    }

    async fn install(&self, snapshot_id: &str, pairs: Vec<(CodeChunk, Vec<f32>)>) -> Result<()> {
        let index = VectorIndex::build(snapshot_id, self.embedder.model_name(), pairs)?;
        self.store
            .replace_embeddings(snapshot_id, &index.records())
            .await
            .with_context(|| format!("Failed to persist embeddings of {}", snapshot_id))?;
        self.registry.install(index);
        Ok(())
    }
}

/// Embed one batch, falling back to one chunk at a time when it fails.
async fn embed_batch(embedder: &dyn Embedder, batch: Vec<CodeChunk>) -> BatchResult {
    let dims = embedder.dims();
    let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();

    match embedder.embed_batch(&texts).await {
        Ok(vectors) if vectors.len() == batch.len() => {
            let mut result = BatchResult {
                pairs: Vec::with_capacity(batch.len()),
                failed: 0,
            };
            for (chunk, vector) in batch.into_iter().zip(vectors) {
                if vector.len() == dims {
                    result.pairs.push((chunk, vector));
                } else {
                    warn!(chunk = %chunk.location(), expected = dims, actual = vector.len(), "wrong embedding dimensions");
                    result.failed += 1;
                }
            }
            result
        }
        Ok(vectors) => {
            warn!(expected = batch.len(), actual = vectors.len(), "embedding batch size mismatch, retrying per chunk");
            embed_individually(embedder, batch).await
        }
        Err(e) if batch.len() > 1 => {
            debug!(error = %e, size = batch.len(), "embedding batch failed, retrying per chunk");
            embed_individually(embedder, batch).await
        }
        Err(e) => {
            warn!(chunk = %batch[0].location(), error = %e, "embedding failed");
            BatchResult {
                pairs: Vec::new(),
                failed: 1,
            }
        }
    }
}

async fn embed_individually(embedder: &dyn Embedder, batch: Vec<CodeChunk>) -> BatchResult {
    let dims = embedder.dims();
    let mut result = BatchResult {
        pairs: Vec::with_capacity(batch.len()),
        failed: 0,
    };
    for chunk in batch {
        match embedder.embed(&chunk.text).await {
            Ok(vector) if vector.len() == dims => result.pairs.push((chunk, vector)),
            Ok(vector) => {
                warn!(chunk = %chunk.location(), expected = dims, actual = vector.len(), "wrong embedding dimensions");
                result.failed += 1;
            }
            Err(e) => {
                warn!(chunk = %chunk.location(), error = %e, "embedding failed");
                result.failed += 1;
            }
        }
    }
    result
}

/// Load a snapshot's persisted embeddings into the registry.
///
/// Returns the number of indexed chunks.
pub async fn load_index(store: &dyn Store, registry: &IndexRegistry, snapshot_id: &str) -> Result<usize> {
    let chunks = store.list_chunks(snapshot_id).await?;
    let records = store.list_embeddings(snapshot_id).await?;
    let index = VectorIndex::from_records(snapshot_id, chunks, records)
        .with_context(|| format!("Stored embeddings of {} are inconsistent", snapshot_id))?;
    let len = index.len();
    registry.install(index);
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use async_trait::async_trait;
    use codescope_core::error::EmbeddingError;
    use codescope_core::models::Language;
    use codescope_core::store::memory::InMemoryStore;

    /// Fails any batch containing "poison"; returns 3 dims for "short".
    struct PickyEmbedder;

    #[async_trait]
    impl Embedder for PickyEmbedder {
        fn model_name(&self) -> &str {
            "picky"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if texts.iter().any(|t| t.contains("poison")) {
                return Err(EmbeddingError::permanent("rejected"));
            }
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("short") {
                        vec![1.0; 3]
                    } else {
                        vec![t.len() as f32, 1.0, 0.0, 0.0]
                    }
                })
                .collect())
        }
    }

    fn chunk(i: u32, text: &str) -> CodeChunk {
        CodeChunk {
            id: format!("c{}", i),
            snapshot_id: "s1".to_string(),
            path: format!("src/f{}.rs", i),
            language: Language::Rust,
            start_line: 1,
            end_line: 1,
            start_byte: 0,
            end_byte: text.len() as u64,
            ordinal: i,
            text: text.to_string(),
            hash: String::new(),
        }
    }

    #[tokio::test]
    async fn test_failed_chunks_are_excluded() {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(IndexRegistry::new());
        let chunks = vec![
            chunk(0, "fn a() {}"),
            chunk(1, "poison"),
            chunk(2, "fn b() {}"),
            chunk(3, "short"),
            chunk(4, "fn c() {}"),
        ];
        store.replace_chunks("s1", &chunks, &[]).await.unwrap();

        let builder = IndexBuilder::new(Arc::new(PickyEmbedder), store.clone(), registry.clone(), 2, 2);
        let outcome = builder.build("s1", chunks, &NoProgress).await.unwrap();
        assert_eq!(outcome, BuildOutcome { embedded: 3, failed: 2 });

        let records = store.list_embeddings("s1").await.unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c0", "c2", "c4"]);
        assert_eq!(registry.current("s1").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_disabled_embedder_installs_empty_index() {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(IndexRegistry::new());
        let builder = IndexBuilder::new(
            Arc::new(crate::embedding::DisabledEmbedder),
            store.clone(),
            registry.clone(),
            8,
            1,
        );
        let outcome = builder.build("s1", vec![chunk(0, "x")], &NoProgress).await.unwrap();
        assert_eq!(outcome, BuildOutcome::default());
        assert!(registry.current("s1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_index_restores_registry() {
        let store = Arc::new(InMemoryStore::new());
        let chunks = vec![chunk(0, "fn a() {}"), chunk(1, "fn b() {}")];
        store.replace_chunks("s1", &chunks, &[]).await.unwrap();
        let builder = IndexBuilder::new(
            Arc::new(PickyEmbedder),
            store.clone(),
            Arc::new(IndexRegistry::new()),
            8,
            1,
        );
        builder.build("s1", chunks, &NoProgress).await.unwrap();

        let fresh = IndexRegistry::new();
        assert_eq!(load_index(store.as_ref(), &fresh, "s1").await.unwrap(), 2);
        assert_eq!(fresh.current("s1").unwrap().model(), "picky");
    }
}
