//! Query-time retrieval over a snapshot's embedding index.
//!
//! Retrieval is best-effort: a missing index, an empty index, or a query
//! that cannot be embedded all yield an empty result instead of an error,
//! so callers (agent context assembly, chat) can proceed with whatever
//! other context they have.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::embedding::Embedder;
use crate::index::{IndexRegistry, ScoredChunk};
use crate::models::{CodeChunk, Language};

/// Optional narrowing applied before the result is truncated to `k`.
#[derive(Debug, Clone, Default)]
pub struct RetrievalFilters {
    pub path_prefix: Option<String>,
    pub language: Option<Language>,
}

impl RetrievalFilters {
    pub fn matches(&self, chunk: &CodeChunk) -> bool {
        if let Some(prefix) = &self.path_prefix {
            if !chunk.path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(language) = self.language {
            if chunk.language != language {
                return false;
            }
        }
        true
    }
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    registry: Arc<IndexRegistry>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, registry: Arc<IndexRegistry>) -> Self {
        Self { embedder, registry }
    }

    pub fn registry(&self) -> &Arc<IndexRegistry> {
        &self.registry
    }

    /// Top-`k` chunks of `snapshot_id` for `query`, best first.
    ///
    /// The result never exceeds `k` and only contains chunks owned by
    /// `snapshot_id`.
    pub async fn retrieve(
        &self,
        snapshot_id: &str,
        query: &str,
        k: usize,
        filters: &RetrievalFilters,
    ) -> Vec<ScoredChunk> {
        if k == 0 || query.trim().is_empty() {
            return Vec::new();
        }
        let Some(index) = self.registry.current(snapshot_id) else {
            debug!(snapshot = snapshot_id, "no index loaded, retrieval skipped");
            return Vec::new();
        };
        if index.is_empty() {
            return Vec::new();
        }

        let vector = match self.embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(snapshot = snapshot_id, error = %e, "query embedding failed");
                return Vec::new();
            }
        };

        let mut hits = index.search(&vector, k, |chunk| {
            chunk.snapshot_id == snapshot_id && filters.matches(chunk)
        });
        hits.truncate(k);
        hits
    }

    /// Run several queries and merge the hits.
    ///
    /// Each chunk keeps its best score. The merged list is ordered by
    /// score, then chunk ordinal, and truncated to `limit`.
    pub async fn retrieve_many(
        &self,
        snapshot_id: &str,
        queries: &[String],
        k: usize,
        limit: usize,
    ) -> Vec<ScoredChunk> {
        let mut merged: Vec<ScoredChunk> = Vec::new();
        for query in queries {
            for hit in self
                .retrieve(snapshot_id, query, k, &RetrievalFilters::default())
                .await
            {
                match merged.iter_mut().find(|m| m.chunk.id == hit.chunk.id) {
                    Some(existing) if existing.score < hit.score => existing.score = hit.score,
                    Some(_) => {}
                    None => merged.push(hit),
                }
            }
        }
        merged.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.chunk.ordinal.cmp(&b.chunk.ordinal))
        });
        merged.truncate(limit);
        merged
    }
}
