//! In-memory vector index and the per-snapshot index registry.
//!
//! A [`VectorIndex`] is immutable once built. Rebuilding a snapshot's index
//! produces a new `VectorIndex` next to the old one, and
//! [`IndexRegistry::install`] swaps it in with a single atomic pointer
//! store. Readers call [`IndexRegistry::current`] once per query and keep
//! using that `Arc` for the whole query, so they never see a half-built
//! index.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwapOption;
use thiserror::Error;

use crate::embedding::{dot, normalize};
use crate::models::{CodeChunk, EmbeddingRecord};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("chunk {chunk_id} has {actual} dimensions, index expects {expected}")]
    DimensionMismatch {
        chunk_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("chunk {chunk_id} belongs to snapshot {found}, not {expected}")]
    ForeignChunk {
        chunk_id: String,
        expected: String,
        found: String,
    },

    #[error("chunk {0} was added twice")]
    DuplicateChunk(String),
}

/// A chunk with its similarity to a query.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Arc<CodeChunk>,
    pub score: f32,
}

#[derive(Debug)]
struct IndexEntry {
    chunk: Arc<CodeChunk>,
    vector: Vec<f32>,
}

/// Brute-force cosine index over one snapshot's embedded chunks.
#[derive(Debug)]
pub struct VectorIndex {
    snapshot_id: String,
    model: String,
    dims: usize,
    /// Sorted by chunk ordinal; the position is the record handle.
    entries: Vec<IndexEntry>,
}

impl VectorIndex {
    /// Build an index from `(chunk, vector)` pairs.
    ///
    /// Vectors are L2-normalized on insertion so that scoring is a plain
    /// dot product. Every chunk must belong to `snapshot_id` and every
    /// vector must have the same length.
    pub fn build(
        snapshot_id: impl Into<String>,
        model: impl Into<String>,
        pairs: Vec<(CodeChunk, Vec<f32>)>,
    ) -> Result<Self, IndexError> {
        let snapshot_id = snapshot_id.into();
        let dims = pairs.first().map(|(_, v)| v.len()).unwrap_or(0);
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(pairs.len());

        for (chunk, mut vector) in pairs {
            if chunk.snapshot_id != snapshot_id {
                return Err(IndexError::ForeignChunk {
                    chunk_id: chunk.id,
                    expected: snapshot_id,
                    found: chunk.snapshot_id,
                });
            }
            if vector.len() != dims {
                return Err(IndexError::DimensionMismatch {
                    chunk_id: chunk.id,
                    expected: dims,
                    actual: vector.len(),
                });
            }
            if !seen.insert(chunk.id.clone()) {
                return Err(IndexError::DuplicateChunk(chunk.id));
            }
            normalize(&mut vector);
            entries.push(IndexEntry {
                chunk: Arc::new(chunk),
                vector,
            });
        }

        entries.sort_by_key(|e| e.chunk.ordinal);

        Ok(Self {
            snapshot_id,
            model: model.into(),
            dims,
            entries,
        })
    }

    /// Rebuild an index from persisted records and the snapshot's chunks.
    ///
    /// Records whose chunk is missing are ignored.
    pub fn from_records(
        snapshot_id: &str,
        chunks: Vec<CodeChunk>,
        records: Vec<EmbeddingRecord>,
    ) -> Result<Self, IndexError> {
        let model = records
            .first()
            .map(|r| r.model.clone())
            .unwrap_or_default();
        let mut by_id: HashMap<String, CodeChunk> =
            chunks.into_iter().map(|c| (c.id.clone(), c)).collect();
        let pairs = records
            .into_iter()
            .filter_map(|r| by_id.remove(&r.chunk_id).map(|c| (c, r.vector)))
            .collect();
        Self::build(snapshot_id, model, pairs)
    }

    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top-`k` `(chunk id, score)` pairs, best first, ties in chunk order.
    pub fn query(&self, vector: &[f32], k: usize) -> Vec<(String, f32)> {
        self.search(vector, k, |_| true)
            .into_iter()
            .map(|hit| (hit.chunk.id.clone(), hit.score))
            .collect()
    }

    /// Top-`k` chunks that pass `filter`, best first, ties in chunk order.
    ///
    /// The filter runs before truncation, so up to `k` matching chunks are
    /// returned even when better-scoring chunks are filtered out.
    pub fn search<F>(&self, vector: &[f32], k: usize, filter: F) -> Vec<ScoredChunk>
    where
        F: Fn(&CodeChunk) -> bool,
    {
        if k == 0 || self.entries.is_empty() || vector.len() != self.dims {
            return Vec::new();
        }
        let mut query = vector.to_vec();
        normalize(&mut query);

        let mut hits: Vec<ScoredChunk> = self
            .entries
            .iter()
            .filter(|e| filter(&e.chunk))
            .map(|e| ScoredChunk {
                chunk: Arc::clone(&e.chunk),
                score: dot(&query, &e.vector),
            })
            .collect();

        // Stable sort keeps ordinal order among equal scores.
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        hits
    }

    /// One [`EmbeddingRecord`] per entry, `handle` = position in the index.
    pub fn records(&self) -> Vec<EmbeddingRecord> {
        self.entries
            .iter()
            .enumerate()
            .map(|(handle, e)| EmbeddingRecord {
                chunk_id: e.chunk.id.clone(),
                snapshot_id: self.snapshot_id.clone(),
                model: self.model.clone(),
                handle: handle as u32,
                vector: e.vector.clone(),
            })
            .collect()
    }
}

/// Per-snapshot atomic index cells.
///
/// The map lock is only held to find or create a cell; loads and swaps
/// go through the cell's [`ArcSwapOption`] without blocking readers.
#[derive(Default)]
pub struct IndexRegistry {
    cells: RwLock<HashMap<String, Arc<ArcSwapOption<VectorIndex>>>>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, snapshot_id: &str) -> Arc<ArcSwapOption<VectorIndex>> {
        if let Ok(cells) = self.cells.read() {
            if let Some(cell) = cells.get(snapshot_id) {
                return Arc::clone(cell);
            }
        }
        let mut cells = self
            .cells
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            cells
                .entry(snapshot_id.to_string())
                .or_insert_with(|| Arc::new(ArcSwapOption::empty())),
        )
    }

    /// The index currently serving `snapshot_id`, if one was installed.
    pub fn current(&self, snapshot_id: &str) -> Option<Arc<VectorIndex>> {
        let cells = self
            .cells
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cells.get(snapshot_id).and_then(|cell| cell.load_full())
    }

    /// Atomically replace the snapshot's index. Returns the previous one.
    pub fn install(&self, index: VectorIndex) -> Option<Arc<VectorIndex>> {
        let cell = self.cell(index.snapshot_id());
        cell.swap(Some(Arc::new(index)))
    }

    /// Drop the snapshot's index. In-flight readers keep their `Arc`.
    pub fn remove(&self, snapshot_id: &str) {
        let mut cells = self
            .cells
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(cell) = cells.remove(snapshot_id) {
            cell.store(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Language;

    pub(crate) fn chunk(snapshot: &str, id: &str, ordinal: u32) -> CodeChunk {
        CodeChunk {
            id: id.to_string(),
            snapshot_id: snapshot.to_string(),
            path: format!("src/{}.rs", id),
            language: Language::Rust,
            start_line: 1,
            end_line: 1,
            start_byte: 0,
            end_byte: 1,
            ordinal,
            text: id.to_string(),
            hash: String::new(),
        }
    }

    #[test]
    fn test_query_orders_by_score() {
        let index = VectorIndex::build(
            "s",
            "m",
            vec![
                (chunk("s", "a", 0), vec![1.0, 0.0]),
                (chunk("s", "b", 1), vec![0.0, 1.0]),
                (chunk("s", "c", 2), vec![1.0, 1.0]),
            ],
        )
        .unwrap();
        let hits = index.query(&[1.0, 0.0], 3);
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ties_broken_by_ordinal() {
        let index = VectorIndex::build(
            "s",
            "m",
            vec![
                (chunk("s", "late", 5), vec![2.0, 0.0]),
                (chunk("s", "early", 1), vec![1.0, 0.0]),
                (chunk("s", "mid", 3), vec![3.0, 0.0]),
            ],
        )
        .unwrap();
        let ids: Vec<String> = index.query(&[1.0, 0.0], 3).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["early", "mid", "late"]);
    }

    #[test]
    fn test_query_respects_k_and_filter() {
        let index = VectorIndex::build(
            "s",
            "m",
            vec![
                (chunk("s", "a", 0), vec![1.0, 0.0]),
                (chunk("s", "b", 1), vec![0.9, 0.1]),
                (chunk("s", "c", 2), vec![0.1, 0.9]),
            ],
        )
        .unwrap();
        assert_eq!(index.query(&[1.0, 0.0], 2).len(), 2);
        assert!(index.query(&[1.0, 0.0], 0).is_empty());
        let hits = index.search(&[1.0, 0.0], 5, |c| c.id != "a");
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let err = VectorIndex::build(
            "s",
            "m",
            vec![
                (chunk("s", "a", 0), vec![1.0, 0.0]),
                (chunk("s", "b", 1), vec![1.0]),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_foreign_chunk_rejected() {
        let err = VectorIndex::build("s", "m", vec![(chunk("other", "a", 0), vec![1.0])]).unwrap_err();
        assert!(matches!(err, IndexError::ForeignChunk { .. }));
    }

    #[test]
    fn test_query_with_wrong_dims_is_empty() {
        let index = VectorIndex::build("s", "m", vec![(chunk("s", "a", 0), vec![1.0, 0.0])]).unwrap();
        assert!(index.query(&[1.0, 0.0, 0.0], 3).is_empty());
    }

    #[test]
    fn test_records_round_trip_through_from_records() {
        let index = VectorIndex::build(
            "s",
            "m",
            vec![
                (chunk("s", "a", 0), vec![3.0, 4.0]),
                (chunk("s", "b", 1), vec![0.0, 2.0]),
            ],
        )
        .unwrap();
        let records = index.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].handle, 1);
        assert_eq!(records[0].model, "m");

        let rebuilt = VectorIndex::from_records(
            "s",
            vec![chunk("s", "a", 0), chunk("s", "b", 1)],
            records,
        )
        .unwrap();
        assert_eq!(rebuilt.len(), 2);
        assert_eq!(rebuilt.query(&[0.0, 1.0], 1)[0].0, "b");
    }

    #[test]
    fn test_registry_swap_is_atomic_for_readers() {
        let registry = IndexRegistry::new();
        assert!(registry.current("s").is_none());

        registry.install(VectorIndex::build("s", "v1", vec![(chunk("s", "a", 0), vec![1.0])]).unwrap());
        let reader = registry.current("s").unwrap();
        assert_eq!(reader.model(), "v1");

        let previous = registry.install(
            VectorIndex::build(
                "s",
                "v2",
                vec![(chunk("s", "a", 0), vec![1.0]), (chunk("s", "b", 1), vec![1.0])],
            )
            .unwrap(),
        );
        assert_eq!(previous.unwrap().model(), "v1");
        // The reader still holds the old index; new readers see the new one.
        assert_eq!(reader.len(), 1);
        assert_eq!(registry.current("s").unwrap().len(), 2);

        registry.remove("s");
        assert!(registry.current("s").is_none());
    }
}
