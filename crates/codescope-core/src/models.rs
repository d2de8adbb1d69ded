//! Core data models shared by every stage of the pipeline.
//!
//! - [`FileTree`] / [`SourceFile`]: raw repository contents handed to the chunker.
//! - [`Snapshot`]: one ingested copy of a repository and its index statistics.
//! - [`CodeChunk`]: the atomic retrieval and embedding unit.
//! - [`SkippedFile`]: a file the chunker declined to process, with the reason.
//! - [`EmbeddingRecord`]: the persisted vector for one chunk.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Raw bytes of one repository file, keyed by its `/`-separated relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub bytes: Vec<u8>,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            bytes: bytes.into(),
        }
    }
}

/// The file tree of a repository as produced by a source provider.
#[derive(Debug, Clone, Default)]
pub struct FileTree {
    /// Human-readable origin (directory path, archive name, or URL).
    pub origin: String,
    pub files: Vec<SourceFile>,
}

impl FileTree {
    pub fn new(origin: impl Into<String>, mut files: Vec<SourceFile>) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            origin: origin.into(),
            files,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Lifecycle status of a [`Snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Pending,
    Indexed,
    Failed,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Pending => "pending",
            SnapshotStatus::Indexed => "indexed",
            SnapshotStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SnapshotStatus::Pending),
            "indexed" => Ok(SnapshotStatus::Indexed),
            "failed" => Ok(SnapshotStatus::Failed),
            other => anyhow::bail!("unknown snapshot status: {}", other),
        }
    }
}

/// Counters describing how much of a snapshot made it into the index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub chunks: u64,
    pub embedded: u64,
    pub embedding_failed: u64,
    pub skipped: u64,
}

impl IndexStats {
    /// Fraction of chunks whose embedding failed, in `[0.0, 1.0]`.
    pub fn failure_ratio(&self) -> f64 {
        if self.chunks == 0 {
            0.0
        } else {
            self.embedding_failed as f64 / self.chunks as f64
        }
    }
}

/// One ingested, versioned copy of a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    /// Source reference the snapshot was taken from.
    pub source: String,
    /// Unix timestamp (seconds) of ingestion.
    pub created_at: i64,
    pub status: SnapshotStatus,
    pub file_count: u64,
    pub stats: IndexStats,
    /// Set when `status` is [`SnapshotStatus::Failed`].
    pub error: Option<String>,
}

impl Snapshot {
    pub fn pending(id: impl Into<String>, source: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            created_at,
            status: SnapshotStatus::Pending,
            file_count: 0,
            stats: IndexStats::default(),
            error: None,
        }
    }

    pub fn mark_indexed(&mut self, stats: IndexStats) {
        self.status = SnapshotStatus::Indexed;
        self.stats = stats;
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = SnapshotStatus::Failed;
        self.error = Some(error.into());
    }
}

/// Language tag attached to every chunk, derived from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Java,
    Kotlin,
    Swift,
    Ruby,
    C,
    Cpp,
    Solidity,
    Markdown,
    Html,
    Latex,
    Text,
}

impl Language {
    pub const ALL: [Language; 16] = [
        Language::Rust,
        Language::Python,
        Language::JavaScript,
        Language::TypeScript,
        Language::Go,
        Language::Java,
        Language::Kotlin,
        Language::Swift,
        Language::Ruby,
        Language::C,
        Language::Cpp,
        Language::Solidity,
        Language::Markdown,
        Language::Html,
        Language::Latex,
        Language::Text,
    ];

    /// Classify a path by its extension. Unknown extensions map to [`Language::Text`].
    pub fn from_path(path: &str) -> Language {
        let ext = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "rs" => Language::Rust,
            "py" | "pyi" | "ipynb" => Language::Python,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "tsx" => Language::TypeScript,
            "go" => Language::Go,
            "java" => Language::Java,
            "kt" | "kts" => Language::Kotlin,
            "swift" => Language::Swift,
            "rb" => Language::Ruby,
            "c" | "h" => Language::C,
            "cc" | "cpp" | "cxx" | "hpp" | "hh" => Language::Cpp,
            "sol" => Language::Solidity,
            "md" | "markdown" => Language::Markdown,
            "html" | "htm" => Language::Html,
            "tex" => Language::Latex,
            _ => Language::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Rust => "rust",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Go => "go",
            Language::Java => "java",
            Language::Kotlin => "kotlin",
            Language::Swift => "swift",
            Language::Ruby => "ruby",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Solidity => "solidity",
            Language::Markdown => "markdown",
            Language::Html => "html",
            Language::Latex => "latex",
            Language::Text => "text",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Language::ALL
            .iter()
            .copied()
            .find(|lang| lang.as_str() == lower)
            .ok_or_else(|| anyhow::anyhow!("unknown language: {}", s))
    }
}

/// A bounded unit of source text used for embedding and retrieval.
///
/// Chunks are created by [`crate::chunk::chunk_tree`] and never mutated.
/// `ordinal` is the chunk's position in the chunker's output for its
/// snapshot and doubles as the stable tie-breaker for similarity ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeChunk {
    pub id: String,
    pub snapshot_id: String,
    pub path: String,
    pub language: Language,
    /// 1-based, inclusive.
    pub start_line: u32,
    /// 1-based, inclusive.
    pub end_line: u32,
    pub start_byte: u64,
    pub end_byte: u64,
    pub ordinal: u32,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

impl CodeChunk {
    /// `path:Lstart-end`, used in prompts and CLI output.
    pub fn location(&self) -> String {
        format!("{}:L{}-{}", self.path, self.start_line, self.end_line)
    }
}

/// Why the chunker passed over a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Binary,
    TooLarge,
    UnsupportedEncoding,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Binary => "binary",
            SkipReason::TooLarge => "too_large",
            SkipReason::UnsupportedEncoding => "unsupported_encoding",
        }
    }
}

impl FromStr for SkipReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary" => Ok(SkipReason::Binary),
            "too_large" => Ok(SkipReason::TooLarge),
            "unsupported_encoding" => Ok(SkipReason::UnsupportedEncoding),
            other => anyhow::bail!("unknown skip reason: {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: SkipReason,
    pub size_bytes: u64,
}

/// The persisted embedding of one chunk.
///
/// `handle` is the row of the chunk's vector inside the snapshot's
/// [`crate::index::VectorIndex`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub chunk_id: String,
    pub snapshot_id: String,
    pub model: String,
    pub handle: u32,
    pub vector: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_from_path() {
        assert_eq!(Language::from_path("src/main.rs"), Language::Rust);
        assert_eq!(Language::from_path("app/models.PY"), Language::Python);
        assert_eq!(Language::from_path("web/App.tsx"), Language::TypeScript);
        assert_eq!(Language::from_path("notes/analysis.ipynb"), Language::Python);
        assert_eq!(Language::from_path("Makefile"), Language::Text);
    }

    #[test]
    fn test_language_parse_round_trip_names() {
        for lang in Language::ALL {
            assert_eq!(lang.as_str().parse::<Language>().unwrap(), lang);
        }
        assert!("cobol".parse::<Language>().is_err());
    }

    #[test]
    fn test_file_tree_sorted() {
        let tree = FileTree::new(
            "test",
            vec![SourceFile::new("b.rs", "b"), SourceFile::new("a.rs", "a")],
        );
        assert_eq!(tree.files[0].path, "a.rs");
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_failure_ratio() {
        let stats = IndexStats {
            chunks: 4,
            embedded: 3,
            embedding_failed: 1,
            skipped: 0,
        };
        assert!((stats.failure_ratio() - 0.25).abs() < 1e-9);
        assert_eq!(IndexStats::default().failure_ratio(), 0.0);
    }

    #[test]
    fn test_snapshot_transitions() {
        let mut snap = Snapshot::pending("s1", "./repo", 0);
        assert_eq!(snap.status, SnapshotStatus::Pending);
        snap.mark_failed("boom");
        assert_eq!(snap.status, SnapshotStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some("boom"));
        snap.mark_indexed(IndexStats::default());
        assert_eq!(snap.status, SnapshotStatus::Indexed);
        assert!(snap.error.is_none());
    }
}
