//! Structure-aware code chunker.
//!
//! Splits every text file of a [`FileTree`] into [`CodeChunk`]s bounded by
//! a configurable line window.
//!
//! # Algorithm
//!
//! 1. Skip files above `max_file_bytes` and binary files (a NUL byte in
//!    the first 8 KiB). Files that are not valid UTF-8 are reported as
//!    [`IngestionError::UnsupportedEncoding`] and skipped; the rest of the
//!    tree is still processed.
//! 2. When the file's language has a declaration recognizer, split the
//!    file at top-level declarations (a declaration absorbs the comment,
//!    doc, attribute and decorator lines directly above it).
//! 3. Pack consecutive segments into one chunk while the total stays
//!    within `window_lines`. A segment longer than the window is split
//!    into windows that overlap by `overlap_lines`.
//! 4. Languages without a recognizer use the overlapping window directly.
//!
//! Output order is file path, then span start. Chunk ids hash the
//! snapshot id, path and byte span, so identical trees always produce
//! identical chunks.
//!
//! # Example
//!
//! ```rust
//! use codescope_core::chunk::{chunk_tree, ChunkerConfig};
//! use codescope_core::models::{FileTree, SourceFile};
//!
//! let tree = FileTree::new("demo", vec![SourceFile::new("lib.rs", "fn a() {}\n\nfn b() {}\n")]);
//! let set = chunk_tree("snap-1", &tree, &ChunkerConfig::default());
//! assert_eq!(set.chunks.len(), 1);
//! assert_eq!(set.chunks[0].start_line, 1);
//! ```

use std::collections::{BTreeSet, HashSet};

use sha2::{Digest, Sha256};

use crate::error::IngestionError;
use crate::models::{CodeChunk, FileTree, Language, SkipReason, SkippedFile, SourceFile};

/// Number of leading bytes inspected for NUL when detecting binary files.
const BINARY_SNIFF_BYTES: usize = 8192;

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Maximum lines per chunk.
    pub window_lines: usize,
    /// Lines shared between consecutive windows of an oversized segment.
    pub overlap_lines: usize,
    /// Files larger than this are skipped as [`SkipReason::TooLarge`].
    pub max_file_bytes: u64,
    /// Use declaration boundaries when a recognizer exists for the language.
    pub structural: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            window_lines: 60,
            overlap_lines: 10,
            max_file_bytes: 1_000_000,
            structural: true,
        }
    }
}

/// Everything the chunker produced for one tree.
#[derive(Debug, Clone, Default)]
pub struct ChunkSet {
    pub chunks: Vec<CodeChunk>,
    /// Binary, oversized and undecodable files.
    pub skipped: Vec<SkippedFile>,
    /// Per-file decode failures. Each one also appears in `skipped`.
    pub errors: Vec<IngestionError>,
}

impl ChunkSet {
    /// Number of distinct files that contributed at least one chunk.
    pub fn chunked_files(&self) -> usize {
        self.chunks
            .iter()
            .map(|c| c.path.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// True when files were attempted but none could be decoded.
    pub fn is_total_failure(&self) -> bool {
        self.chunks.is_empty() && !self.errors.is_empty()
    }
}

/// Chunk every file of `tree` for the given snapshot.
pub fn chunk_tree(snapshot_id: &str, tree: &FileTree, config: &ChunkerConfig) -> ChunkSet {
    let mut files: Vec<&SourceFile> = tree.files.iter().collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));

    let mut set = ChunkSet::default();

    for file in files {
        let size = file.bytes.len() as u64;
        if size > config.max_file_bytes {
            set.skipped.push(skipped(file, SkipReason::TooLarge));
            continue;
        }
        if is_binary(&file.bytes) {
            set.skipped.push(skipped(file, SkipReason::Binary));
            continue;
        }
        let text = match std::str::from_utf8(&file.bytes) {
            Ok(t) => t.strip_prefix('\u{feff}').unwrap_or(t),
            Err(_) => {
                set.skipped
                    .push(skipped(file, SkipReason::UnsupportedEncoding));
                set.errors.push(IngestionError::UnsupportedEncoding {
                    path: file.path.clone(),
                });
                continue;
            }
        };

        let language = Language::from_path(&file.path);
        let body = if file.path.ends_with(".ipynb") {
            notebook_code(text).unwrap_or_else(|| text.to_string())
        } else {
            text.to_string()
        };

        chunk_file(snapshot_id, &file.path, language, &body, config, &mut set.chunks);
    }

    for (ordinal, chunk) in set.chunks.iter_mut().enumerate() {
        chunk.ordinal = ordinal as u32;
    }
    set
}

fn skipped(file: &SourceFile, reason: SkipReason) -> SkippedFile {
    SkippedFile {
        path: file.path.clone(),
        reason,
        size_bytes: file.bytes.len() as u64,
    }
}

fn is_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0)
}

/// Concatenate the code cells of a Jupyter notebook.
fn notebook_code(text: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(text).ok()?;
    let cells = json.get("cells")?.as_array()?;
    let mut out = String::new();
    for cell in cells {
        if cell.get("cell_type").and_then(|t| t.as_str()) != Some("code") {
            continue;
        }
        let source = match cell.get("source") {
            Some(serde_json::Value::Array(lines)) => lines
                .iter()
                .filter_map(|l| l.as_str())
                .collect::<String>(),
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => continue,
        };
        if source.trim().is_empty() {
            continue;
        }
        out.push_str(source.trim_end());
        out.push_str("\n\n");
    }
    Some(out)
}

fn chunk_file(
    snapshot_id: &str,
    path: &str,
    language: Language,
    text: &str,
    config: &ChunkerConfig,
    out: &mut Vec<CodeChunk>,
) {
    // Byte range of every line, newline included.
    let mut lines: Vec<(usize, usize)> = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        lines.push((offset, offset + line.len()));
        offset += line.len();
    }
    if lines.is_empty() {
        return;
    }

    let window = config.window_lines.max(1);
    let overlap = config.overlap_lines.min(window - 1);

    let pieces = if config.structural && has_recognizer(language) {
        let starts = declaration_starts(language, text, &lines);
        let segments: Vec<(usize, usize)> = starts
            .iter()
            .zip(starts.iter().skip(1).chain(std::iter::once(&lines.len())))
            .map(|(&s, &e)| (s, e))
            .collect();
        pack_segments(&segments, window, overlap)
    } else {
        split_window(0, lines.len(), window, overlap)
    };

    for (start, end) in pieces {
        let start_byte = lines[start].0;
        let end_byte = lines[end - 1].1;
        let piece = &text[start_byte..end_byte];
        if piece.trim().is_empty() {
            continue;
        }
        out.push(make_chunk(
            snapshot_id,
            path,
            language,
            (start, end),
            (start_byte, end_byte),
            piece,
        ));
    }
}

/// Greedily merge adjacent segments up to `window` lines.
fn pack_segments(segments: &[(usize, usize)], window: usize, overlap: usize) -> Vec<(usize, usize)> {
    let mut pieces = Vec::new();
    let mut current: Option<(usize, usize)> = None;

    for &(s, e) in segments {
        if e - s > window {
            if let Some(cur) = current.take() {
                pieces.push(cur);
            }
            pieces.extend(split_window(s, e, window, overlap));
            continue;
        }
        current = match current {
            Some((cs, _)) if e - cs <= window => Some((cs, e)),
            Some(cur) => {
                pieces.push(cur);
                Some((s, e))
            }
            None => Some((s, e)),
        };
    }
    if let Some(cur) = current {
        pieces.push(cur);
    }
    pieces
}

/// Fixed windows over `[start, end)` sharing `overlap` lines.
fn split_window(start: usize, end: usize, window: usize, overlap: usize) -> Vec<(usize, usize)> {
    let step = (window - overlap).max(1);
    let mut pieces = Vec::new();
    let mut s = start;
    while s < end {
        let e = (s + window).min(end);
        pieces.push((s, e));
        if e == end {
            break;
        }
        s += step;
    }
    pieces
}

fn has_recognizer(language: Language) -> bool {
    !matches!(language, Language::Html | Language::Latex | Language::Text)
}

/// Line indices where a new structural segment begins. Always contains 0.
fn declaration_starts(language: Language, text: &str, lines: &[(usize, usize)]) -> BTreeSet<usize> {
    let line_text = |i: usize| text[lines[i].0..lines[i].1].trim_end_matches(['\n', '\r']);

    let mut starts = BTreeSet::new();
    starts.insert(0);
    for i in 0..lines.len() {
        if !is_declaration(language, line_text(i)) {
            continue;
        }
        let mut s = i;
        while s > 0 && is_preamble(language, line_text(s - 1)) {
            s -= 1;
        }
        starts.insert(s);
    }
    starts
}

fn strip_modifiers<'a>(mut line: &'a str, modifiers: &[&str]) -> &'a str {
    loop {
        let before = line;
        for m in modifiers {
            if let Some(rest) = line.strip_prefix(m) {
                line = rest;
            }
        }
        if line == before {
            return line;
        }
    }
}

fn starts_with_any(line: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|p| line.starts_with(p))
}

/// Recognize a top-level (unindented) declaration line.
fn is_declaration(language: Language, line: &str) -> bool {
    if line.is_empty() || line.starts_with(char::is_whitespace) {
        return false;
    }
    match language {
        Language::Rust => {
            let l = strip_modifiers(
                line,
                &["pub(crate) ", "pub(super) ", "pub ", "async ", "unsafe ", "extern \"C\" "],
            );
            starts_with_any(
                l,
                &[
                    "fn ", "struct ", "enum ", "trait ", "impl", "mod ", "type ", "const ",
                    "static ", "union ", "macro_rules!",
                ],
            )
        }
        Language::Python => starts_with_any(line, &["def ", "async def ", "class "]),
        Language::JavaScript | Language::TypeScript => {
            let l = strip_modifiers(line, &["export ", "default ", "declare ", "async ", "abstract "]);
            starts_with_any(
                l,
                &["function", "class ", "interface ", "type ", "enum ", "const ", "let ", "namespace "],
            )
        }
        Language::Go => starts_with_any(line, &["func ", "type ", "var ", "const "]),
        Language::Java | Language::Kotlin | Language::Swift => {
            let l = strip_modifiers(
                line,
                &[
                    "public ", "private ", "protected ", "internal ", "fileprivate ", "open ",
                    "abstract ", "final ", "static ", "data ", "sealed ", "inline ",
                ],
            );
            starts_with_any(
                l,
                &[
                    "class ", "interface ", "enum ", "record ", "object ", "fun ", "struct ",
                    "extension ", "protocol ", "func ",
                ],
            )
        }
        Language::Ruby => starts_with_any(line, &["def ", "class ", "module "]),
        Language::C | Language::Cpp => {
            if starts_with_any(
                line,
                &["struct ", "class ", "namespace ", "typedef ", "enum ", "union ", "template"],
            ) {
                return true;
            }
            !starts_with_any(line, &["#", "}", "//", "/*", "*"])
                && line.contains('(')
                && !line.trim_end().ends_with(';')
        }
        Language::Solidity => {
            starts_with_any(line, &["contract ", "abstract contract ", "library ", "interface ", "function "])
        }
        Language::Markdown => line.starts_with('#'),
        Language::Html | Language::Latex | Language::Text => false,
    }
}

/// Lines that belong to the declaration directly below them.
fn is_preamble(language: Language, line: &str) -> bool {
    let t = line.trim_start();
    if t.is_empty() {
        return false;
    }
    match language {
        Language::Python | Language::Ruby => t.starts_with('#') || t.starts_with('@'),
        Language::Markdown => false,
        _ => starts_with_any(t, &["//", "/*", "*", "#[", "@"]),
    }
}

fn make_chunk(
    snapshot_id: &str,
    path: &str,
    language: Language,
    (start_line, end_line): (usize, usize),
    (start_byte, end_byte): (usize, usize),
    text: &str,
) -> CodeChunk {
    let mut id_hasher = Sha256::new();
    id_hasher.update(format!("{}:{}:{}-{}", snapshot_id, path, start_byte, end_byte).as_bytes());
    let id = format!("{:x}", id_hasher.finalize());

    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    CodeChunk {
        id,
        snapshot_id: snapshot_id.to_string(),
        path: path.to_string(),
        language,
        start_line: start_line as u32 + 1,
        end_line: end_line as u32,
        start_byte: start_byte as u64,
        end_byte: end_byte as u64,
        ordinal: 0,
        text: text.to_string(),
        hash,
    }
}
