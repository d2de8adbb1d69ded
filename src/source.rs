//! Repository sources: local directory, `.zip` archive, or git URL.
//!
//! Every source is turned into a [`FileTree`] of relative `/`-separated
//! paths. Version-control metadata, dependency folders, build output,
//! dot-paths and `.env*` files never enter the tree; `[source]
//! exclude_globs` adds further patterns.
//!
//! Archives whose entries all share one top-level folder (the layout of
//! GitHub's "Download ZIP") have that folder stripped. Git URLs are
//! cloned shallowly, trying `main`, then `master`, then the remote's
//! default branch unless a branch is given.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use codescope_core::error::IngestionError;
use codescope_core::models::{FileTree, SourceFile};

use crate::config::Config;

const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.git/**",
    "**/node_modules/**",
    "**/target/**",
    "**/__pycache__/**",
    "**/.env*",
    "**/*.lock",
    "**/package-lock.json",
];

/// Where a snapshot's files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Directory(PathBuf),
    Archive(PathBuf),
    Git { url: String, branch: Option<String> },
}

impl SourceRef {
    /// Classify a user-supplied source string.
    pub fn parse(input: &str, branch: Option<String>) -> Result<Self, IngestionError> {
        let looks_remote = input.starts_with("http://")
            || input.starts_with("https://")
            || input.starts_with("git@")
            || input.starts_with("ssh://")
            || input.ends_with(".git");
        if looks_remote && !Path::new(input).exists() {
            return Ok(SourceRef::Git {
                url: input.to_string(),
                branch,
            });
        }

        let path = PathBuf::from(input);
        if path.is_dir() {
            Ok(SourceRef::Directory(path))
        } else if path.is_file() && input.to_ascii_lowercase().ends_with(".zip") {
            Ok(SourceRef::Archive(path))
        } else {
            Err(IngestionError::SourceUnavailable {
                source_ref: input.to_string(),
                reason: "not a directory, .zip archive, or git URL".to_string(),
            })
        }
    }

    pub fn display(&self) -> String {
        match self {
            SourceRef::Directory(p) | SourceRef::Archive(p) => p.display().to_string(),
            SourceRef::Git { url, branch: Some(b) } => format!("{}#{}", url, b),
            SourceRef::Git { url, branch: None } => url.clone(),
        }
    }
}

/// Path filter built from the default and configured excludes.
pub struct PathFilter {
    excludes: GlobSet,
}

impl PathFilter {
    pub fn new(extra: &[String]) -> anyhow::Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in DEFAULT_EXCLUDES.iter().copied().chain(extra.iter().map(String::as_str)) {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            excludes: builder.build()?,
        })
    }

    pub fn accepts(&self, relative: &str) -> bool {
        if relative.split('/').any(|part| part.starts_with('.')) {
            return false;
        }
        !self.excludes.is_match(relative)
    }
}

/// Load the tree of `source`. Blocking; run it on a blocking thread.
pub fn load_tree(source: &SourceRef, config: &Config) -> Result<FileTree, IngestionError> {
    let filter = PathFilter::new(&config.source.exclude_globs).map_err(|e| {
        IngestionError::SourceUnavailable {
            source_ref: source.display(),
            reason: format!("invalid exclude pattern: {}", e),
        }
    })?;

    match source {
        SourceRef::Directory(root) => read_directory(root, &filter, &source.display()),
        SourceRef::Archive(path) => read_archive(path, &filter),
        SourceRef::Git { url, branch } => {
            let dest = config.cache_dir().join(format!(
                "{}-{}",
                short_hash(url),
                uuid::Uuid::new_v4().simple()
            ));
            git_clone(url, branch.as_deref(), &dest)?;
            let tree = read_directory(&dest, &filter, url);
            if let Err(e) = std::fs::remove_dir_all(&dest) {
                warn!(path = %dest.display(), error = %e, "failed to remove clone");
            }
            tree.map(|t| FileTree::new(url.clone(), t.files))
        }
    }
}

fn read_directory(root: &Path, filter: &PathFilter, origin: &str) -> Result<FileTree, IngestionError> {
    let unavailable = |reason: String| IngestionError::SourceUnavailable {
        source_ref: origin.to_string(),
        reason,
    };
    if !root.is_dir() {
        return Err(unavailable("directory does not exist".to_string()));
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        // Prune dot-directories; the root itself always passes.
        entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
    });
    for entry in walker {
        let entry = entry.map_err(|e| unavailable(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !filter.accepts(&rel_str) {
            continue;
        }
        let bytes = std::fs::read(path).map_err(|e| unavailable(format!("{}: {}", rel_str, e)))?;
        files.push(SourceFile::new(rel_str, bytes));
    }
    debug!(origin, files = files.len(), "directory read");
    Ok(FileTree::new(origin, files))
}

fn read_archive(path: &Path, filter: &PathFilter) -> Result<FileTree, IngestionError> {
    let corrupt = |reason: String| IngestionError::ArchiveCorrupt { reason };
    let file = std::fs::File::open(path).map_err(|e| IngestionError::SourceUnavailable {
        source_ref: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;

    let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| corrupt(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        // Rejects absolute paths and `..` components.
        let Some(name) = entry.enclosed_name() else {
            return Err(corrupt(format!("unsafe entry path: {}", entry.name())));
        };
        let name = name
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| corrupt(format!("{}: {}", name, e)))?;
        entries.push((name, bytes));
    }

    let prefix = common_root(entries.iter().map(|(n, _)| n.as_str()));
    let files = entries
        .into_iter()
        .filter_map(|(name, bytes)| {
            let relative = match &prefix {
                Some(p) => name.strip_prefix(p.as_str())?.to_string(),
                None => name,
            };
            filter.accepts(&relative).then(|| SourceFile::new(relative, bytes))
        })
        .collect();
    Ok(FileTree::new(path.display().to_string(), files))
}

/// `"root/"` when every name lives under the same top-level folder.
fn common_root<'a>(mut names: impl Iterator<Item = &'a str>) -> Option<String> {
    let first = names.next()?;
    let (top, _) = first.split_once('/')?;
    let prefix = format!("{}/", top);
    names.all(|n| n.starts_with(&prefix)).then_some(prefix)
}

fn git_clone(url: &str, branch: Option<&str>, dest: &Path) -> Result<(), IngestionError> {
    let candidates: Vec<Option<&str>> = match branch {
        Some(b) => vec![Some(b)],
        None => vec![Some("main"), Some("master"), None],
    };

    let mut last_error = String::new();
    for candidate in candidates {
        if dest.exists() {
            let _ = std::fs::remove_dir_all(dest);
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IngestionError::SourceUnavailable {
                source_ref: url.to_string(),
                reason: format!("cannot create {}: {}", parent.display(), e),
            })?;
        }

        let mut cmd = Command::new("git");
        cmd.args(["clone", "--single-branch", "--depth", "1"]);
        if let Some(b) = candidate {
            cmd.args(["--branch", b]);
        }
        cmd.arg(url).arg(dest);

        let output = cmd.output().map_err(|e| IngestionError::SourceUnavailable {
            source_ref: url.to_string(),
            reason: format!("failed to execute 'git clone'. Is git installed? {}", e),
        })?;
        if output.status.success() {
            info!(url, branch = candidate.unwrap_or("(default)"), "cloned repository");
            return Ok(());
        }
        last_error = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!(url, branch = candidate.unwrap_or("(default)"), error = %last_error, "clone attempt failed");
    }

    Err(IngestionError::SourceUnavailable {
        source_ref: url.to_string(),
        reason: format!("git clone failed: {}", last_error),
    })
}

fn short_hash(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    digest.iter().take(6).map(|b| format!("{:02x}", b)).collect()
}
