//! Deterministic project overview for the coordinator.
//!
//! Built from the chunks of a snapshot without any model call: how many
//! files were indexed, which languages they are written in, and which
//! files look like program entry points.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{CodeChunk, Language};

/// File names that conventionally start a program or service.
const ENTRY_POINT_NAMES: &[&str] = &[
    "main.rs",
    "main.py",
    "__main__.py",
    "app.py",
    "manage.py",
    "wsgi.py",
    "main.go",
    "index.js",
    "app.js",
    "server.js",
    "index.ts",
    "main.ts",
    "server.ts",
    "Main.java",
    "Application.java",
    "Main.kt",
    "main.c",
    "main.cpp",
    "main.swift",
    "config.ru",
];

/// Entry points listed in the rendered overview.
const MAX_ENTRY_POINTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProjectOverview {
    pub total_files: usize,
    /// Files per language, most common first, ties by language.
    pub languages: Vec<(Language, usize)>,
    /// Sorted paths.
    pub entry_points: Vec<String>,
}

impl ProjectOverview {
    pub fn from_chunks(chunks: &[CodeChunk]) -> Self {
        let files: BTreeMap<&str, Language> = chunks
            .iter()
            .map(|c| (c.path.as_str(), c.language))
            .collect();

        let mut counts: BTreeMap<Language, usize> = BTreeMap::new();
        for language in files.values() {
            *counts.entry(*language).or_default() += 1;
        }
        let mut languages: Vec<(Language, usize)> = counts.into_iter().collect();
        languages.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let entry_points: BTreeSet<String> = files
            .keys()
            .filter(|path| is_entry_point(path))
            .map(|path| path.to_string())
            .collect();

        Self {
            total_files: files.len(),
            languages,
            entry_points: entry_points.into_iter().collect(),
        }
    }

    /// The most common language that is not prose.
    pub fn primary_language(&self) -> Option<Language> {
        self.languages
            .iter()
            .map(|(language, _)| *language)
            .find(|l| !matches!(l, Language::Markdown | Language::Text | Language::Latex))
            .or_else(|| self.languages.first().map(|(language, _)| *language))
    }

    pub fn render(&self) -> String {
        let mut s = format!("Files: {}\n", self.total_files);
        if let Some(primary) = self.primary_language() {
            s.push_str(&format!("Primary language: {}\n", primary.as_str()));
        }
        if !self.languages.is_empty() {
            let histogram: Vec<String> = self
                .languages
                .iter()
                .map(|(language, n)| format!("{} {}", language.as_str(), n))
                .collect();
            s.push_str(&format!("Languages: {}\n", histogram.join(", ")));
        }
        if self.entry_points.is_empty() {
            s.push_str("Entry points: none found\n");
        } else {
            let shown: Vec<&str> = self
                .entry_points
                .iter()
                .take(MAX_ENTRY_POINTS)
                .map(String::as_str)
                .collect();
            let more = self.entry_points.len().saturating_sub(shown.len());
            s.push_str(&format!("Entry points: {}", shown.join(", ")));
            if more > 0 {
                s.push_str(&format!(" (+{} more)", more));
            }
            s.push('\n');
        }
        s
    }
}

fn is_entry_point(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    if ENTRY_POINT_NAMES.contains(&name) {
        return true;
    }
    // Cargo binaries.
    path.contains("src/bin/") && name.ends_with(".rs")
}
