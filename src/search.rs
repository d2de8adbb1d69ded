//! `codescope search`: run the retriever from the command line.

use anyhow::Result;

use codescope_core::index::ScoredChunk;
use codescope_core::retrieve::RetrievalFilters;

use crate::services::Services;

pub async fn run_search(
    services: &Services,
    snapshot: &str,
    query: &str,
    k: Option<usize>,
    filters: RetrievalFilters,
) -> Result<()> {
    let snapshot = services.indexed_snapshot(snapshot).await?;
    if snapshot.stats.embedded == 0 {
        eprintln!(
            "Snapshot {} has no embeddings; configure [embedding] and run `codescope reindex {}`.",
            snapshot.id, snapshot.id
        );
    }
    let k = k.unwrap_or(services.config.retrieval.k);
    let hits = services
        .retriever
        .retrieve(&snapshot.id, query, k, &filters)
        .await;
    print!("{}", render_hits(&hits));
    Ok(())
}

pub fn render_hits(hits: &[ScoredChunk]) -> String {
    if hits.is_empty() {
        return "No results.\n".to_string();
    }
    let mut out = String::new();
    for (i, hit) in hits.iter().enumerate() {
        let chunk = &hit.chunk;
        let excerpt: String = chunk
            .text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(160)
            .collect();
        out.push_str(&format!(
            "{}. [{:.3}] {}\n    language: {}\n    excerpt: \"{}\"\n    id: {}\n\n",
            i + 1,
            hit.score,
            chunk.location(),
            chunk.language.as_str(),
            excerpt,
            chunk.id
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use codescope_core::models::{CodeChunk, Language};
    use std::sync::Arc;

    #[test]
    fn test_render_hits() {
        assert_eq!(render_hits(&[]), "No results.\n");

        let hit = ScoredChunk {
            chunk: Arc::new(CodeChunk {
                id: "abc".to_string(),
                snapshot_id: "s".to_string(),
                path: "src/main.py".to_string(),
                language: Language::Python,
                start_line: 3,
                end_line: 9,
                start_byte: 10,
                end_byte: 90,
                ordinal: 0,
                text: "def main():\n    run()\n".to_string(),
                hash: String::new(),
            }),
            score: 0.8123,
        };
        let out = render_hits(&[hit]);
        assert!(out.starts_with("1. [0.812] src/main.py:L3-9"));
        assert!(out.contains("excerpt: \"def main(): run()\""));
    }
}
