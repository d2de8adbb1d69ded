//! Snapshot overview for `codescope status`.
//!
//! Without an argument, lists every snapshot with its index coverage.
//! With a snapshot id (or `latest`), shows its statistics and the files
//! the chunker skipped.

use std::fmt::Write;

use anyhow::Result;

use codescope_core::models::{SkippedFile, Snapshot};

use crate::services::Services;

pub async fn run_status(services: &Services, snapshot: Option<&str>) -> Result<()> {
    match snapshot {
        None => {
            let snapshots = services.store.list_snapshots().await?;
            let db_size = std::fs::metadata(&services.config.db.path)
                .map(|m| m.len())
                .unwrap_or(0);
            println!("codescope snapshots");
            println!("===================");
            println!();
            println!("  Database:    {}", services.config.db.path.display());
            println!("  Size:        {}", format_bytes(db_size));
            println!();
            print!("{}", render_list(&snapshots));
        }
        Some(id) => {
            let snapshot = services.resolve_snapshot(id).await?;
            let skipped = services.store.list_skipped(&snapshot.id).await?;
            print!("{}", render_detail(&snapshot, &skipped));
        }
    }
    Ok(())
}

pub fn render_list(snapshots: &[Snapshot]) -> String {
    let mut out = String::new();
    if snapshots.is_empty() {
        out.push_str("  No snapshots. Run `codescope ingest <source>` to create one.\n");
        return out;
    }
    let _ = writeln!(
        out,
        "  {:<36} {:<8} {:>7} {:>9}   {:<14} {}",
        "SNAPSHOT", "STATUS", "CHUNKS", "EMBEDDED", "INGESTED", "SOURCE"
    );
    let _ = writeln!(out, "  {}", "-".repeat(100));
    for s in snapshots {
        let _ = writeln!(
            out,
            "  {:<36} {:<8} {:>7} {:>9}   {:<14} {}",
            s.id,
            s.status.as_str(),
            s.stats.chunks,
            s.stats.embedded,
            format_ts_relative(s.created_at),
            s.source
        );
    }
    out
}

pub fn render_detail(snapshot: &Snapshot, skipped: &[SkippedFile]) -> String {
    let stats = &snapshot.stats;
    let mut out = String::new();
    let _ = writeln!(out, "Snapshot {}", snapshot.id);
    let _ = writeln!(out, "  Source:      {}", snapshot.source);
    let _ = writeln!(out, "  Status:      {}", snapshot.status.as_str());
    let _ = writeln!(
        out,
        "  Ingested:    {} ({})",
        format_ts_iso(snapshot.created_at),
        format_ts_relative(snapshot.created_at)
    );
    if let Some(error) = &snapshot.error {
        let _ = writeln!(out, "  Error:       {}", error);
    }
    let _ = writeln!(out, "  Files:       {}", snapshot.file_count);
    let _ = writeln!(out, "  Chunks:      {}", stats.chunks);
    let _ = writeln!(
        out,
        "  Embedded:    {} / {} ({}%)",
        stats.embedded,
        stats.chunks,
        if stats.chunks > 0 {
            (stats.embedded * 100) / stats.chunks
        } else {
            0
        }
    );
    if stats.embedding_failed > 0 {
        let _ = writeln!(
            out,
            "  Failed:      {} ({:.1}% of chunks)",
            stats.embedding_failed,
            stats.failure_ratio() * 100.0
        );
    }
    let _ = writeln!(out, "  Skipped:     {}", stats.skipped);

    if !skipped.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "  {:<60} {:<22} {:>10}", "SKIPPED FILE", "REASON", "SIZE");
        let _ = writeln!(out, "  {}", "-".repeat(94));
        for file in skipped {
            let _ = writeln!(
                out,
                "  {:<60} {:<22} {:>10}",
                file.path,
                file.reason.as_str(),
                format_bytes(file.size_bytes)
            );
        }
    }
    out
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" for recent timestamps, a date otherwise.
pub fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    let plural = |n: i64| if n == 1 { "" } else { "s" };
    match delta {
        0..=59 => "just now".to_string(),
        60..=3599 => format!("{} min{} ago", delta / 60, plural(delta / 60)),
        3600..=86_399 => format!("{} hour{} ago", delta / 3600, plural(delta / 3600)),
        _ if delta < 86_400 * 30 => format!("{} day{} ago", delta / 86_400, plural(delta / 86_400)),
        _ => format_ts_iso(ts),
    }
}

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use codescope_core::models::{IndexStats, SkipReason};

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 3600), "1 hour ago");
        assert_eq!(format_ts_relative(now - 86_400 * 3), "3 days ago");
    }

    #[test]
    fn test_detail_shows_failures_and_skipped_files() {
        let mut snap = Snapshot::pending("s1", "/repo", 0);
        snap.mark_indexed(IndexStats {
            chunks: 10,
            embedded: 8,
            embedding_failed: 2,
            skipped: 1,
        });
        let skipped = vec![SkippedFile {
            path: "assets/logo.png".to_string(),
            reason: SkipReason::Binary,
            size_bytes: 4096,
        }];
        let out = render_detail(&snap, &skipped);
        assert!(out.contains("Embedded:    8 / 10 (80%)"));
        assert!(out.contains("Failed:      2 (20.0% of chunks)"));
        assert!(out.contains("assets/logo.png"));
        assert!(out.contains("binary"));
    }

    #[test]
    fn test_empty_list_hint() {
        assert!(render_list(&[]).contains("codescope ingest"));
    }
}
