//! `codescope report`: print a stored analysis report.

use anyhow::{bail, Context, Result};

use crate::services::Services;

pub async fn run_report(services: &Services, snapshot: &str, run: Option<&str>, json: bool) -> Result<()> {
    let snapshot = services.resolve_snapshot(snapshot).await?;
    let report = match run {
        Some(run_id) => {
            let report = services
                .store
                .get_report(run_id)
                .await?
                .with_context(|| format!("Report not found: {}", run_id))?;
            if report.snapshot_id != snapshot.id {
                bail!("Report {} belongs to snapshot {}, not {}", run_id, report.snapshot_id, snapshot.id);
            }
            report
        }
        None => match services.store.latest_report(&snapshot.id).await? {
            Some(report) => report,
            None => {
                println!(
                    "No analysis report for snapshot {}. Run `codescope analyze {}`.",
                    snapshot.id, snapshot.id
                );
                return Ok(());
            }
        },
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.to_markdown());
    }
    Ok(())
}
