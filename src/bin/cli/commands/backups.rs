use anyhow::{Context, Result};

use crate::app::App;
use crate::render::terminal::{format_time, paint, Color};
use crate::OutputFormat;

pub fn run_list(app: &App, format: &OutputFormat, use_color: bool) -> Result<()> {
    let context = app.detached();
    let backups = context.backups().list_snapshots().context("Failed to list backups")?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&backups)?);
        }
        OutputFormat::Plain => {
            if backups.is_empty() {
                println!("(no backups)");
                return Ok(());
            }
            for info in &backups {
                let label = info
                    .label
                    .as_deref()
                    .map(|l| format!(" [{}]", l))
                    .unwrap_or_default();
                if info.valid {
                    println!(
                        "{}  {}  {} notes{}",
                        paint(&info.id, Color::CYAN, use_color),
                        format_time(info.timestamp),
                        info.note_count,
                        label,
                    );
                } else {
                    println!(
                        "{}  {}",
                        paint(&info.id, Color::CYAN, use_color),
                        paint("invalid", Color::RED, use_color),
                    );
                }
            }
        }
    }

    Ok(())
}

pub fn run_snapshot(app: &App, format: &OutputFormat, use_color: bool) -> Result<()> {
    let context = app.detached();
    let id = context.backups().snapshot().context("Failed to write snapshot")?;
    let pruned = context.backups().prune().context("Failed to prune old snapshots")?;

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({ "id": id, "pruned": pruned });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            println!("Snapshot {}", paint(&id, Color::GREEN, use_color));
            if pruned > 0 {
                println!("Pruned {} old snapshot(s)", pruned);
            }
        }
    }

    Ok(())
}

pub fn run_restore(app: &App, snapshot: Option<&str>, format: &OutputFormat, use_color: bool) -> Result<()> {
    let context = app.detached();
    let report = context
        .backups()
        .restore(snapshot)
        .context("Restore failed, local data left untouched")?;

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "snapshotId": report.snapshot_id,
                "notesRestored": report.notes_restored,
                "preRestoreSnapshotId": report.forensic_snapshot_id,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            println!(
                "Restored {} notes from {}",
                report.notes_restored,
                paint(&report.snapshot_id, Color::GREEN, use_color),
            );
            println!("Previous state kept as {}", report.forensic_snapshot_id);
        }
    }

    Ok(())
}
