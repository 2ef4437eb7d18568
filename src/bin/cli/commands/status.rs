use anyhow::{Context, Result};
use chrono::Utc;
use nous_sync::storage::LocalStore;

use crate::app::App;
use crate::render::terminal::{field, format_bytes, format_time, usage_ratio};
use crate::OutputFormat;

pub fn run(app: &App, format: &OutputFormat, use_color: bool) -> Result<()> {
    let context = app.detached();
    let now = Utc::now();

    let notes = context.repo().list().context("Failed to read notes")?;
    let usage = app.store.usage().context("Failed to read storage usage")?;
    let status = context.orchestrator().status().context("Failed to read sync status")?;
    let backups = context.backups().list_snapshots().context("Failed to list backups")?;
    let tabs = context.coordinator().active_tabs(now).context("Failed to read tab registry")?;
    let next_retry = context.queue().next_due().context("Failed to read queue")?;

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "dataDir": app.data_dir.to_string_lossy(),
                "ownerId": app.config.owner_id,
                "conflictStrategy": app.config.conflict_strategy,
                "notes": notes.len(),
                "storage": {
                    "used": usage.used,
                    "quota": usage.quota,
                    "ratio": usage.ratio(),
                },
                "pendingOperations": status.pending_operations,
                "nextRetry": next_retry,
                "backups": backups.len(),
                "activeContexts": tabs.len(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            let backup_config = &app.config.backup;
            println!("{}", field("Data directory", app.data_dir.display(), use_color));
            println!("{}", field("Owner", &app.config.owner_id, use_color));
            println!("{}", field("Notes", notes.len(), use_color));
            println!(
                "{}",
                field(
                    "Storage",
                    format!(
                        "{} / {} ({})",
                        format_bytes(usage.used),
                        format_bytes(usage.quota),
                        usage_ratio(
                            usage.ratio(),
                            backup_config.warning_ratio,
                            backup_config.critical_ratio,
                            use_color
                        ),
                    ),
                    use_color,
                )
            );
            println!("{}", field("Pending operations", status.pending_operations, use_color));
            if let Some(at) = next_retry {
                println!("{}", field("Next retry", format_time(Some(at)), use_color));
            }
            println!("{}", field("Backups", backups.len(), use_color));
            println!("{}", field("Active contexts", tabs.len(), use_color));
        }
    }

    Ok(())
}
