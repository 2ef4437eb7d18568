use anyhow::{Context, Result};
use chrono::Utc;

use crate::app::App;
use crate::render::terminal::{format_time, paint, Color};
use crate::OutputFormat;

/// Report whether the last run ended without a clean shutdown
pub fn run(app: &App, format: &OutputFormat, use_color: bool) -> Result<()> {
    let context = app.detached();
    let crash = context
        .backups()
        .detect_crash(Utc::now())
        .context("Failed to read crash markers")?;

    match format {
        OutputFormat::Json => {
            let output = match &crash {
                Some(report) => serde_json::json!({
                    "crashed": true,
                    "lastHeartbeat": report.last_heartbeat,
                    "backupsAvailable": report.backups_available,
                }),
                None => serde_json::json!({ "crashed": false }),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => match &crash {
            Some(report) => {
                println!(
                    "{} last heartbeat {}",
                    paint("Unclean shutdown detected,", Color::RED, use_color),
                    format_time(Some(report.last_heartbeat)),
                );
                if report.backups_available > 0 {
                    println!(
                        "{} backup(s) available, run `restore` to recover",
                        report.backups_available
                    );
                } else {
                    println!("No backups available");
                }
            }
            None => println!("{}", paint("No crash detected", Color::GREEN, use_color)),
        },
    }

    Ok(())
}
