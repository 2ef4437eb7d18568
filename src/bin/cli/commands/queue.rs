use anyhow::{Context, Result};

use nous_sync::sync::OperationType;

use crate::app::App;
use crate::render::terminal::{format_time, paint, Color};
use crate::OutputFormat;

pub fn run(app: &App, format: &OutputFormat, use_color: bool) -> Result<()> {
    let context = app.detached();
    let pending = context.queue().pending().context("Failed to read operation queue")?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&pending)?);
        }
        OutputFormat::Plain => {
            if pending.is_empty() {
                println!("(queue empty)");
                return Ok(());
            }
            for op in &pending {
                let kind = match op.op_type {
                    OperationType::Create => paint("create", Color::GREEN, use_color),
                    OperationType::Update => paint("update", Color::YELLOW, use_color),
                    OperationType::Delete => paint("delete", Color::RED, use_color),
                };
                let title = op.payload.as_ref().map(|n| n.title.as_str()).unwrap_or("");
                println!(
                    "{:<6} note {:<6} {}  retries {}/{}  {}",
                    kind,
                    op.note_id,
                    format_time(Some(op.enqueued_at)),
                    op.retry_count,
                    op.max_retries,
                    title,
                );
                if let Some(error) = &op.last_error {
                    println!(
                        "       {} (next attempt {})",
                        paint(error, Color::DIM, use_color),
                        format_time(op.next_attempt_at),
                    );
                }
            }
        }
    }

    Ok(())
}
