use anyhow::{Context, Result};

use nous_sync::sync::check_reachable;

use crate::app::App;
use crate::render::terminal::{paint, Color};
use crate::OutputFormat;

/// One drain plus one reconciliation pass against a remote endpoint
pub fn run(
    app: &App,
    remote: &str,
    token: Option<String>,
    format: &OutputFormat,
    use_color: bool,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async {
        let remote = app.remote(remote, token)?;
        let online = check_reachable(remote.as_ref(), &app.config.owner_id).await;
        let context = app.context(remote);
        if let Some(crash) = context.start(online).context("Failed to start sync context")? {
            log::warn!(
                "Previous run ended uncleanly ({} backups available)",
                crash.backups_available
            );
        }

        if !online {
            context.stop().await.context("Failed to stop sync context")?;
            let remaining = context.queue().len().context("Failed to read queue")?;
            match format {
                OutputFormat::Json => {
                    let output = serde_json::json!({
                        "online": false,
                        "pendingOperations": remaining,
                    });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Plain => println!(
                    "{}",
                    paint(
                        &format!("Remote unreachable, {} operation(s) left queued", remaining),
                        Color::YELLOW,
                        use_color
                    )
                ),
            }
            return Ok::<(), anyhow::Error>(());
        }

        let drained = context.orchestrator().sync_pending().await;
        let reconciled = match &drained {
            Ok(_) => Some(context.orchestrator().reconcile().await),
            Err(_) => None,
        };
        context.stop().await.context("Failed to stop sync context")?;

        let drain = drained.context("Queue drain failed")?;
        let result = match reconciled {
            Some(result) => result.context("Reconciliation failed")?,
            None => Default::default(),
        };
        let remaining = context.queue().len().context("Failed to read queue")?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "online": true,
                    "drain": drain,
                    "reconcile": result,
                    "pendingOperations": remaining,
                    "conflicts": context.orchestrator().pending_conflicts().len(),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Plain => {
                println!(
                    "Queue: {} sent, {} skipped, {} retrying, {} failed",
                    drain.succeeded, drain.skipped, drain.retried, drain.failed
                );
                println!(
                    "Reconcile: {} pulled, {} pushed, {} resolved in {}ms",
                    result.notes_pulled, result.notes_pushed, result.conflicts_resolved, result.duration_ms
                );
                if result.conflicts_pending > 0 {
                    println!(
                        "{}",
                        paint(
                            &format!("{} conflict(s) need a decision", result.conflicts_pending),
                            Color::YELLOW,
                            use_color
                        )
                    );
                }
                if remaining > 0 {
                    println!("{} operation(s) still queued", remaining);
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}
