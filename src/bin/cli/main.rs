mod app;
mod commands;
mod render;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nous-sync-cli", about = "Inspect and drive the local note sync state", version)]
struct Cli {
    /// Data directory (default: platform local data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "plain")]
    format: OutputFormat,

    /// Disable ANSI colors
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Plain,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Show storage usage, queue length and registered contexts
    Status,

    /// List backup snapshots, newest first
    Backups,

    /// Take a snapshot now
    Backup,

    /// Restore a snapshot over the local collection
    Restore {
        /// Snapshot id (defaults to the newest)
        #[arg(long)]
        snapshot: Option<String>,
    },

    /// List pending remote operations
    Queue,

    /// Check whether the last run ended without a clean shutdown
    CheckCrash,

    /// Drain the queue and reconcile once against a remote
    Sync {
        /// Remote base URL
        #[arg(long)]
        remote: String,
        /// Bearer token
        #[arg(long, env = "NOUS_SYNC_TOKEN")]
        token: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let use_color = !cli.no_color && atty_check();
    let app = app::App::new(cli.data_dir.as_deref())?;

    match cli.command {
        Command::Status => commands::status::run(&app, &cli.format, use_color)?,
        Command::Backups => commands::backups::run_list(&app, &cli.format, use_color)?,
        Command::Backup => commands::backups::run_snapshot(&app, &cli.format, use_color)?,
        Command::Restore { snapshot } => {
            commands::backups::run_restore(&app, snapshot.as_deref(), &cli.format, use_color)?
        }
        Command::Queue => commands::queue::run(&app, &cli.format, use_color)?,
        Command::CheckCrash => commands::recovery::run(&app, &cli.format, use_color)?,
        Command::Sync { remote, token } => {
            commands::sync::run(&app, &remote, token, &cli.format, use_color)?
        }
    }

    Ok(())
}

/// Check if stdout is a terminal (for color support)
fn atty_check() -> bool {
    unsafe { libc_isatty(1) != 0 }
}

extern "C" {
    #[link_name = "isatty"]
    fn libc_isatty(fd: i32) -> i32;
}
