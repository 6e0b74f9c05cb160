//! CLI entry point for the AV1 conversion service
//!
//! `serve` runs the HTTP API with the periodic retention sweep; `sweep` runs
//! a single retention pass for externally scheduled cleanup.

use av1_convert_daemon::{Config, Daemon, DaemonError};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Convert remote videos to AV1 as background jobs
#[derive(Parser, Debug)]
#[command(name = "av1-convert")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; defaults apply when it does not exist
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the API server and the periodic retention sweep
    Serve {
        /// Skip startup checks (ffmpeg, ffprobe, hardware encoders). For testing only.
        #[arg(long, default_value = "false")]
        skip_checks: bool,
    },
    /// Run one retention pass and exit
    Sweep,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "av1_convert=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config: Config, skip_checks: bool) -> Result<(), DaemonError> {
    let daemon = if skip_checks {
        tracing::warn!("skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config)?
    } else {
        Daemon::with_config(config)?
    };
    tracing::info!(
        bind_addr = %daemon.config.server.bind_addr,
        max_concurrent_jobs = daemon.concurrency_plan.max_concurrent_jobs,
        "starting API server"
    );
    daemon.run().await
}

fn sweep(config: Config) -> Result<(), DaemonError> {
    let daemon = Daemon::new_without_checks(config)?;
    let report = daemon.sweep_once()?;
    tracing::info!(
        scanned = report.scanned,
        marked = report.marked,
        deleted = report.deleted,
        errors = report.errors,
        "sweep complete"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %args.config.display(), error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let result = match args.command {
        Command::Serve { skip_checks } => serve(config, skip_checks).await,
        Command::Sweep => sweep(config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "av1-convert failed");
            ExitCode::FAILURE
        }
    }
}
