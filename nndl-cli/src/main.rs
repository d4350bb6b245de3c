mod cli;
mod commands;
mod config;
mod error;
mod progress;

use std::process;

use clap::Parser;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, warn};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands};
use crate::commands::CommandExecutor;
use crate::config::{AppConfig, DownloadSettings, PlatformSettings};
use crate::error::Result;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet, !args.no_progress);

    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let file = AppConfig::load(args.config.as_deref())?;
    let platform = PlatformSettings::resolve(&args, &file)?;
    let executor = CommandExecutor::new(platform)?;

    // Ctrl-C stops dispatch; sessions are still released before exit.
    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping transfers");
            interrupt.cancel();
        }
    });

    match &args.command {
        Commands::Download(download) => {
            let settings = DownloadSettings::resolve(download, &file)?;
            executor
                .download(&download.resource_ids, &settings, &token)
                .await
        }
        Commands::ListQualities { resource_id } => {
            executor.list_qualities(resource_id, &token).await
        }
    }
}

fn init_logging(verbose: bool, quiet: bool, progress: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    let registry = tracing_subscriber::registry().with(filter);
    if progress {
        let indicatif_layer = IndicatifLayer::new();
        registry
            .with(
                fmt::layer()
                    .with_target(verbose)
                    .with_writer(indicatif_layer.get_stderr_writer()),
            )
            .with(indicatif_layer)
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(verbose).with_writer(std::io::stderr))
            .init();
    }
}
