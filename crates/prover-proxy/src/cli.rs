//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prover_proxy_service::caching;
use prover_proxy_service::config::Config;
use prover_proxy_service::metrics;

use crate::logging;
use crate::server;

/// Prover proxy commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the web server.
    Run,

    /// Remove expired and failed proofs from the store.
    Cleanup {
        /// Only log what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(bin_name = "prover-proxy", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded, no runtime has been started yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        if let Err(err) = metrics::configure_statsd(
            &config.metrics.prefix,
            statsd,
            config.metrics.custom_tags.clone(),
        ) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "Failed to configure statsd",
            );
        }
    }

    match cli.command {
        Command::Run => {
            config.validate()?;
            server::run(config).context("failed to start the server")?
        }
        Command::Cleanup { dry_run } => {
            caching::cleanup(config, dry_run).context("failed to clean up the proof store")?
        }
    }

    Ok(())
}
