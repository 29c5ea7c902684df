//! netcfgd entry point.
//!
//! Loads settings, opens the intent store and runs one reconciliation
//! command against the host.

mod cli;
mod commands;

use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sbc_netcfg_common::Settings;

use crate::cli::{Cli, GlobalOpts};
use crate::commands::Context;

/// Environment variable holding a tracing filter directive.
const LOG_ENV: &str = "NETCFG_LOG";

/// Initialize tracing/logging.
fn init_logging(opts: &GlobalOpts) {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&opts.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if opts.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut settings = Settings::load_or_default(&cli.global.config)
        .with_context(|| format!("loading settings from {}", cli.global.config.display()))?;
    settings.apply_env_overrides()?;
    info!("Intent store at {}", settings.database.path.display());

    let ctx = Context::open(settings)?;
    commands::dispatch(&ctx, cli.command).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.global);

    info!("--- Starting netcfgd {} ---", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("netcfgd failed: {:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
