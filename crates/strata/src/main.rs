//! Strata - multi-tier workflow execution engine
//!
//! Main entry point for the Strata CLI.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};

mod commands;
mod runtime;

use commands::{config, run, validate};
use strata_config::{ConfigSource, LoadedConfig};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Strata - multi-tier workflow execution engine
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file to use instead of the discovered ones
    #[arg(long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow with the built-in tools
    Run(run::RunArgs),

    /// Load and check a workflow without running it
    Validate(validate::ValidateArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = match cli.config {
        Some(ref path) => LoadedConfig {
            config: strata_config::load_config_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            sources: vec![ConfigSource {
                path: path.clone(),
                loaded: true,
            }],
            warnings: Vec::new(),
        },
        None => strata_config::load_config(None).context("Failed to load configuration")?,
    };
    let logging = loaded.config.logging();

    // Console goes to stderr so `--json` output stays parseable
    let filter = if cli.verbose {
        "strata=debug,strata_navigation=debug,strata_resources=debug,strata_tools=debug,strata_config=debug,info".to_string()
    } else {
        let level = &logging.level;
        format!(
            "strata={level},strata_navigation={level},strata_resources={level},strata_tools={level},warn"
        )
    };

    let (file_layer, _guard) = if logging.file_logging {
        let log_dir = strata_config::user_config_dir()
            .map(|d| d.join("logs"))
            .unwrap_or_else(|| PathBuf::from("logs"));
        let file_appender = tracing_appender::rolling::daily(&log_dir, "strata.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        (Some(non_blocking), Some(guard))
    } else {
        (None, None)
    };

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(file_layer.map(|writer| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "strata=trace,strata_navigation=trace,strata_resources=trace,strata_tools=trace,strata_config=trace,info",
                ))
        }))
        .init();

    for warning in &loaded.warnings {
        tracing::warn!(%warning, "Config layer skipped");
    }

    let ctx = commands::Context {
        json_output: cli.json,
        verbose: cli.verbose,
        loaded,
    };

    match cli.command {
        Commands::Run(args) => run::run(args, &ctx).await,
        Commands::Validate(args) => validate::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}
