//! Config command - configuration management.

use anyhow::{Result, anyhow};
use clap::{Args, Subcommand};
use strata_config::StrataConfig;

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved configuration and the files it came from
    Show,

    /// Show configuration file path
    Path,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Path => cmd_path(ctx),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = &ctx.loaded;
    let effective = effective_config(&loaded.config);

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&effective)?);
        return Ok(());
    }

    println!("# Strata Configuration\n");

    println!("# Search order (later overrides earlier):");
    for source in &loaded.sources {
        let status = if source.loaded {
            "✓ loaded"
        } else {
            "· not found"
        };
        println!("#   {} {}", status, source.path.display());
    }
    for warning in &loaded.warnings {
        println!("#   ! {warning}");
    }
    println!();

    print!("{}", effective.to_toml()?);
    Ok(())
}

/// `config` with every section filled in, defaults included.
fn effective_config(config: &StrataConfig) -> StrataConfig {
    StrataConfig {
        resources: Some(config.resources()),
        recovery: Some(config.recovery()),
        navigation: Some(config.navigation()),
        tools: Some(config.tools()),
        logging: Some(config.logging()),
    }
}

fn cmd_path(ctx: &Context) -> Result<()> {
    let path = strata_config::user_config_path()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?;
    if ctx.json_output {
        println!("{}", serde_json::json!({ "path": path }));
    } else {
        println!("{}", path.display());
    }
    Ok(())
}
