// ABOUTME: CLI check-config command - load a TOML client config and print the effective values

use anyhow::{Context, Result};

use stdb_client::ClientConfig;

use super::{CheckConfigArgs, OutputFormat};

pub fn execute(args: &CheckConfigArgs, format: OutputFormat) -> Result<()> {
    let config = ClientConfig::load(&args.path)
        .with_context(|| format!("invalid config {}", args.path.display()))?;
    tracing::info!(path = %args.path.display(), uri = %config.uri, "Config is valid");

    match format {
        OutputFormat::Text => print!("{}", config.to_toml_string()?),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}
