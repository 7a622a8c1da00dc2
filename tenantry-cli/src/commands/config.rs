use anyhow::{Context, Result};
use clap::ValueEnum;
use std::path::Path;

use tenantry::config::Config;
use tenantry::database::sanitize_connection_url;

use crate::utils;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Toml,
    Json,
}

/// Load configuration the way a service would and print it
pub fn execute(service: &str, file: Option<&Path>, format: Format) -> Result<()> {
    let config = match file {
        Some(path) => {
            if !path.exists() {
                utils::warning(&format!(
                    "{} does not exist, showing defaults and environment overrides",
                    path.display()
                ));
            }
            Config::load_from(path)
        }
        None => Config::load_for_service(service),
    }
    .context("Failed to load configuration")?;

    println!("{}", render(&redacted(config), format)?);
    Ok(())
}

fn redacted(mut config: Config) -> Config {
    if let Some(db) = config.database.as_mut() {
        db.url = sanitize_connection_url(&db.url);
    }
    config
}

fn render(config: &Config, format: Format) -> Result<String> {
    match format {
        Format::Toml => toml::to_string_pretty(config).context("Failed to render TOML"),
        Format::Json => utils::to_pretty_json(config),
    }
}
