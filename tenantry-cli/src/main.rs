use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

mod commands;
mod utils;

/// tenantry - inspect query strings, filters and configuration
#[derive(Parser)]
#[command(name = "tenantry")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a query string and print the normalized options
    Parse {
        /// URL-encoded query string, e.g. 'limit=10&page=2&include=["group"]'
        #[arg(value_name = "QUERY")]
        query: String,

        /// Decode as count options instead of query options
        #[arg(long)]
        count: bool,
    },
    /// Compile a `where` value into the predicate the store receives
    Compile {
        /// JSON filter matrix, e.g. '[[{"col":"name","op":"=","value":"Ada"}]]'
        #[arg(value_name = "WHERE")]
        filter: String,
    },
    /// Print the effective layered configuration
    Config {
        /// Service name used to locate config files
        #[arg(long, value_name = "NAME", default_value = "tenantry")]
        service: String,

        /// Load this file instead of searching the standard locations
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value_t = commands::config::Format::Toml)]
        format: commands::config::Format,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Parse { query, count } => commands::query::parse(&query, count),
        Commands::Compile { filter } => commands::query::compile(&filter),
        Commands::Config {
            service,
            file,
            format,
        } => commands::config::execute(&service, file.as_deref(), format),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);

            if let Some(source) = e.source() {
                eprintln!("\n{} {}", "Caused by:".yellow(), source);
            }

            std::process::exit(1);
        }
    }
}
