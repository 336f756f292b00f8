//! quire CLI - builds a static site and serves it with live reload.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "quire")]
#[command(about = "Build and live-reload server for quire sites")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to quire.toml config file
    #[arg(short, long, global = true, default_value = "quire.toml")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the site, optionally serving it with live reload
    Build(commands::build::BuildArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt().with_env_filter(filter).with_target(false).init();

    let config = config::load_config(&cli.config)?;

    // The site builder parses the same arguments itself
    let raw_args: Vec<String> = std::env::args().skip(1).collect();

    match cli.command {
        Commands::Build(args) => {
            commands::build::run(args, config, raw_args).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_build_flags() {
        let cli = Cli::parse_from([
            "quire",
            "build",
            "--serve",
            "--base-dir",
            "blog",
            "--ws-port",
            "4000",
            "-o",
            "dist",
        ]);

        let Commands::Build(args) = cli.command;
        assert!(args.serve);
        assert!(!args.bundle_info);
        assert_eq!(args.base_dir, "blog");
        assert_eq!(args.port, 8080);
        assert_eq!(args.ws_port, 4000);
        assert_eq!(args.output, PathBuf::from("dist"));
        assert_eq!(cli.config, PathBuf::from("quire.toml"));
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::parse_from(["quire", "build", "--verbose", "--config", "site.toml"]);

        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from("site.toml"));
    }
}
