/*
* VM Lifecycle Manager Command Line Interface
* -------------------------------------------
* @project: vm-lifecycle-manager
*
* Git-style subcommands on top of clap (because life's too short for getopt):
*
* vm-manager
* ├── serve [--port]          // Boots the HTTP API and the lifecycle simulator
* ├── init [--force]          // Writes config/default.toml from the defaults
* └── check-config            // Loads + validates config, prints what it got
*
* Global flag: --config <file> swaps the config/ directory lookup for one file.
*
* Logging comes from the [logging] section, RUST_LOG wins if set.
* Colored output for the human-facing bits (red = bad, green = good).
*/

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::settings::LoggingSettings;
use crate::config::Settings;

#[derive(Parser)]
#[command(name = "vm-manager")]
#[command(about = "VM lifecycle management API", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, value_name = "CONFIG", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
    /// Load and validate the configuration without starting anything
    CheckConfig,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => handle_init_command(Path::new("config"), force),
        Commands::CheckConfig => {
            let settings = load_settings(cli.config.as_ref())?;
            print_settings(&settings);
            Ok(())
        }
        Commands::Serve { port } => {
            let settings = load_settings(cli.config.as_ref())?;
            init_tracing(&settings.logging);

            let server_port = port.unwrap_or(settings.server.port);
            info!("Starting server on port {}", server_port);
            crate::run_server(settings, server_port).await
        }
    }
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    let settings = match path {
        Some(path) => Settings::new_from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Settings::new().context("failed to load configuration")?,
    };
    Ok(settings)
}

/// Installs the global subscriber. Safe to call more than once; later calls are ignored.
pub fn init_tracing(logging: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };

    if installed.is_err() {
        eprintln!("{} tracing subscriber already installed", "!".yellow());
    }
}

fn handle_init_command(config_dir: &Path, force: bool) -> Result<()> {
    let target = config_dir.join("default.toml");
    if target.exists() && !force {
        anyhow::bail!("{} already exists, use --force to overwrite", target.display());
    }

    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("failed to create {}", config_dir.display()))?;
    let default_config = crate::config::generate_default_config();
    let config_str = toml::to_string_pretty(&default_config)?;
    std::fs::write(&target, config_str)
        .with_context(|| format!("failed to write {}", target.display()))?;

    println!("{} Default configuration generated at {}", "✓".green(), target.display());
    Ok(())
}

fn print_settings(settings: &Settings) {
    let on_off = |flag: bool| if flag { "on".green() } else { "off".red() };
    let storage = if settings.database.url.is_empty() {
        "in-memory".to_string()
    } else {
        settings.database.url.clone()
    };

    println!("{} Configuration is valid", "✓".green());
    println!("  {:<14} {}", "listen".bold(), settings.address());
    println!("  {:<14} {}", "mode".bold(), settings.server.mode);
    println!("  {:<14} {}", "api prefix".bold(), settings.server.api_prefix);
    println!("  {:<14} {}", "storage".bold(), storage);
    println!("  {:<14} {}", "seed".bold(), on_off(settings.database.seed));
    println!("  {:<14} {}", "auth".bold(), on_off(settings.auth.enabled));
    println!(
        "  {:<14} {} ({} rps, burst {})",
        "rate limit".bold(),
        on_off(settings.rate_limit.enabled),
        settings.rate_limit.requests_per_second,
        settings.rate_limit.burst
    );
    println!(
        "  {:<14} {} ({})",
        "metrics".bold(),
        on_off(settings.metrics.enabled),
        settings.metrics.path
    );
    println!(
        "  {:<14} {} cores / {} MB / {} GB, {} VMs",
        "limits".bold(),
        settings.limits.max_cpu_cores,
        settings.limits.max_ram_mb,
        settings.limits.max_disk_gb,
        settings.limits.max_vms
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_accepts_port_and_global_config() {
        let cli = Cli::try_parse_from(["vm-manager", "serve", "--port", "9090", "--config", "x.toml"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(matches!(cli.command, Commands::Serve { port: Some(9090) }));
    }

    #[test]
    fn check_config_is_kebab_case() {
        let cli = Cli::try_parse_from(["vm-manager", "check-config"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckConfig));
    }

    #[test]
    fn init_refuses_to_clobber_without_force() {
        let dir = std::env::temp_dir().join(format!("vm-manager-init-{}", uuid::Uuid::new_v4()));

        handle_init_command(&dir, false).unwrap();
        let written = std::fs::read_to_string(dir.join("default.toml")).unwrap();
        assert!(written.contains("api_prefix"));

        let err = handle_init_command(&dir, false).unwrap_err();
        assert!(err.to_string().contains("--force"));
        handle_init_command(&dir, true).unwrap();

        std::fs::remove_dir_all(&dir).ok();
    }
}
