//! vmctl
//!
//! Interactive controller for Lua VM sessions.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use vmctl::config::{default_config_path, Config};
use vmctl::{logging, profiles, PtyLauncher, Shell, TerminalConsole, UnavailableProvisioner};

/// vmctl - manage interactive Lua VM sessions from one console.
#[derive(Parser, Debug)]
#[command(name = "vmctl")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (also to stderr)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute (default: shell)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the interactive operator shell
    Shell,

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),

    /// List known environment profiles
    Profiles,
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },

    /// Print the configuration file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    // Load configuration
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    match cli.command.unwrap_or(Commands::Shell) {
        Commands::Shell => run_shell(config, cli.verbose).await,

        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }

        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote default configuration to {}", config_path.display());
            Ok(())
        }

        Commands::Config(ConfigCommands::Path) => {
            println!("{}", config_path.display());
            Ok(())
        }

        Commands::Profiles => {
            print!("{}", profiles::render_catalog());
            Ok(())
        }
    }
}

async fn run_shell(config: Config, verbose: bool) -> anyhow::Result<()> {
    config.validate().context("Invalid configuration")?;

    let _log_guard = logging::init(&config.logging, verbose)?;
    tracing::info!(
        interpreter = %config.runtime.interpreter,
        max_vms = config.registry.max_vms,
        "vmctl starting"
    );

    let launcher = PtyLauncher::from_config(&config.runtime);
    let mut shell = Shell::new(config, launcher, UnavailableProvisioner);
    let mut console = TerminalConsole::new();

    tokio::select! {
        _ = shell.run(&mut console) => {}
        _ = wait_for_terminate_signal() => {
            tracing::info!("Received SIGTERM");
            shell.shutdown(&mut console);
        }
    }

    Ok(())
}

/// Wait for SIGTERM. Ctrl-C is handled by the console.
async fn wait_for_terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}
