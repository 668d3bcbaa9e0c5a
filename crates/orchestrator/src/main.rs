//! radcert - Main entry point
//!
//! Renews the RADIUS server certificate (issuer side) and installs it on
//! the RADIUS host (consumer side). Each invocation does one unit of work
//! and prints one JSON line; scheduling is left to a system timer.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};

use radcert::outcome::TriggerReport;
use radcert_config::{Config, DeploymentEnv};

/// radcert - certificate lifecycle for RADIUS servers
#[derive(Parser, Debug)]
#[command(name = "radcert")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        env = "RADCERT_CONFIG",
        default_value = "/etc/radcert/radcert.toml"
    )]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log line format on stderr
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Renew the certificate if it is due and publish it to the store
    Renew {
        /// Renew regardless of remaining validity
        #[arg(long)]
        force: bool,
    },
    /// Install the stored certificate if it changed
    Sync {
        /// Fetch and install even if nothing changed
        #[arg(long)]
        force: bool,
    },
    /// Validate the configuration and the installed certificate
    Check,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Renew { .. } => "renew",
            Commands::Sync { .. } => "sync",
            Commands::Check => "check",
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let command = cli.command.name();
    let report = match load_config(&cli.config) {
        Ok(config) => run(&cli.command, &config).unwrap_or_else(|e| {
            TriggerReport::failure(
                command,
                "runtime_error",
                radcert_common::ErrorClass::Apply,
                format!("{:#}", e),
            )
        }),
        Err(e) => TriggerReport::config_error(command, format!("{:#}", e)),
    };

    println!("{}", report.to_json_line());
    std::process::exit(report.exit_code());
}

/// Logs go to stderr; stdout carries only the report line
fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let mut config = Config::from_file(path)
        .with_context(|| format!("Failed to load configuration file {}", path.display()))?;
    let env = DeploymentEnv::from_process_env().context("Invalid deployment environment")?;
    config.apply_env(env);
    debug!(domain = %config.domain, "Configuration ready");
    Ok(config)
}

fn run(command: &Commands, config: &Config) -> Result<TriggerReport> {
    if let Commands::Check = command {
        return Ok(radcert::app::check(config));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let report = runtime.block_on(async {
        match command {
            Commands::Renew { force } => radcert::app::renew(config, *force).await,
            Commands::Sync { force } => radcert::app::sync(config, *force).await,
            Commands::Check => radcert::app::check(config),
        }
    });

    info!(
        command = report.command,
        outcome = ?report.outcome,
        reason = %report.reason,
        "Finished"
    );
    Ok(report)
}
