//! SentinelSync CLI - PostgreSQL to Cassandra change data capture through Kafka.

use anyhow::Result;
use clap::{Parser, Subcommand};
use sentinel_core::config::LogFormat;
use sentinel_core::{Config, ConsumerError, SourcePosition};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    /// Invalid config file or missing required fields
    ConfigError = 1,
    /// Source database error, including an expired resume position
    SourceError = 2,
    /// Kafka producer or consumer error
    KafkaError = 3,
    /// Wide-column store error
    SinkError = 4,
    /// Checkpoint log error
    CheckpointError = 5,
    /// Dead-letter store error
    DeadLetterError = 6,
    /// Health check failure
    HealthCheckError = 7,
    /// At least one partition failed permanently
    PartitionFailed = 8,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Map an error to an exit code, preferring the typed core error.
    fn from_error(error: &anyhow::Error) -> Self {
        if let Some(core) = error.chain().find_map(|e| e.downcast_ref::<sentinel_core::Error>()) {
            return match core {
                sentinel_core::Error::Config(_) => ExitCode::ConfigError,
                sentinel_core::Error::Capture(_) => ExitCode::SourceError,
                sentinel_core::Error::Publish(_) => ExitCode::KafkaError,
                sentinel_core::Error::Consumer(ConsumerError::PartitionFailed { .. }) => {
                    ExitCode::PartitionFailed
                }
                sentinel_core::Error::Consumer(_) => ExitCode::KafkaError,
                sentinel_core::Error::Sink(_) => ExitCode::SinkError,
                sentinel_core::Error::Checkpoint(_) => ExitCode::CheckpointError,
                sentinel_core::Error::DeadLetter(_) => ExitCode::DeadLetterError,
                sentinel_core::Error::Shutdown => ExitCode::SignalInterrupt,
                sentinel_core::Error::Io(_) | sentinel_core::Error::Serialization(_) => {
                    ExitCode::RuntimeError
                }
            };
        }

        let error_str = error.to_string().to_lowercase();
        if error_str.contains("config") || error_str.contains("toml") {
            ExitCode::ConfigError
        } else if error_str.contains("partition") {
            ExitCode::PartitionFailed
        } else if error_str.contains("health") {
            ExitCode::HealthCheckError
        } else {
            ExitCode::RuntimeError
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "sentinel")]
#[command(about = "PostgreSQL to Cassandra change data capture through Kafka", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run capture and sync in one process
    Run {
        #[command(flatten)]
        overrides: commands::Overrides,

        /// Resume capture strictly after this source position (e.g. 16/B374D848)
        #[arg(long)]
        resume_from: Option<SourcePosition>,
    },

    /// Capture changes from PostgreSQL and publish them to Kafka
    Capture {
        #[command(flatten)]
        overrides: commands::Overrides,

        /// Resume capture strictly after this source position (e.g. 16/B374D848)
        #[arg(long)]
        resume_from: Option<SourcePosition>,
    },

    /// Apply published changes to the sink
    Sync {
        #[command(flatten)]
        overrides: commands::Overrides,

        /// Only consume these partitions (comma separated)
        #[arg(long, value_delimiter = ',')]
        partitions: Vec<i32>,
    },

    /// Show status and health of a running process
    Status {
        /// Health endpoint URL
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,

        /// Metrics endpoint URL
        #[arg(long, default_value = "http://localhost:9090")]
        metrics_url: String,
    },

    /// Inspect and requeue dead-letter records
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },

    /// Validate configuration file
    Validate,
}

#[derive(Subcommand)]
enum DlqAction {
    /// List dead-letter records
    List {
        /// Include records that were already requeued
        #[arg(long)]
        all: bool,

        /// Print records as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Republish a record's event to the log
    Requeue {
        /// Record id
        id: uuid::Uuid,
    },
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Log format comes from the config when it parses; JSON otherwise
    let log_format = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring.log_format)
        .unwrap_or(LogFormat::Json);

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

async fn execute_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run {
            overrides,
            resume_from,
        } => {
            let config = load_config(&cli.config, &overrides)?;
            commands::pipeline::run(config, resume_from).await?;
        }

        Commands::Capture {
            overrides,
            resume_from,
        } => {
            let config = load_config(&cli.config, &overrides)?;
            commands::pipeline::capture(config, resume_from).await?;
        }

        Commands::Sync {
            overrides,
            partitions,
        } => {
            let mut config = load_config(&cli.config, &overrides)?;
            if !partitions.is_empty() {
                config.sync.partitions = partitions;
            }
            commands::pipeline::sync(config).await?;
        }

        Commands::Status { url, metrics_url } => {
            commands::status::run(&url, &metrics_url).await?;
        }

        Commands::Dlq { action } => {
            let config = load_config(&cli.config, &commands::Overrides::default())?;
            match action {
                DlqAction::List { all, json } => commands::dlq::list(&config, all, json)?,
                DlqAction::Requeue { id } => commands::dlq::requeue(&config, id).await?,
            }
        }

        Commands::Validate => {
            let config = load_config(&cli.config, &commands::Overrides::default())?;
            config.validate()?;
            println!("Configuration is valid");
        }
    }

    Ok(())
}

/// Load the config file, apply environment then command-line overrides.
fn load_config(path: &Option<PathBuf>, overrides: &commands::Overrides) -> Result<Config> {
    let path = path.clone().unwrap_or_else(|| PathBuf::from("config.toml"));
    let mut config = Config::from_file(&path)?;
    overrides.apply(&mut config);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::CaptureError;

    #[test]
    fn test_exit_code_from_core_errors() {
        let err = anyhow::Error::from(sentinel_core::Error::Config("bad".into()));
        assert_eq!(ExitCode::from_error(&err), ExitCode::ConfigError);

        let err = anyhow::Error::from(sentinel_core::Error::from(CaptureError::SourceUnavailable {
            position: "0/10".into(),
            reason: "gone".into(),
        }));
        assert_eq!(ExitCode::from_error(&err), ExitCode::SourceError);

        let err = anyhow::Error::from(sentinel_core::Error::from(ConsumerError::PartitionFailed {
            partition: 3,
            reason: "offset out of range".into(),
        }))
        .context("sync failed");
        assert_eq!(ExitCode::from_error(&err), ExitCode::PartitionFailed);
    }

    #[test]
    fn test_exit_code_from_message() {
        let err = anyhow::anyhow!("2 partitions failed");
        assert_eq!(ExitCode::from_error(&err), ExitCode::PartitionFailed);
        let err = anyhow::anyhow!("something else");
        assert_eq!(ExitCode::from_error(&err), ExitCode::RuntimeError);
    }

    #[test]
    fn test_cli_parses_dlq_requeue() {
        let cli = Cli::parse_from([
            "sentinel",
            "--config",
            "c.toml",
            "dlq",
            "requeue",
            "67e55044-10b1-426f-9247-bb680e5fe0c8",
        ]);
        assert!(matches!(
            cli.command,
            Commands::Dlq {
                action: DlqAction::Requeue { .. }
            }
        ));
    }

    #[test]
    fn test_cli_parses_resume_position() {
        let cli = Cli::parse_from(["sentinel", "capture", "--resume-from", "16/B374D848"]);
        match cli.command {
            Commands::Capture { resume_from, .. } => {
                assert_eq!(resume_from, Some("16/B374D848".parse().unwrap()));
            }
            _ => panic!("expected capture"),
        }
    }
}
