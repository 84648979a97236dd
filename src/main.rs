//! Keel - a compose lifecycle manager
//!
//! This is the main CLI entry point for Keel.

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use keel::backup::{FileSnapshotStore, SnapshotStore};
use keel::compose::{to_yaml, ComposeParser, Generator};
use keel::lifecycle::CancelToken;
use keel::runtime::docker::DockerCompose;
use keel::{Controller, LifecycleResult, ManagerConfig, Spec};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Keel - guarded deployments for compose projects
#[derive(Parser)]
#[command(name = "keel")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Guarded compose deployments", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Manager configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured project name
    #[arg(short, long, global = true)]
    project: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a compose file without applying it
    Propose {
        /// Compose file or a directory containing one
        file: PathBuf,
    },

    /// Validate, back up, diff, apply and verify a compose file
    Apply {
        /// Compose file or a directory containing one
        file: PathBuf,
        /// Reason recorded with the snapshot and audit trail
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Re-apply a stored snapshot
    Rollback {
        /// Snapshot id
        snapshot_id: String,
    },

    /// Show what applying a compose file would change
    Diff {
        /// Compose file or a directory containing one
        file: PathBuf,
    },

    /// Show how the running project drifted from the applied spec
    Status,

    /// Remove everything the applied spec created
    Teardown {
        /// Reason recorded with the snapshot and audit trail
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Manage stored snapshots
    Snapshots {
        #[command(subcommand)]
        command: SnapshotCommands,
    },

    /// Generate a compose file from a JSON list of service requests
    Generate {
        /// JSON file of service requests
        file: PathBuf,
        /// Value of the environment label
        #[arg(short, long, default_value = "development")]
        environment: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// List snapshots, oldest first
    List {
        /// Only snapshots created at or after this RFC 3339 time
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },
    /// Delete all but the newest snapshots
    Prune {
        /// Number of snapshots to keep
        #[arg(long, default_value_t = 10)]
        keep: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = ManagerConfig::load_or_default(cli.config.as_deref())?;
    if let Some(project) = cli.project {
        config.project = project;
        config.validate()?;
    }

    if let Commands::Generate {
        file,
        environment,
        output,
    } = &cli.command
    {
        return generate(file, environment, output.as_deref());
    }

    let store = Arc::new(FileSnapshotStore::new(config.backup_dir())?);
    let runtime = Arc::new(DockerCompose::new(&config.project, config.compose_dir()));
    let current = runtime.current_spec()?;
    let controller = Controller::new(&config, store.clone(), runtime);
    if let Some(spec) = current {
        controller.adopt(spec)?;
    }

    match cli.command {
        Commands::Propose { file } => {
            let file = compose_file(&file)?;
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let report = controller.propose(&raw)?;
            print_json(&report)?;
            if !report.is_ok() {
                bail!("{} is not a valid spec", file.display());
            }
        }
        Commands::Apply { file, reason } => {
            let spec = load_spec(&file)?;
            let cancel = CancelToken::new();
            let handle = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    match handle.cancel() {
                        Ok(()) => info!("Cancellation requested"),
                        Err(e) => warn!("{}", e),
                    }
                }
            });
            let result = controller
                .apply_with_cancel(spec, reason.as_deref(), &cancel)
                .await?;
            report(&result)?;
        }
        Commands::Rollback { snapshot_id } => {
            let result = controller.rollback(&snapshot_id).await?;
            report(&result)?;
        }
        Commands::Diff { file } => {
            let spec = load_spec(&file)?;
            print!("{}", controller.preview_diff(&spec));
        }
        Commands::Status => match controller.drift().await? {
            Some(drift) if drift.is_noop() => println!("No drift"),
            Some(drift) => print!("{}", drift),
            None => println!("Nothing applied for project {}", controller.project()),
        },
        Commands::Teardown { reason } => {
            let result = controller.teardown(reason.as_deref()).await?;
            report(&result)?;
        }
        Commands::Snapshots { command } => match command {
            SnapshotCommands::List { since } => {
                for record in controller.snapshots(since)? {
                    let reason = record.reason.as_deref().unwrap_or("-");
                    println!("{}  {}  {}", record.id, record.created_at.to_rfc3339(), reason);
                }
            }
            SnapshotCommands::Prune { keep } => {
                let removed = store.prune(keep)?;
                println!("Removed {} snapshot(s)", removed);
            }
        },
        Commands::Generate { .. } => {}
    }

    Ok(())
}

/// `path` itself, or the compose file found in it when it is a directory
fn compose_file(path: &Path) -> anyhow::Result<PathBuf> {
    if !path.is_dir() {
        return Ok(path.to_path_buf());
    }
    match ComposeParser::find_compose_file(path) {
        Some(file) => Ok(file),
        None => bail!("no compose file found in {}", path.display()),
    }
}

fn load_spec(path: &Path) -> anyhow::Result<Spec> {
    let file = compose_file(path)?;
    let env: HashMap<String, String> = std::env::vars().collect();
    ComposeParser::parse_file(&file, &env).with_context(|| format!("loading {}", file.display()))
}

fn generate(file: &Path, environment: &str, output: Option<&Path>) -> anyhow::Result<()> {
    let raw =
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let spec = Generator::new().environment(environment).generate_json(&raw)?;
    let yaml = to_yaml(&spec)?;
    match output {
        Some(path) => {
            std::fs::write(path, yaml).with_context(|| format!("writing {}", path.display()))?;
            info!("Wrote {}", path.display());
        }
        None => print!("{}", yaml),
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report(result: &LifecycleResult) -> anyhow::Result<()> {
    print_json(&result.audit)?;
    if let Some(verification) = &result.audit.verification {
        eprint!("{}", verification);
    }
    if !result.is_success() {
        bail!("{} ended in state {}", result.audit.operation, result.state);
    }
    Ok(())
}
