//! Backup Orchestrator - Main entry point
//!
//! `backup {backup|restore <artifact>|list|cleanup|verify <artifact>}`

use anyhow::Result;
use backup_orchestrator::restore::confirm::{AssumeYes, ConfirmationProvider, StdinConfirmation};
use backup_orchestrator::retention::StoredArtifact;
use backup_orchestrator::{utils, BackupError, Config, Orchestrator};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one full backup cycle
    Backup,
    /// Restore live state from an artifact
    Restore {
        /// Artifact file name, timestamped name or path
        artifact: String,
        /// Skip the interactive confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// List local and remote artifacts
    List,
    /// Enforce retention and remove abandoned working directories
    Cleanup,
    /// Check that an artifact is complete and readable
    Verify {
        artifact: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!(
        "backup-orchestrator v{} (project: {})",
        env!("CARGO_PKG_VERSION"),
        config.project.dir.display()
    );

    let orchestrator = Orchestrator::from_config(config);

    match args.command {
        Command::Backup => match orchestrator.run_backup().await {
            Ok(report) => {
                println!("Backup completed in {}s", report.duration.as_secs());
                print!("{}", report.summary());
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => failed("Backup", &e),
        },
        Command::Restore { artifact, yes } => {
            let confirmation: Arc<dyn ConfirmationProvider> = if yes {
                Arc::new(AssumeYes)
            } else {
                Arc::new(StdinConfirmation)
            };
            match orchestrator.restore(&artifact, confirmation).await {
                Ok(session) => {
                    println!("Restore completed from {}", session.artifact.display());
                    for (kind, outcome) in &session.components {
                        println!("  {:<9} {:?}", kind, outcome);
                    }
                    if let Some(snapshot) = &session.safety_snapshot {
                        println!("Safety snapshot: {}", snapshot.display());
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(BackupError::RestoreDeclined) => {
                    println!("Restore cancelled; nothing was changed");
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => failed("Restore", &e),
            }
        }
        Command::List => {
            let listing = orchestrator.list().await?;
            println!("Local ({}):", listing.local.len());
            print_artifacts(&listing.local);
            if let Some(remote) = &listing.remote {
                println!("Remote ({}):", remote.len());
                print_artifacts(remote);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Cleanup => match orchestrator.cleanup().await {
            Ok(report) => {
                println!(
                    "Cleanup removed {} local, {} remote artifact(s) and {} stale director(ies)",
                    report.local_deleted.len(),
                    report.remote_deleted.len(),
                    report.stale_dirs.len()
                );
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => failed("Cleanup", &e),
        },
        Command::Verify { artifact } => match orchestrator.verify(&artifact).await {
            Ok(report) => {
                println!(
                    "{} is valid: {} entries, {} bytes",
                    report.path.display(),
                    report.entries,
                    report.size_bytes
                );
                if let Some(manifest) = &report.manifest {
                    println!("  created:    {}", manifest.created_at.to_rfc3339());
                    println!("  host:       {}", manifest.host);
                    println!("  components: {:?}", manifest.included());
                }
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => failed("Verification", &e),
        },
    }
}

fn failed(what: &str, error: &BackupError) -> Result<ExitCode> {
    tracing::error!("{} failed: {}", what, error);
    eprintln!("{} FAILED: {}", what, error);
    Ok(ExitCode::FAILURE)
}

fn print_artifacts(artifacts: &[StoredArtifact]) {
    let now = Utc::now();
    for artifact in artifacts {
        let age = now.signed_duration_since(artifact.created_at);
        println!(
            "  {:<36} {:>12} bytes  {:>4}h ago",
            artifact.name,
            artifact.size_bytes,
            age.num_hours()
        );
    }
}
