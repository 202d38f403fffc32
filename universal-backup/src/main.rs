//! Universal Backup - Main entry point
//!
//! Exit status: 0 success, 1 failure, 2 partial success or integrity warning.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};
use universal_backup::checksum::Verification;
use universal_backup::config::Config;
use universal_backup::executor::capture::NativeCapture;
use universal_backup::manifest::{BackupType, ManifestStore};
use universal_backup::orchestrator::{BackupRequest, Orchestrator, EXIT_FAILURE, EXIT_SUCCESS};
use universal_backup::restore::confirm::TerminalConfirmation;
use universal_backup::restore::replay::NativeReplay;
use universal_backup::restore::{RestoreEngine, RestoreMode, RestoreOutcome, LATEST};
use universal_backup::storage::BackendRegistry;
use universal_backup::transfer::format_bytes;
use universal_backup::utils::shutdown::ShutdownCoordinator;
use universal_backup::{notify, utils};

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
    /// Create a backup and ship it to the selected backends
    Backup {
        /// full, incremental or differential
        #[arg(long = "type", default_value = "full")]
        backup_type: BackupType,

        /// Backend names, or "all" (default: every configured backend)
        #[arg(long = "backend", value_name = "NAME")]
        backends: Vec<String>,

        /// Show what would be backed up without capturing anything
        #[arg(long)]
        dry_run: bool,

        /// Create the artifact locally only
        #[arg(long)]
        no_upload: bool,

        /// Skip retention after upload
        #[arg(long)]
        no_rotation: bool,

        /// Keep the local artifact after upload
        #[arg(long)]
        keep_local: bool,
    },

    /// List backups stored on a backend, newest first
    List {
        #[arg(long)]
        backend: String,
    },

    /// Download, verify and replay a backup
    Restore {
        #[arg(long)]
        backend: String,

        /// Exact backup name, or "latest"
        #[arg(long, default_value = LATEST)]
        backup: String,

        /// Device or directory to overwrite (default: the backup's source)
        #[arg(long)]
        target: Option<PathBuf>,

        /// Download and verify only; never write to the target
        #[arg(long)]
        verify_only: bool,

        /// Resolve the target without writing
        #[arg(long)]
        dry_run: bool,

        /// Refuse instead of prompting for confirmation
        #[arg(long)]
        non_interactive: bool,

        /// Keep the downloaded artifact
        #[arg(long)]
        keep_local: bool,
    },

    /// List manifests in the local manifest store
    Manifests,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    let config = Config::load(args.config.as_deref()).context("loading configuration")?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let run_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("run", run_id = %run_id);

    info!(
        parent: &span,
        "Starting universal-backup v{} (server_id: {})",
        env!("CARGO_PKG_VERSION"),
        config.general.server_id
    );

    let shutdown = ShutdownCoordinator::new();
    shutdown.install();
    let cancel = shutdown.token();

    dispatch(args.command, config, cancel).instrument(span).await
}

async fn dispatch(command: Command, config: Config, cancel: CancellationToken) -> Result<i32> {
    match command {
        Command::Backup {
            backup_type,
            backends,
            dry_run,
            no_upload,
            no_rotation,
            keep_local,
        } => {
            let config = Arc::new(config);
            let store = Arc::new(ManifestStore::open(&config.paths.manifest_dir)?);
            let registry = BackendRegistry::from_config(&config, &backends).await?;
            let notifier = notify::from_config(&config.general);

            let orchestrator = Orchestrator::new(
                config,
                store,
                registry,
                Arc::new(NativeCapture::new()),
                notifier,
            )
            .with_cancel(cancel);

            let request = BackupRequest {
                backup_type,
                dry_run,
                no_upload,
                no_rotation,
                keep_local,
            };
            let report = orchestrator.run(&request).await?;
            println!("{}", report.summary());
            Ok(report.exit_code())
        }

        Command::List { backend } => {
            let registry = BackendRegistry::from_config(&config, &[backend.clone()]).await?;
            let blobs = registry.get(&backend)?.list().await?;
            if blobs.is_empty() {
                println!("No backups on {}", backend);
            }
            for blob in blobs {
                println!(
                    "{:<60} {:>12} {}",
                    blob.name,
                    format_bytes(blob.size),
                    blob.last_modified.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            Ok(EXIT_SUCCESS)
        }

        Command::Restore {
            backend,
            backup,
            target,
            verify_only,
            dry_run,
            non_interactive,
            keep_local,
        } => {
            let registry = BackendRegistry::from_config(&config, &[backend.clone()]).await?;
            let engine = RestoreEngine::new(
                registry.get(&backend)?,
                Arc::new(NativeReplay::new()),
                config.paths.scratch_dir.clone(),
            )
            .with_cancel(cancel);

            let mut verified = engine.download_and_verify(&backup).await?;
            verified.keep_local(keep_local);

            match verified.verification() {
                Verification::Passed { checksum } => {
                    println!("{}: checksum OK ({})", verified.blob().name, checksum)
                }
                Verification::Skipped { reason } => {
                    println!("{}: NOT verified ({})", verified.blob().name, reason)
                }
            }
            if verify_only {
                if keep_local {
                    println!("Downloaded to {}", verified.path().display());
                }
                return Ok(EXIT_SUCCESS);
            }

            let mode = if dry_run {
                RestoreMode::DryRun
            } else if non_interactive {
                RestoreMode::NonInteractive
            } else {
                RestoreMode::Interactive
            };

            match engine
                .restore(&verified, target.as_deref(), mode, &TerminalConfirmation)
                .await?
            {
                RestoreOutcome::Restored {
                    target,
                    bytes_written,
                } => println!(
                    "Restored {} onto {} ({})",
                    verified.blob().name,
                    target.display(),
                    format_bytes(bytes_written)
                ),
                RestoreOutcome::DryRun { target } => println!(
                    "Dry run: {} would be restored onto {}",
                    verified.blob().name,
                    target.display()
                ),
            }
            Ok(EXIT_SUCCESS)
        }

        Command::Manifests => {
            let store = ManifestStore::open(&config.paths.manifest_dir)?;
            let manifests = store.load_all()?;
            if manifests.is_empty() {
                println!("No manifests in {}", store.dir().display());
            }
            for m in manifests {
                println!(
                    "{:<60} {:<12} {:>12} {}",
                    m.filename,
                    m.backup_type.as_str(),
                    format_bytes(m.size_bytes),
                    m.base_manifest.as_deref().unwrap_or("-")
                );
            }
            Ok(EXIT_SUCCESS)
        }
    }
}
