//! Database Backup/Restore Tool
//!
//! Verified, compressed backups with off-site copies and retention, and
//! guarded restores that always leave a way back.

// dbvault/src/main.rs
mod artifact;
mod backup;
mod config;
mod context;
mod datastore;
mod errors;
mod notify;
mod restore;
mod retention;
mod secrets;
mod storage;
mod utils;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use artifact::{ArtifactName, BackupArtifact, BackupScope, list_local_artifacts};
use backup::{BackupOrchestrator, GzipDumpProducer, verify_artifact, verify_in_place};
use config::{AppConfig, RemoteConfig, load_backup_config_from_json, load_restore_config_from_json};
use datastore::{PostgresStore, open_postgres};
use notify::{CommandNotifier, LogNotifier, Notifier};
use restore::{GzipReplayer, RestoreOptions, RestoreOrchestrator, RestoreOutcome, RestoreSelection, StdinConfirmer};
use retention::{LocalArtifactDir, RemoteArtifactSet};
use secrets::EnvSecretsProvider;
use storage::{ArchiveStore, FsArchiveStore, S3ArchiveStore};

#[derive(Parser, Debug)]
#[command(name = "dbvault", version, about = "Verified database backups and guarded restores")]
struct Cli {
    /// Path to config.json
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dump, verify, upload and prune
    Backup {
        /// Dump table definitions only, without row data
        #[arg(long)]
        schema_only: bool,
        /// Keep the artifact local even if a remote store is configured
        #[arg(long)]
        no_upload: bool,
    },
    /// Replace the target database with the contents of a backup
    #[command(group(ArgGroup::new("source").required(true).args(["path", "from_remote", "latest"])))]
    Restore {
        /// Local artifact to restore
        path: Option<PathBuf>,
        /// Remote key to download and restore
        #[arg(long, value_name = "KEY")]
        from_remote: Option<String>,
        /// Restore the newest local artifact
        #[arg(long)]
        latest: bool,
        /// Do not snapshot the target before replacing it
        #[arg(long)]
        no_safety_backup: bool,
        /// Skip the interactive confirmation
        #[arg(long)]
        force: bool,
    },
    /// Show available artifacts, newest first
    List {
        /// List the remote store instead of the local directory
        #[arg(long)]
        remote: bool,
    },
    /// Check an artifact's integrity
    Verify { path: PathBuf },
    /// Apply the retention policy without taking a backup
    Prune,
}

/// Main entry point for the backup/restore tool
#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    // Dropping the run future on Ctrl-C kills child processes and removes
    // partial files through their drop guards.
    tokio::select! {
        result = run_app(cli) => match result {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::FAILURE,
            Err(e) => {
                tracing::error!("❌ Error: {:#}", e);
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("🛑 Interrupted, cancelling the running operation");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Returns whether the operation succeeded.
async fn run_app(cli: Cli) -> Result<bool> {
    let mut app_config = AppConfig::load_from_json(&cli.config)
        .with_context(|| format!("Failed to load application configuration from {}", cli.config.display()))?;
    let secrets = EnvSecretsProvider::with_dotenv("");
    app_config.resolve_remote(&secrets)?;

    let remote = connect_remote(&app_config).await;
    let notifier: Box<dyn Notifier> = match &app_config.notify_command {
        Some(argv) => Box::new(CommandNotifier::new(argv.clone())?),
        None => Box::new(LogNotifier),
    };

    match cli.command {
        Commands::Backup { schema_only, no_upload } => {
            let backup_config = load_backup_config_from_json(&app_config, no_upload)
                .context("Failed to load backup configuration from JSON")?;
            let store = open_postgres(&secrets, &app_config.database_url_secret);
            let scope = if schema_only { BackupScope::SchemaOnly } else { BackupScope::Full };

            let orchestrator = BackupOrchestrator {
                config: &backup_config,
                store: store.as_ref(),
                remote: remote.as_deref(),
                producer: &GzipDumpProducer,
                notifier: notifier.as_ref(),
            };
            let result = orchestrator.run(scope).await?;
            println!("✅ Backup: {}", result.artifact.local_path.display());
            if let Some(sha) = &result.artifact.sha256 {
                println!("   sha256: {}", sha);
            }
            match &result.artifact.remote_key {
                Some(key) => println!("   uploaded: {}", key),
                None => println!("   uploaded: false"),
            }
            for report in &result.retention {
                println!("   retention: {}", report.summary());
            }
            for warning in &result.warnings {
                println!("⚠️ {}", warning);
            }
            println!("   run: {}", result.run_id);
            Ok(true)
        }
        Commands::Restore {
            path,
            from_remote,
            latest,
            no_safety_backup,
            force,
        } => {
            let restore_config = load_restore_config_from_json(&app_config)
                .context("Failed to load restore configuration from JSON")?;
            let store = open_postgres(&secrets, &app_config.database_url_secret);
            let selection = match (path, from_remote) {
                (Some(path), _) => RestoreSelection::LocalPath(path),
                (None, Some(key)) => RestoreSelection::RemoteKey(key),
                (None, None) if latest => RestoreSelection::Latest,
                (None, None) => anyhow::bail!("a restore source is required"),
            };
            let options = RestoreOptions {
                selection,
                force,
                skip_safety_backup: no_safety_backup,
                invocation: format!("dbvault --config {}", cli.config.display()),
            };

            let orchestrator = RestoreOrchestrator {
                config: &restore_config,
                store: store.as_ref(),
                remote: remote.as_deref(),
                producer: &GzipDumpProducer,
                restorer: &GzipReplayer,
                confirmer: &StdinConfirmer,
                notifier: notifier.as_ref(),
            };
            let report = orchestrator.run(&options).await;
            let trail: Vec<String> = report.history.iter().map(ToString::to_string).collect();
            println!("Restore outcome: {} ({})", report.outcome.label(), trail.join(" → "));
            match &report.outcome {
                RestoreOutcome::Success { unverified: Some(reason) } => println!("⚠️ {}", reason),
                RestoreOutcome::Success { unverified: None } => {}
                RestoreOutcome::AbortedBeforeDestruction(e) => println!("❌ {}", e),
                RestoreOutcome::FailedDuringDestruction(e) => println!("🚨 {}", e),
            }
            if let Some(safety) = &report.safety_backup {
                println!("Safety backup: {}", safety.display());
            }
            for warning in &report.warnings {
                println!("⚠️ {}", warning);
            }
            println!("Run: {}", report.run_id);
            Ok(report.outcome.is_success())
        }
        Commands::List { remote: list_remote } => {
            let namespace = &app_config.namespace;
            if list_remote {
                let store = remote
                    .as_deref()
                    .context("No remote store configured (set s3_storage or remote_dir in config.json)")?;
                println!("Remote artifacts in {}:", store.describe());
                for ns in [namespace.clone(), format!("{}-pre-restore", namespace)] {
                    for item in store.list(&ns).await?.into_iter().rev() {
                        println!("  {}  {:<11} {:>12} bytes", item.key, item.name.scope.as_str(), item.size_bytes);
                    }
                }
            } else {
                let dir = load_backup_config_from_json(&app_config, true)?.local_backup_dir;
                println!("Local artifacts in {}:", dir.display());
                for ns in [namespace.clone(), format!("{}-pre-restore", namespace)] {
                    for (name, path) in list_local_artifacts(&dir, &ns)?.into_iter().rev() {
                        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                        println!("  {}  {:<11} {:>12} bytes", name, name.scope.as_str(), size);
                    }
                }
            }
            Ok(true)
        }
        Commands::Verify { path } => Ok(verify_one(&path)),
        Commands::Prune => {
            let backup_config = load_backup_config_from_json(&app_config, true)?;
            let now = Utc::now();
            let mut clean = true;
            for ns in [backup_config.namespace.clone(), format!("{}-pre-restore", backup_config.namespace)] {
                let local = LocalArtifactDir {
                    dir: backup_config.local_backup_dir.clone(),
                    namespace: ns.clone(),
                };
                let report = retention::prune(&local, backup_config.retention.local_max_age(), now).await;
                println!("{} [{}]", report.summary(), ns);
                clean &= report.is_clean();

                if let Some(store) = remote.as_deref() {
                    let set = RemoteArtifactSet { store, namespace: ns.clone() };
                    let report = retention::prune(&set, backup_config.retention.remote_max_age(), now).await;
                    println!("{} [{}]", report.summary(), ns);
                    clean &= report.is_clean();
                }
            }
            Ok(clean)
        }
    }
}

async fn connect_remote(app_config: &AppConfig) -> Option<Box<dyn ArchiveStore>> {
    match &app_config.remote {
        Some(RemoteConfig::Spaces(spaces)) => Some(Box::new(S3ArchiveStore::connect(spaces).await)),
        Some(RemoteConfig::Directory(dir)) => Some(Box::new(FsArchiveStore::new(dir.clone(), None))),
        None => None,
    }
}

fn verify_one(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()).and_then(ArtifactName::parse) else {
        let result = verify_artifact(path, PostgresStore::DUMP_MARKER);
        match &result.reason {
            None => println!("✅ {} is valid", path.display()),
            Some(reason) => println!("❌ {} is invalid: {}", path.display(), reason),
        }
        return result.valid;
    };

    let mut artifact = BackupArtifact::local(name, path.to_path_buf());
    let result = verify_in_place(&mut artifact, PostgresStore::DUMP_MARKER);
    match &result.reason {
        None => println!(
            "✅ {} is valid ({} backup of '{}' taken {}, {} bytes)",
            path.display(),
            artifact.name.scope.as_str(),
            artifact.name.namespace,
            artifact.name.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            artifact.size_bytes
        ),
        Some(reason) => println!("❌ {} is invalid: {}", path.display(), reason),
    }
    artifact.is_valid()
}
