// dbvault/src/restore/logic.rs
use std::path::{Path, PathBuf};

use super::db_restore::Restorer;
use super::session::{ConfirmationState, Confirmer, RestoreSession, RestoreState};
use super::verification::verify_restored_target;
use crate::artifact::{BackupScope, latest_local_artifact};
use crate::backup::{BackupOrchestrator, DumpProducer, verify_artifact};
use crate::config::RestoreConfig;
use crate::context::{RunContext, StepStatus};
use crate::datastore::DataStore;
use crate::errors::{PipelineError, Result};
use crate::notify::{Metadata, Notifier, NotifyStatus};
use crate::storage::{self, ArchiveStore};

/// Where the artifact to restore comes from. Exactly one per invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSelection {
    LocalPath(PathBuf),
    RemoteKey(String),
    /// Newest local artifact of the configured namespace.
    Latest,
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub selection: RestoreSelection,
    pub force: bool,
    pub skip_safety_backup: bool,
    /// Command prefix used when printing retry and rollback instructions.
    pub invocation: String,
}

#[derive(Debug)]
pub enum RestoreOutcome {
    /// `unverified` carries the reason when the post-restore check was
    /// inconclusive.
    Success { unverified: Option<String> },
    /// Nothing on the target was touched.
    AbortedBeforeDestruction(PipelineError),
    /// The target was modified and needs operator attention.
    FailedDuringDestruction(PipelineError),
}

impl RestoreOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RestoreOutcome::Success { unverified: None } => "success",
            RestoreOutcome::Success { unverified: Some(_) } => "restored-but-unverified",
            RestoreOutcome::AbortedBeforeDestruction(_) => "aborted-before-destruction",
            RestoreOutcome::FailedDuringDestruction(_) => "failed-during-destruction",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RestoreOutcome::Success { .. })
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            RestoreOutcome::Success { .. } => None,
            RestoreOutcome::AbortedBeforeDestruction(e) | RestoreOutcome::FailedDuringDestruction(e) => Some(e),
        }
    }
}

#[derive(Debug)]
pub struct RestoreReport {
    pub run_id: String,
    pub outcome: RestoreOutcome,
    pub source: Option<PathBuf>,
    pub safety_backup: Option<PathBuf>,
    pub history: Vec<RestoreState>,
    pub warnings: Vec<String>,
}

/// Drives one restore through the forward-only state machine in
/// `session`. A failed replay is reported, never rolled back automatically.
pub struct RestoreOrchestrator<'a> {
    pub config: &'a RestoreConfig,
    pub store: &'a dyn DataStore,
    pub remote: Option<&'a dyn ArchiveStore>,
    pub producer: &'a dyn DumpProducer,
    pub restorer: &'a dyn Restorer,
    pub confirmer: &'a dyn Confirmer,
    pub notifier: &'a dyn Notifier,
}

impl RestoreOrchestrator<'_> {
    pub async fn run(&self, options: &RestoreOptions) -> RestoreReport {
        let mut ctx = RunContext::new(&self.config.namespace);
        let mut session = RestoreSession::new();
        let mut source = None;
        tracing::info!("🚀 Starting restore run {} into '{}'", ctx.run_id, self.store.name());

        let outcome = match self.drive(&mut ctx, &mut session, options, &mut source).await {
            Ok(unverified) => RestoreOutcome::Success { unverified },
            Err(e) => {
                session.abort();
                if session.destructive_started() || e.is_destructive() {
                    RestoreOutcome::FailedDuringDestruction(e)
                } else {
                    RestoreOutcome::AbortedBeforeDestruction(e)
                }
            }
        };

        match &outcome {
            RestoreOutcome::Success { unverified: None } => {
                tracing::info!("🎉 Restore into '{}' completed", self.store.name())
            }
            RestoreOutcome::Success { unverified: Some(reason) } => {
                tracing::warn!("⚠️ Restore into '{}' completed but is unverified: {}", self.store.name(), reason)
            }
            RestoreOutcome::AbortedBeforeDestruction(e) => {
                tracing::error!("❌ Restore aborted, '{}' was not modified: {}", self.store.name(), e)
            }
            RestoreOutcome::FailedDuringDestruction(e) => {
                tracing::error!("🚨 Restore failed after '{}' was modified: {}", self.store.name(), e)
            }
        }

        tracing::debug!("restore run {} ended in {}", ctx.run_id, session.state());
        let report = RestoreReport {
            run_id: ctx.run_id.clone(),
            outcome,
            source,
            safety_backup: session.safety_backup().map(Path::to_path_buf),
            history: session.history().to_vec(),
            warnings: ctx.warnings.clone(),
        };
        self.notify(&report).await;
        report
    }

    async fn drive(
        &self,
        ctx: &mut RunContext,
        session: &mut RestoreSession,
        options: &RestoreOptions,
        source_out: &mut Option<PathBuf>,
    ) -> Result<Option<String>> {
        self.store
            .credentials()
            .map_err(|e| PipelineError::Prerequisite(format!("{:#}", e)))?;

        // SOURCE_RESOLVED
        ctx.begin("resolve_source");
        let source = self.resolve_source(&options.selection).await?;
        tracing::info!("📦 Restore source: {}", source.display());
        ctx.record("resolve_source", StepStatus::Ok, source.display().to_string());
        *source_out = Some(source.clone());
        session.advance(RestoreState::SourceResolved)?;

        // VERIFIED
        ctx.begin("verify");
        let path = source.clone();
        let marker = self.store.dump_marker();
        let verdict = tokio::task::spawn_blocking(move || verify_artifact(&path, marker))
            .await
            .map_err(|e| PipelineError::Prerequisite(format!("verification task panicked: {}", e)))?;
        if !verdict.valid {
            return Err(PipelineError::Verification {
                path: source,
                reason: verdict.reason.unwrap_or_else(|| "unknown".to_string()),
            });
        }
        ctx.record("verify", StepStatus::Ok, "artifact is intact");
        session.advance(RestoreState::Verified)?;

        // CONFIRMED
        if options.force {
            tracing::warn!("⚠️ Confirmation skipped (--force)");
            session.set_confirmation(ConfirmationState::Forced);
        } else {
            let granted = self
                .confirmer
                .confirm(self.store.name(), &source)
                .await
                .map_err(|e| PipelineError::Prerequisite(format!("could not read confirmation: {:#}", e)))?;
            if !granted {
                session.set_confirmation(ConfirmationState::Declined);
                return Err(PipelineError::ConfirmationDeclined);
            }
            session.set_confirmation(ConfirmationState::Interactive);
        }
        session.advance(RestoreState::Confirmed)?;

        // SAFETY_BACKED_UP
        ctx.begin("safety_backup");
        if options.skip_safety_backup {
            tracing::warn!(
                "⚠️ No safety backup of '{}' will be taken (--no-safety-backup); there is nothing to roll back to",
                self.store.name()
            );
            session.acknowledge_no_safety_backup();
            ctx.warn("safety_backup", "skipped by --no-safety-backup");
        } else {
            let safety_config = self.config.safety_backup_config();
            let safety = BackupOrchestrator {
                config: &safety_config,
                store: self.store,
                remote: self.remote,
                producer: self.producer,
                notifier: self.notifier,
            };
            tracing::info!("🛟 Taking safety backup of '{}'", self.store.name());
            let result = safety
                .run(BackupScope::Full)
                .await
                .map_err(|e| PipelineError::SafetyBackup(e.to_string()))?;
            tracing::info!("✓ Safety backup: {}", result.artifact.local_path.display());
            ctx.record(
                "safety_backup",
                StepStatus::Ok,
                result.artifact.local_path.display().to_string(),
            );
            session.record_safety_backup(result.artifact.local_path);
        }
        session.advance(RestoreState::SafetyBackedUp)?;

        // CONNECTIONS_DRAINED
        ctx.begin("drain_connections");
        match self.store.drain_connections().await {
            Ok(n) => {
                tracing::info!("✓ Terminated {} other session(s) on '{}'", n, self.store.name());
                ctx.record("drain_connections", StepStatus::Ok, format!("{} terminated", n));
            }
            Err(e) => {
                tracing::warn!("⚠️ Could not drain connections to '{}': {:#}", self.store.name(), e);
                ctx.warn("drain_connections", format!("{:#}", e));
            }
        }
        session.advance(RestoreState::ConnectionsDrained)?;

        // TARGET_RESET
        session.begin_destructive()?;
        ctx.begin("reset_target");
        tracing::warn!("🧨 Dropping and recreating '{}'", self.store.name());
        if let Err(e) = self.store.reset_target().await {
            return Err(self.destructive_error("reset", format!("{:#}", e), session, &source, options));
        }
        ctx.record("reset_target", StepStatus::Ok, "target recreated");
        session.advance(RestoreState::TargetReset)?;

        // RESTORED
        ctx.begin("replay");
        let stats = match self
            .restorer
            .replay(self.store, &source, self.config.timeouts.replay)
            .await
        {
            Ok(stats) => stats,
            Err(e) => return Err(self.destructive_error("replay", format!("{:#}", e), session, &source, options)),
        };
        ctx.record("replay", StepStatus::Ok, format!("{} bytes replayed in {:.1}s", stats.bytes, stats.duration.as_secs_f64()));
        session.advance(RestoreState::Restored)?;

        // POST_VERIFIED
        ctx.begin("post_verify");
        let check = verify_restored_target(self.store, self.config.min_objects).await;
        if check.passed {
            ctx.record("post_verify", StepStatus::Ok, check.detail);
            session.advance(RestoreState::PostVerified)?;
            session.advance(RestoreState::Done)?;
            Ok(None)
        } else {
            ctx.warn("post_verify", check.detail.clone());
            session.advance(RestoreState::Done)?;
            Ok(Some(check.detail))
        }
    }

    async fn resolve_source(&self, selection: &RestoreSelection) -> Result<PathBuf> {
        match selection {
            RestoreSelection::LocalPath(path) => {
                if path.is_file() {
                    Ok(path.clone())
                } else {
                    Err(PipelineError::NoBackupFound(format!("{} is not a file", path.display())))
                }
            }
            RestoreSelection::Latest => {
                let latest = latest_local_artifact(&self.config.local_backup_dir, &self.config.namespace)
                    .map_err(|e| PipelineError::Prerequisite(format!("{:#}", e)))?;
                match latest {
                    Some((_, path)) => Ok(path),
                    None => Err(PipelineError::NoBackupFound(format!(
                        "no '{}' artifacts in {}",
                        self.config.namespace,
                        self.config.local_backup_dir.display()
                    ))),
                }
            }
            RestoreSelection::RemoteKey(key) => {
                let remote = self.remote.ok_or_else(|| {
                    PipelineError::Config("--from-remote needs s3_storage or remote_dir in config.json".to_string())
                })?;
                let (_, path) = storage::download_artifact(
                    remote,
                    key,
                    &self.config.local_backup_dir,
                    self.config.timeouts.transfer,
                )
                .await?;
                Ok(path)
            }
        }
    }

    fn destructive_error(
        &self,
        step: &'static str,
        message: String,
        session: &RestoreSession,
        source: &Path,
        options: &RestoreOptions,
    ) -> PipelineError {
        let safety_backup = session.safety_backup().map(Path::to_path_buf);
        let retry_command = match &safety_backup {
            Some(path) => format!("{} restore '{}' --force", options.invocation, path.display()),
            None => format!(
                "{} restore '{}' --force --no-safety-backup",
                options.invocation,
                source.display()
            ),
        };
        PipelineError::DestructiveStep {
            step,
            message,
            safety_backup,
            retry_command,
        }
    }

    async fn notify(&self, report: &RestoreReport) {
        let mut metadata = Metadata::new();
        metadata.insert("run_id".to_string(), report.run_id.clone());
        metadata.insert("namespace".to_string(), self.config.namespace.clone());
        metadata.insert("target".to_string(), self.store.name().to_string());
        metadata.insert("outcome".to_string(), report.outcome.label().to_string());
        if let Some(state) = report.history.last() {
            metadata.insert("final_state".to_string(), state.to_string());
        }
        if let Some(source) = &report.source {
            metadata.insert("source".to_string(), source.display().to_string());
        }
        if let Some(safety) = &report.safety_backup {
            metadata.insert("safety_backup".to_string(), safety.display().to_string());
        }

        let status = match &report.outcome {
            RestoreOutcome::Success { unverified: None } => NotifyStatus::Success,
            RestoreOutcome::Success { unverified: Some(_) } => NotifyStatus::Warning,
            _ => NotifyStatus::Failure,
        };
        let message = match report.outcome.error() {
            Some(e) => format!("Restore of '{}' {}: {}", self.store.name(), report.outcome.label(), e),
            None => format!("Restore of '{}' {}", self.store.name(), report.outcome.label()),
        };
        if let Err(e) = self.notifier.send(status, &message, &metadata).await {
            tracing::warn!("⚠️ Notification failed: {:#}", e);
        }
    }
}
