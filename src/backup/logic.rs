// dbvault/src/backup/logic.rs
use chrono::Utc;
use std::time::Duration;

use super::db_dump::DumpProducer;
use super::integrity::verify_in_place;
use crate::artifact::{BackupArtifact, BackupScope};
use crate::config::BackupConfig;
use crate::context::{RunContext, StepStatus};
use crate::datastore::DataStore;
use crate::errors::{PipelineError, Result};
use crate::notify::{Metadata, Notifier, NotifyStatus};
use crate::retention::{self, LocalArtifactDir, PruneReport, RemoteArtifactSet};
use crate::storage::{self, ArchiveStore};
use crate::utils::{ensure_writable_dir, find_executable};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

pub const STEP_PREREQS: &str = "check_prereqs";
pub const STEP_DUMP: &str = "produce_dump";
pub const STEP_VERIFY: &str = "verify";
pub const STEP_UPLOAD: &str = "upload";
pub const STEP_CLEANUP: &str = "cleanup";
pub const STEP_NOTIFY: &str = "notify";

#[derive(Debug)]
pub struct BackupResult {
    pub run_id: String,
    pub artifact: BackupArtifact,
    pub uploaded: bool,
    pub warnings: Vec<String>,
    pub retention: Vec<PruneReport>,
}

/// CHECK_PREREQS → PRODUCE_DUMP → VERIFY → UPLOAD → CLEANUP → NOTIFY.
///
/// Prerequisite, production and verification failures are fatal. Upload
/// failures are downgraded to warnings and leave the artifact local-only.
/// Cleanup and notification run whatever happened before them.
pub struct BackupOrchestrator<'a> {
    pub config: &'a BackupConfig,
    pub store: &'a dyn DataStore,
    pub remote: Option<&'a dyn ArchiveStore>,
    pub producer: &'a dyn DumpProducer,
    pub notifier: &'a dyn Notifier,
}

#[derive(Default)]
struct Progress {
    artifact: Option<BackupArtifact>,
    uploaded: bool,
    remote_ok: bool,
}

impl BackupOrchestrator<'_> {
    pub async fn run(&self, scope: BackupScope) -> Result<BackupResult> {
        let mut ctx = RunContext::new(&self.config.namespace);
        tracing::info!(
            "🚀 Starting {} backup run {} of '{}'",
            scope.as_str(),
            ctx.run_id,
            self.store.name()
        );

        let mut progress = Progress::default();
        let outcome = self.produce_and_ship(&mut ctx, &mut progress, scope).await;
        if let Err(e) = &outcome {
            tracing::error!("❌ Backup run {} failed: {}", ctx.run_id, e);
        }

        let retention = self.cleanup(&mut ctx).await;
        self.notify(&mut ctx, &progress, outcome.as_ref().err()).await;
        self.ship_log(&ctx, &progress).await;

        outcome?;
        let artifact = progress
            .artifact
            .ok_or_else(|| PipelineError::Production("run finished without an artifact".to_string()))?;
        tracing::info!(
            "🎉 Backup run {} completed: {} (uploaded: {})",
            ctx.run_id,
            artifact.local_path.display(),
            progress.uploaded
        );
        Ok(BackupResult {
            run_id: ctx.run_id,
            artifact,
            uploaded: progress.uploaded,
            warnings: ctx.warnings,
            retention,
        })
    }

    async fn produce_and_ship(
        &self,
        ctx: &mut RunContext,
        progress: &mut Progress,
        scope: BackupScope,
    ) -> Result<()> {
        ctx.begin(STEP_PREREQS);
        match self.check_prereqs(ctx).await {
            Ok(remote_ok) => {
                progress.remote_ok = remote_ok;
                ctx.record(STEP_PREREQS, StepStatus::Ok, "tools, target and backup directory ready");
            }
            Err(e) => {
                ctx.record(STEP_PREREQS, StepStatus::Failed, e.to_string());
                return Err(e);
            }
        }

        ctx.begin(STEP_DUMP);
        let produced = match self
            .producer
            .produce(
                self.store,
                scope,
                &self.config.namespace,
                &self.config.local_backup_dir,
                self.config.timeouts.dump,
            )
            .await
        {
            Ok(produced) => produced,
            Err(e) => {
                ctx.record(STEP_DUMP, StepStatus::Failed, e.to_string());
                return Err(e);
            }
        };
        ctx.record(
            STEP_DUMP,
            StepStatus::Ok,
            format!(
                "{} ({} bytes in {:.1}s)",
                produced.artifact.name,
                produced.artifact.size_bytes,
                produced.duration.as_secs_f64()
            ),
        );
        let mut artifact = produced.artifact;

        ctx.begin(STEP_VERIFY);
        let marker = self.store.dump_marker();
        let (mut artifact, verdict) = tokio::task::spawn_blocking(move || {
            let verdict = verify_in_place(&mut artifact, marker);
            (artifact, verdict)
        })
        .await
        .map_err(|e| PipelineError::Production(format!("verification task panicked: {}", e)))?;
        if !verdict.valid {
            let reason = verdict.reason.unwrap_or_else(|| "unknown".to_string());
            tracing::error!(
                "❌ Artifact {} failed verification ({}); left in place for inspection",
                artifact.local_path.display(),
                reason
            );
            ctx.record(STEP_VERIFY, StepStatus::Failed, reason.clone());
            let err = PipelineError::Verification {
                path: artifact.local_path.clone(),
                reason,
            };
            progress.artifact = Some(artifact);
            return Err(err);
        }
        ctx.record(STEP_VERIFY, StepStatus::Ok, "container and dump marker intact");

        ctx.begin(STEP_UPLOAD);
        match (self.remote, self.config.upload, progress.remote_ok) {
            (Some(remote), true, true) => {
                match storage::upload_artifact(remote, &artifact, self.store.name(), self.config.timeouts.transfer).await {
                    Ok(key) => {
                        ctx.record(STEP_UPLOAD, StepStatus::Ok, key.clone());
                        artifact.remote_key = Some(key);
                        progress.uploaded = true;
                    }
                    Err(e) => {
                        tracing::warn!("⚠️ {}; artifact kept local-only", e);
                        ctx.warn(STEP_UPLOAD, format!("{}; artifact kept local-only", e));
                    }
                }
            }
            (Some(_), true, false) => {
                ctx.warn(STEP_UPLOAD, "remote store unreachable; artifact kept local-only");
            }
            _ => ctx.record(STEP_UPLOAD, StepStatus::Skipped, "upload disabled"),
        }

        progress.artifact = Some(artifact);
        Ok(())
    }

    /// Returns whether the remote store answered its reachability check.
    async fn check_prereqs(&self, ctx: &mut RunContext) -> Result<bool> {
        self.store
            .credentials()
            .map_err(|e| PipelineError::Prerequisite(format!("{:#}", e)))?;

        for tool in self.store.required_tools() {
            find_executable(tool).map_err(|e| PipelineError::Prerequisite(format!("{:#}", e)))?;
        }

        ensure_writable_dir(&self.config.local_backup_dir)
            .map_err(|e| PipelineError::Prerequisite(format!("{:#}", e)))?;

        match tokio::time::timeout(PROBE_TIMEOUT, self.store.probe()).await {
            Ok(Ok(())) => tracing::info!("✅ Target '{}' is reachable", self.store.name()),
            Ok(Err(e)) => {
                return Err(PipelineError::Prerequisite(format!(
                    "target '{}' is not reachable: {:#}",
                    self.store.name(),
                    e
                )));
            }
            Err(_) => {
                return Err(PipelineError::Prerequisite(format!(
                    "target '{}' did not answer within {}s",
                    self.store.name(),
                    PROBE_TIMEOUT.as_secs()
                )));
            }
        }

        let Some(remote) = self.remote else {
            return Ok(false);
        };
        if !self.config.upload {
            return Ok(false);
        }
        match tokio::time::timeout(self.config.timeouts.transfer, remote.check()).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => {
                tracing::warn!("⚠️ Remote store {} is not reachable: {:#}", remote.describe(), e);
                ctx.warn(STEP_PREREQS, format!("remote store not reachable: {:#}", e));
                Ok(false)
            }
            Err(_) => {
                ctx.warn(STEP_PREREQS, "remote store reachability check timed out");
                Ok(false)
            }
        }
    }

    async fn cleanup(&self, ctx: &mut RunContext) -> Vec<PruneReport> {
        ctx.begin(STEP_CLEANUP);
        let now = Utc::now();
        let policy = self.config.retention;
        let mut reports = Vec::new();

        let local = LocalArtifactDir {
            dir: self.config.local_backup_dir.clone(),
            namespace: self.config.namespace.clone(),
        };
        reports.push(retention::prune(&local, policy.local_max_age(), now).await);

        if let Some(remote) = self.remote {
            let remote_set = RemoteArtifactSet {
                store: remote,
                namespace: self.config.namespace.clone(),
            };
            reports.push(retention::prune(&remote_set, policy.remote_max_age(), now).await);
            if let Some(days) = policy.remote_cold_days {
                tracing::debug!("Remote-cold tier ({} days) is handled by bucket lifecycle rules", days);
            }
        }

        let summary = reports.iter().map(PruneReport::summary).collect::<Vec<_>>().join("; ");
        let errors: Vec<String> = reports.iter().flat_map(|r| r.errors.iter().cloned()).collect();
        if errors.is_empty() {
            ctx.record(STEP_CLEANUP, StepStatus::Ok, summary);
        } else {
            ctx.warn(STEP_CLEANUP, format!("{} [{}]", summary, errors.join(", ")));
        }
        reports
    }

    async fn notify(&self, ctx: &mut RunContext, progress: &Progress, failure: Option<&PipelineError>) {
        ctx.begin(STEP_NOTIFY);
        let mut metadata = Metadata::new();
        metadata.insert("run_id".to_string(), ctx.run_id.clone());
        metadata.insert("namespace".to_string(), ctx.namespace.clone());
        metadata.insert("target".to_string(), self.store.name().to_string());
        metadata.insert("uploaded".to_string(), progress.uploaded.to_string());
        if let Some(artifact) = &progress.artifact {
            metadata.insert("artifact".to_string(), artifact.local_path.display().to_string());
            metadata.insert("size_bytes".to_string(), artifact.size_bytes.to_string());
            if let Some(sha) = &artifact.sha256 {
                metadata.insert("sha256".to_string(), sha.clone());
            }
            if let Some(key) = &artifact.remote_key {
                metadata.insert("remote_key".to_string(), key.clone());
            }
        }

        let (status, message) = match failure {
            Some(e) => (NotifyStatus::Failure, format!("Backup of '{}' failed: {}", self.store.name(), e)),
            None if !ctx.warnings.is_empty() => (
                NotifyStatus::Warning,
                format!(
                    "Backup of '{}' succeeded with warnings: {}",
                    self.store.name(),
                    ctx.warnings.join("; ")
                ),
            ),
            None => (NotifyStatus::Success, format!("Backup of '{}' succeeded", self.store.name())),
        };

        match self.notifier.send(status, &message, &metadata).await {
            Ok(()) => ctx.record(STEP_NOTIFY, StepStatus::Ok, status.to_string()),
            Err(e) => {
                tracing::warn!("⚠️ Notification failed: {:#}", e);
                ctx.record(STEP_NOTIFY, StepStatus::Failed, format!("{:#}", e));
            }
        }
    }

    async fn ship_log(&self, ctx: &RunContext, progress: &Progress) {
        let Some(remote) = self.remote else { return };
        if !progress.remote_ok {
            return;
        }
        let key = remote.log_key_for(&ctx.run_id);
        let body = ctx.render_log();
        let shipped = storage::with_single_retry(
            &format!("run log upload to {}", key),
            self.config.timeouts.transfer,
            || remote.put_text(&key, body.clone()),
        )
        .await;
        if let Err(e) = shipped {
            tracing::warn!("⚠️ {}", e);
        }
    }
}
