use std::path::PathBuf;
use thiserror::Error;

/// Failure taxonomy shared by the backup and restore pipelines.
///
/// Each variant maps to the step class that produced it; callers decide
/// whether a variant is fatal (production, verification) or can be downgraded
/// (transfer on the backup path).
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Prerequisite check failed: {0}")]
    Prerequisite(String),

    #[error("Dump production failed: {0}")]
    Production(String),

    #[error("Artifact verification failed for {path}: {reason}")]
    Verification { path: PathBuf, reason: String },

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("No backup found: {0}")]
    NoBackupFound(String),

    #[error("Restore was not confirmed; nothing was changed")]
    ConfirmationDeclined,

    #[error("Safety backup failed, refusing to touch the target: {0}")]
    SafetyBackup(String),

    #[error("{step} failed: {message}\n{}", recovery_hint(.safety_backup.as_ref(), .retry_command))]
    DestructiveStep {
        step: &'static str,
        message: String,
        safety_backup: Option<PathBuf>,
        retry_command: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl PipelineError {
    /// True for failures that happened after the target was modified.
    pub fn is_destructive(&self) -> bool {
        matches!(self, PipelineError::DestructiveStep { .. })
    }
}

fn recovery_hint(safety_backup: Option<&PathBuf>, retry_command: &str) -> String {
    match safety_backup {
        Some(path) => format!(
            "Safety backup: {}\nTo roll back run: {}",
            path.display(),
            retry_command
        ),
        None => format!(
            "No safety backup was taken. To retry run: {}",
            retry_command
        ),
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
