// dbvault/src/notify/mod.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyStatus {
    Success,
    Warning,
    Failure,
}

impl fmt::Display for NotifyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NotifyStatus::Success => "success",
            NotifyStatus::Warning => "warning",
            NotifyStatus::Failure => "failure",
        })
    }
}

pub type Metadata = BTreeMap<String, String>;

/// Delivers run outcomes to operators. Delivery problems are the caller's
/// to log; they never change a run's outcome.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, status: NotifyStatus, message: &str, metadata: &Metadata) -> Result<()>;
}

/// Writes notifications to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, status: NotifyStatus, message: &str, metadata: &Metadata) -> Result<()> {
        match status {
            NotifyStatus::Success => tracing::info!(?metadata, "📣 [{}] {}", status, message),
            NotifyStatus::Warning => tracing::warn!(?metadata, "📣 [{}] {}", status, message),
            NotifyStatus::Failure => tracing::error!(?metadata, "📣 [{}] {}", status, message),
        }
        Ok(())
    }
}

/// Runs an operator-supplied program for each notification. Status, message
/// and metadata are passed as `DBVAULT_STATUS`, `DBVAULT_MESSAGE` and
/// `DBVAULT_META_<KEY>` environment variables.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    argv: Vec<String>,
}

impl CommandNotifier {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.first().map_or(true, |p| p.trim().is_empty()) {
            anyhow::bail!("notify_command must name a program");
        }
        Ok(CommandNotifier { argv })
    }
}

fn env_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("DBVAULT_META_{}", cleaned)
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn send(&self, status: NotifyStatus, message: &str, metadata: &Metadata) -> Result<()> {
        LogNotifier.send(status, message, metadata).await?;

        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .env("DBVAULT_STATUS", status.to_string())
            .env("DBVAULT_MESSAGE", message)
            .kill_on_drop(true);
        for (key, value) in metadata {
            cmd.env(env_key(key), value);
        }
        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to run notify command {}", self.argv[0]))?;
        if !output.status.success() {
            anyhow::bail!(
                "notify command {} exited with {}\nStderr: {}",
                self.argv[0],
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every notification for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<(NotifyStatus, String, Metadata)>>,
    }

    impl RecordingNotifier {
        pub fn statuses(&self) -> Vec<NotifyStatus> {
            self.sent.lock().unwrap().iter().map(|(s, _, _)| *s).collect()
        }

        pub fn last(&self) -> Option<(NotifyStatus, String, Metadata)> {
            self.sent.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, status: NotifyStatus, message: &str, metadata: &Metadata) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((status, message.to_string(), metadata.clone()));
            Ok(())
        }
    }
}
