// dbvault/src/retention/mod.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::artifact::{ArtifactName, list_local_artifacts};
use crate::storage::ArchiveStore;

/// A tier of artifacts that retention can enumerate and delete from.
#[async_trait]
pub trait ArtifactSet: Send + Sync {
    fn tier(&self) -> &'static str;

    /// Artifacts with the locator used to delete them.
    async fn artifacts(&self) -> Result<Vec<(ArtifactName, String)>>;

    async fn remove(&self, locator: &str) -> Result<()>;
}

pub struct LocalArtifactDir {
    pub dir: PathBuf,
    pub namespace: String,
}

#[async_trait]
impl ArtifactSet for LocalArtifactDir {
    fn tier(&self) -> &'static str {
        "local"
    }

    async fn artifacts(&self) -> Result<Vec<(ArtifactName, String)>> {
        Ok(list_local_artifacts(&self.dir, &self.namespace)?
            .into_iter()
            .map(|(name, path)| (name, path.to_string_lossy().into_owned()))
            .collect())
    }

    async fn remove(&self, locator: &str) -> Result<()> {
        tokio::fs::remove_file(locator)
            .await
            .with_context(|| format!("Failed to delete {}", locator))
    }
}

pub struct RemoteArtifactSet<'a> {
    pub store: &'a dyn ArchiveStore,
    pub namespace: String,
}

#[async_trait]
impl ArtifactSet for RemoteArtifactSet<'_> {
    fn tier(&self) -> &'static str {
        "remote"
    }

    async fn artifacts(&self) -> Result<Vec<(ArtifactName, String)>> {
        Ok(self
            .store
            .list(&self.namespace)
            .await?
            .into_iter()
            .map(|a| (a.name, a.key))
            .collect())
    }

    async fn remove(&self, locator: &str) -> Result<()> {
        self.store.delete(locator).await
    }
}

#[derive(Debug, Default, Clone)]
pub struct PruneReport {
    pub tier: &'static str,
    pub deleted: Vec<String>,
    pub kept: usize,
    pub errors: Vec<String>,
}

impl PruneReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: deleted {}, kept {}, {} error(s)",
            self.tier,
            self.deleted.len(),
            self.kept,
            self.errors.len()
        )
    }
}

/// An artifact is expired once its embedded timestamp is at or before the
/// cutoff. File modification times are never consulted.
pub fn is_expired(name: &ArtifactName, cutoff: DateTime<Utc>) -> bool {
    name.timestamp <= cutoff
}

/// Deletes every artifact in `set` older than `max_age`. Each deletion is
/// attempted independently; failures are collected, not short-circuited.
pub async fn prune(set: &dyn ArtifactSet, max_age: chrono::Duration, now: DateTime<Utc>) -> PruneReport {
    let cutoff = now - max_age;
    let mut report = PruneReport {
        tier: set.tier(),
        ..Default::default()
    };

    let artifacts = match set.artifacts().await {
        Ok(list) => list,
        Err(e) => {
            report.errors.push(format!("listing failed: {:#}", e));
            return report;
        }
    };

    for (name, locator) in artifacts {
        if !is_expired(&name, cutoff) {
            report.kept += 1;
            continue;
        }
        match set.remove(&locator).await {
            Ok(()) => {
                tracing::info!("🗑 Deleted expired {} artifact {}", report.tier, name);
                report.deleted.push(locator);
            }
            Err(e) => {
                tracing::warn!("⚠️ Could not delete {} artifact {}: {:#}", report.tier, name, e);
                report.errors.push(format!("{}: {:#}", locator, e));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory set whose deletions fail for configured locators.
    struct MemorySet {
        items: Mutex<BTreeMap<String, ArtifactName>>,
        failing: Vec<String>,
    }

    impl MemorySet {
        fn new(names: &[&str], failing: &[&str]) -> Self {
            MemorySet {
                items: Mutex::new(
                    names
                        .iter()
                        .map(|n| (n.to_string(), ArtifactName::parse(n).unwrap()))
                        .collect(),
                ),
                failing: failing.iter().map(|s| s.to_string()).collect(),
            }
        }

        fn remaining(&self) -> Vec<String> {
            self.items.lock().unwrap().keys().cloned().collect()
        }
    }

    #[async_trait]
    impl ArtifactSet for MemorySet {
        fn tier(&self) -> &'static str {
            "memory"
        }

        async fn artifacts(&self) -> Result<Vec<(ArtifactName, String)>> {
            Ok(self
                .items
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| (v.clone(), k.clone()))
                .collect())
        }

        async fn remove(&self, locator: &str) -> Result<()> {
            if self.failing.iter().any(|f| f == locator) {
                anyhow::bail!("access denied");
            }
            self.items.lock().unwrap().remove(locator);
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_never_deletes_artifacts_younger_than_cutoff() {
        let set = MemorySet::new(
            &[
                "app_backup_20240301_000000.sql.gz",
                "app_backup_20240303_120000.sql.gz",
                "app_backup_20240303_120001.sql.gz",
                "app_backup_20240310_110000.sql.gz",
            ],
            &[],
        );
        let report = prune(&set, chrono::Duration::days(7), now()).await;
        assert!(report.is_clean());
        assert_eq!(
            report.deleted,
            vec!["app_backup_20240301_000000.sql.gz", "app_backup_20240303_120000.sql.gz"]
        );
        assert_eq!(report.kept, 2);
        assert_eq!(
            set.remaining(),
            vec!["app_backup_20240303_120001.sql.gz", "app_backup_20240310_110000.sql.gz"]
        );
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_other_deletions() {
        let set = MemorySet::new(
            &[
                "app_backup_20240101_000000.sql.gz",
                "app_backup_20240102_000000.sql.gz",
                "app_backup_20240103_000000.sql.gz",
            ],
            &["app_backup_20240102_000000.sql.gz"],
        );
        let report = prune(&set, chrono::Duration::days(1), now()).await;
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("access denied"));
        assert_eq!(set.remaining(), vec!["app_backup_20240102_000000.sql.gz"]);
    }

    #[tokio::test]
    async fn test_second_prune_is_a_no_op() {
        let set = MemorySet::new(
            &["app_backup_20240101_000000.sql.gz", "app_backup_20240309_000000.sql.gz"],
            &[],
        );
        let first = prune(&set, chrono::Duration::days(7), now()).await;
        assert_eq!(first.deleted.len(), 1);
        let second = prune(&set, chrono::Duration::days(7), now()).await;
        assert!(second.deleted.is_empty());
        assert!(second.is_clean());
        assert_eq!(second.kept, 1);
    }

    #[tokio::test]
    async fn test_local_prune_uses_embedded_timestamp_not_mtime() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // Both files are brand new on disk; only the name says how old they are.
        std::fs::write(dir.path().join("app_backup_20200101_000000.sql.gz"), b"old")?;
        std::fs::write(dir.path().join("app_backup_20240310_000000.sql.gz"), b"new")?;
        std::fs::write(dir.path().join("other_backup_20200101_000000.sql.gz"), b"foreign")?;

        let set = LocalArtifactDir {
            dir: dir.path().to_path_buf(),
            namespace: "app".to_string(),
        };
        let report = prune(&set, chrono::Duration::days(7), now()).await;
        assert_eq!(report.deleted.len(), 1);
        assert!(!dir.path().join("app_backup_20200101_000000.sql.gz").exists());
        assert!(dir.path().join("app_backup_20240310_000000.sql.gz").exists());
        assert!(dir.path().join("other_backup_20200101_000000.sql.gz").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_remote_prune_through_archive_store() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = crate::storage::FsArchiveStore::new(tmp.path(), None);
        for name in ["app_backup_20200101_000000.sql.gz", "app_backup_20240309_000000.sql.gz"] {
            std::fs::write(tmp.path().join(name), b"x")?;
        }
        let set = RemoteArtifactSet {
            store: &store,
            namespace: "app".to_string(),
        };
        let report = prune(&set, chrono::Duration::days(30), now()).await;
        assert_eq!(report.deleted, vec!["app_backup_20200101_000000.sql.gz"]);
        assert_eq!(report.tier, "remote");
        Ok(())
    }
}
