// dbvault/src/storage/fs.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::{ArchiveStore, RemoteArtifact};
use crate::artifact::PARTIAL_SUFFIX;
use crate::utils::PartialFile;

const METADATA_SUFFIX: &str = ".meta.json";

/// Remote layout on a mounted filesystem (NFS share, external disk). Keys are
/// paths relative to `root`; metadata is kept in a JSON sidecar per object.
#[derive(Debug, Clone)]
pub struct FsArchiveStore {
    root: PathBuf,
    prefix: Option<String>,
}

impl FsArchiveStore {
    pub fn new(root: impl Into<PathBuf>, prefix: Option<String>) -> Self {
        FsArchiveStore {
            root: root.into(),
            prefix: prefix.filter(|p| !p.trim_matches('/').is_empty()),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|part| part == "..") || key.starts_with('/') {
            anyhow::bail!("Refusing key outside the archive root: {}", key);
        }
        Ok(self.root.join(key))
    }

    /// Stages into `<dest>.partial` and renames over `dest`. The work runs
    /// to completion on a blocking thread even if the caller stops waiting,
    /// so an abandoned transfer never leaves its partial file behind.
    async fn write_atomically(&self, dest: &Path, write: StagedWrite) -> Result<()> {
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || write.stage_into(&dest))
            .await
            .context("Staging task failed")?
    }
}

/// What to write into a staging file.
enum StagedWrite {
    Copy(PathBuf),
    Bytes(Vec<u8>),
}

impl StagedWrite {
    fn stage_into(self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let partial = PartialFile::new(PathBuf::from(format!("{}{}", dest.display(), PARTIAL_SUFFIX)));
        match self {
            StagedWrite::Copy(src) => {
                std::fs::copy(&src, partial.path()).with_context(|| {
                    format!("Failed to copy {} to {}", src.display(), partial.path().display())
                })?;
            }
            StagedWrite::Bytes(bytes) => {
                std::fs::write(partial.path(), bytes)
                    .with_context(|| format!("Failed to write {}", partial.path().display()))?;
            }
        }
        partial
            .replace(dest)
            .with_context(|| format!("Failed to move {} into place", dest.display()))
    }
}

#[async_trait]
impl ArchiveStore for FsArchiveStore {
    fn describe(&self) -> String {
        match &self.prefix {
            Some(p) => format!("{}/{}", self.root.display(), p),
            None => self.root.display().to_string(),
        }
    }

    fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    async fn check(&self) -> Result<()> {
        let meta = tokio::fs::metadata(&self.root)
            .await
            .with_context(|| format!("Archive root is not accessible: {}", self.root.display()))?;
        if !meta.is_dir() {
            anyhow::bail!("Archive root is not a directory: {}", self.root.display());
        }
        Ok(())
    }

    async fn put_file(&self, local: &Path, key: &str, metadata: &HashMap<String, String>) -> Result<()> {
        let dest = self.path_for(key)?;
        self.write_atomically(&dest, StagedWrite::Copy(local.to_path_buf())).await?;
        let sidecar = PathBuf::from(format!("{}{}", dest.display(), METADATA_SUFFIX));
        let json = serde_json::to_vec_pretty(metadata).context("Failed to encode object metadata")?;
        self.write_atomically(&sidecar, StagedWrite::Bytes(json)).await
    }

    async fn put_text(&self, key: &str, body: String) -> Result<()> {
        let dest = self.path_for(key)?;
        self.write_atomically(&dest, StagedWrite::Bytes(body.into_bytes())).await
    }

    async fn get_file(&self, key: &str, dest: &Path) -> Result<()> {
        let src = self.path_for(key)?;
        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            anyhow::bail!("Object not found: {}", key);
        }
        self.write_atomically(dest, StagedWrite::Copy(src)).await
    }

    async fn list(&self, namespace: &str) -> Result<Vec<RemoteArtifact>> {
        let dir = match &self.prefix {
            Some(p) => self.root.join(p),
            None => self.root.clone(),
        };
        let entries = crate::artifact::list_local_artifacts(&dir, namespace)?;
        let mut listed = Vec::with_capacity(entries.len());
        for (name, path) in entries {
            let size_bytes = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            listed.push(RemoteArtifact {
                key: self.key_for(&name.file_name()),
                name,
                size_bytes,
            });
        }
        Ok(listed)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("Failed to delete {}", path.display()))?;
        let sidecar = PathBuf::from(format!("{}{}", path.display(), METADATA_SUFFIX));
        let _ = tokio::fs::remove_file(sidecar).await;
        Ok(())
    }
}

#[cfg(test)]
impl FsArchiveStore {
    /// Reads the metadata recorded with an uploaded object.
    pub fn metadata_for(&self, key: &str) -> Result<HashMap<String, String>> {
        let path = self.path_for(key)?;
        let sidecar = PathBuf::from(format!("{}{}", path.display(), METADATA_SUFFIX));
        let raw = std::fs::read(&sidecar)
            .with_context(|| format!("Failed to read metadata {}", sidecar.display()))?;
        serde_json::from_slice(&raw).context("Failed to parse object metadata")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_list_get_delete() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = FsArchiveStore::new(tmp.path().join("remote"), Some("prod".to_string()));
        tokio::fs::create_dir_all(tmp.path().join("remote")).await?;
        store.check().await?;

        let local = tmp.path().join("app_backup_20240102_000000.sql.gz");
        std::fs::write(&local, b"payload")?;
        let older = tmp.path().join("app_backup_20240101_000000.sql.gz");
        std::fs::write(&older, b"old")?;

        let meta = HashMap::from([("scope".to_string(), "full".to_string())]);
        store.put_file(&local, &store.key_for("app_backup_20240102_000000.sql.gz"), &meta).await?;
        store.put_file(&older, &store.key_for("app_backup_20240101_000000.sql.gz"), &meta).await?;
        store.put_text(&store.log_key_for("run-1"), "log".to_string()).await?;

        let listed = store.list("app").await?;
        let keys: Vec<&str> = listed.iter().map(|a| a.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["prod/app_backup_20240101_000000.sql.gz", "prod/app_backup_20240102_000000.sql.gz"]
        );
        assert_eq!(listed[1].size_bytes, 7);
        assert_eq!(store.metadata_for(&listed[1].key)?["scope"], "full");
        assert!(tmp.path().join("remote/prod/logs/run-1.log").exists());

        let dest = tmp.path().join("download/copy.sql.gz");
        store.get_file(&listed[1].key, &dest).await?;
        assert_eq!(std::fs::read(&dest)?, b"payload");

        store.delete(&listed[0].key).await?;
        assert_eq!(store.list("app").await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_object_and_escaping_keys_fail() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = FsArchiveStore::new(tmp.path(), None);
        assert!(store.get_file("app_backup_20240101_000000.sql.gz", &tmp.path().join("x")).await.is_err());
        assert!(store.delete("../etc/passwd").await.is_err());
        assert!(!tmp.path().join("x").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_abandoned_download_leaves_no_partial_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = FsArchiveStore::new(tmp.path().join("remote"), None);
        let key = "app_backup_20240101_000000.sql.gz";
        std::fs::create_dir_all(tmp.path().join("remote"))?;
        std::fs::write(tmp.path().join("remote").join(key), vec![7u8; 32 * 1024 * 1024])?;

        let local = tmp.path().join("local");
        std::fs::create_dir_all(&local)?;
        let dest = local.join(key);
        let _ = tokio::time::timeout(std::time::Duration::from_millis(5), store.get_file(key, &dest)).await;

        for _ in 0..100 {
            if dest.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let leftovers: Vec<_> = std::fs::read_dir(&local)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_check_fails_for_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsArchiveStore::new(tmp.path().join("not-mounted"), None);
        assert!(store.check().await.is_err());
    }
}
