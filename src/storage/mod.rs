// dbvault/src/storage/mod.rs
pub(crate) mod fs;
pub(crate) mod s3;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::artifact::{ArtifactName, BackupArtifact};
use crate::backup::file_sha256;
use crate::errors::{PipelineError, Result};

pub use fs::FsArchiveStore;
pub use s3::S3ArchiveStore;

/// An artifact as seen in the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifact {
    pub key: String,
    pub name: ArtifactName,
    pub size_bytes: u64,
}

/// Object storage for artifacts, laid out as `<prefix>/<artifact-name>` with
/// run logs at `<prefix>/logs/<run-id>.log`.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    fn prefix(&self) -> Option<&str>;

    /// Reachability check that does not modify anything.
    async fn check(&self) -> AnyResult<()>;

    async fn put_file(&self, local: &Path, key: &str, metadata: &HashMap<String, String>) -> AnyResult<()>;

    async fn put_text(&self, key: &str, body: String) -> AnyResult<()>;

    /// Downloads `key` to exactly `dest`.
    async fn get_file(&self, key: &str, dest: &Path) -> AnyResult<()>;

    /// Artifacts of `namespace`, ordered by embedded timestamp, oldest first.
    /// Objects that do not follow the naming convention are ignored.
    async fn list(&self, namespace: &str) -> AnyResult<Vec<RemoteArtifact>>;

    async fn delete(&self, key: &str) -> AnyResult<()>;

    fn key_for(&self, file_name: &str) -> String {
        join_key(self.prefix(), file_name)
    }

    fn log_key_for(&self, run_id: &str) -> String {
        join_key(self.prefix(), &format!("logs/{}.log", run_id))
    }
}

pub fn join_key(prefix: Option<&str>, rest: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(p) => format!("{}/{}", p, rest),
        None => rest.to_string(),
    }
}

/// Runs a transfer with a timeout, retrying once before giving up.
pub async fn with_single_retry<F, Fut, T>(label: &str, timeout: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AnyResult<T>>,
{
    let mut last_error = String::new();
    for attempt in 1..=2 {
        match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => last_error = format!("{:#}", e),
            Err(_) => last_error = format!("timed out after {}s", timeout.as_secs()),
        }
        if attempt == 1 {
            tracing::warn!("⚠️ {} failed ({}), retrying once", label, last_error);
        }
    }
    Err(PipelineError::Transfer(format!("{}: {}", label, last_error)))
}

fn upload_metadata(artifact: &BackupArtifact, source: &str) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("scope".to_string(), artifact.name.scope.as_str().to_string());
    metadata.insert("source".to_string(), source.to_string());
    metadata.insert("timestamp".to_string(), artifact.name.timestamp.to_rfc3339());
    if let Some(sha) = &artifact.sha256 {
        metadata.insert("sha256".to_string(), sha.clone());
    }
    metadata
}

/// Uploads a verified artifact and returns its remote key.
pub async fn upload_artifact(
    store: &dyn ArchiveStore,
    artifact: &BackupArtifact,
    source: &str,
    timeout: Duration,
) -> Result<String> {
    let key = store.key_for(&artifact.name.file_name());
    let metadata = upload_metadata(artifact, source);
    tracing::info!("☁️ Uploading {} to {}", artifact.local_path.display(), store.describe());
    with_single_retry(&format!("upload of {}", key), timeout, || {
        store.put_file(&artifact.local_path, &key, &metadata)
    })
    .await?;
    tracing::info!("✅ Uploaded {}", key);
    Ok(key)
}

/// Subdirectory of the local backup directory that stages downloads.
pub const DOWNLOADS_DIR: &str = "downloads";

/// Downloads `key` into `dest_dir` under its artifact name and returns the
/// path to restore from. An existing local artifact of that name is never
/// replaced: an identical remote copy resolves to the local file, a
/// different one stays in `dest_dir/downloads/`.
pub async fn download_artifact(
    store: &dyn ArchiveStore,
    key: &str,
    dest_dir: &Path,
    timeout: Duration,
) -> Result<(ArtifactName, PathBuf)> {
    let name = ArtifactName::from_key(key).ok_or_else(|| {
        PipelineError::NoBackupFound(format!(
            "remote key '{}' does not follow the <namespace>_backup_<YYYYMMDD_HHMMSS>.<ext> naming convention",
            key
        ))
    })?;
    let staging_dir = dest_dir.join(DOWNLOADS_DIR);
    std::fs::create_dir_all(&staging_dir).map_err(|e| {
        PipelineError::Prerequisite(format!("cannot create {}: {}", staging_dir.display(), e))
    })?;
    let staged = staging_dir.join(name.file_name());
    tracing::info!("⬇️ Downloading {} from {}", key, store.describe());
    with_single_retry(&format!("download of {}", key), timeout, || store.get_file(key, &staged)).await?;

    let dest = dest_dir.join(name.file_name());
    let placed = tokio::task::spawn_blocking(move || place_download(&staged, &dest))
        .await
        .map_err(|e| PipelineError::Transfer(format!("placing download failed: {}", e)))?
        .map_err(|e| PipelineError::Transfer(format!("placing download failed: {}", e)))?;
    Ok((name, placed))
}

/// Links a staged download to `dest` unless something already lives there.
fn place_download(staged: &Path, dest: &Path) -> io::Result<PathBuf> {
    match std::fs::hard_link(staged, dest) {
        Ok(()) => {
            std::fs::remove_file(staged)?;
            Ok(dest.to_path_buf())
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if file_sha256(staged)? == file_sha256(dest)? {
                std::fs::remove_file(staged)?;
                tracing::info!("✓ Remote copy is identical to local {}", dest.display());
                Ok(dest.to_path_buf())
            } else {
                tracing::warn!(
                    "⚠️ Remote copy differs from local {}; local file left untouched, using {}",
                    dest.display(),
                    staged.display()
                );
                Ok(staged.to_path_buf())
            }
        }
        Err(e) => {
            tracing::warn!("⚠️ Could not link download to {} ({}); using {}", dest.display(), e, staged.display());
            Ok(staged.to_path_buf())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_join_key() {
        assert_eq!(join_key(None, "a.sql.gz"), "a.sql.gz");
        assert_eq!(join_key(Some(""), "a.sql.gz"), "a.sql.gz");
        assert_eq!(join_key(Some("/prod/db/"), "a.sql.gz"), "prod/db/a.sql.gz");
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_second_attempt() {
        let calls = AtomicUsize::new(0);
        let value = with_single_retry("op", Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    anyhow::bail!("connection reset")
                }
                Ok(n)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_is_bounded_to_one() {
        let calls = AtomicUsize::new(0);
        let err = with_single_retry("op", Duration::from_secs(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow::anyhow!("denied")) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::Transfer(_)));
        assert!(err.to_string().contains("denied"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let err = with_single_retry("op", Duration::from_millis(50), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), anyhow::Error>(())
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    fn remote_with(root: &Path, key: &str, bytes: &[u8]) -> FsArchiveStore {
        std::fs::create_dir_all(root).unwrap();
        std::fs::write(root.join(key), bytes).unwrap();
        FsArchiveStore::new(root, None)
    }

    #[tokio::test]
    async fn test_download_lands_beside_local_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let key = "app_backup_20240101_000000.sql.gz";
        let remote = remote_with(&tmp.path().join("remote"), key, b"remote bytes");
        let local = tmp.path().join("backups");

        let (name, path) = download_artifact(&remote, key, &local, Duration::from_secs(5)).await.unwrap();
        assert_eq!(name.file_name(), key);
        assert_eq!(path, local.join(key));
        assert_eq!(std::fs::read(&path).unwrap(), b"remote bytes");
        assert_eq!(std::fs::read_dir(local.join(DOWNLOADS_DIR)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_identical_remote_copy_resolves_to_local_file() {
        let tmp = tempfile::tempdir().unwrap();
        let key = "app_backup_20240101_000000.sql.gz";
        let remote = remote_with(&tmp.path().join("remote"), key, b"same bytes");
        let local = tmp.path().join("backups");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(local.join(key), b"same bytes").unwrap();

        let (_, path) = download_artifact(&remote, key, &local, Duration::from_secs(5)).await.unwrap();
        assert_eq!(path, local.join(key));
        assert_eq!(std::fs::read_dir(local.join(DOWNLOADS_DIR)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_different_remote_copy_never_replaces_local_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let key = "app_backup_20240101_000000.sql.gz";
        let remote = remote_with(&tmp.path().join("remote"), key, b"remote variant");
        let local = tmp.path().join("backups");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(local.join(key), b"known good").unwrap();

        let (_, path) = download_artifact(&remote, key, &local, Duration::from_secs(5)).await.unwrap();
        assert_eq!(path, local.join(DOWNLOADS_DIR).join(key));
        assert_eq!(std::fs::read(&path).unwrap(), b"remote variant");
        assert_eq!(std::fs::read(local.join(key)).unwrap(), b"known good");
    }
}
