// dbvault/src/datastore/testing.rs
//! A `DataStore` over a single text file, driven through `sh` so tests
//! exercise real subprocess streaming. Lines starting with `CREATE TABLE`
//! count as tables; `INSERT` lines are row data.
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::process::Command;

use super::DataStore;
use crate::artifact::BackupScope;

pub const MARKER: &str = "-- filestore dump";
pub const LATE_WRITE: &str = "CREATE TABLE written_after_timeout;";

#[derive(Default)]
pub struct FileStore {
    pub data_file: PathBuf,
    pub fail_dump: bool,
    pub hang_dump: bool,
    pub fail_replay: bool,
    pub hang_replay: bool,
    pub fail_drain: bool,
    pub unreachable: bool,
    pub resets: AtomicUsize,
    pub drains: AtomicUsize,
}

impl FileStore {
    pub fn new(data_file: &Path) -> Self {
        FileStore {
            data_file: data_file.to_path_buf(),
            ..Default::default()
        }
    }

    pub fn with_content(data_file: &Path, content: &str) -> Self {
        std::fs::write(data_file, content).expect("write store content");
        Self::new(data_file)
    }

    pub fn content(&self) -> String {
        std::fs::read_to_string(&self.data_file).unwrap_or_default()
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    fn shell(&self, script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .arg("sh")
            .arg(&self.data_file)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl DataStore for FileStore {
    fn name(&self) -> &str {
        "filestore"
    }

    fn required_tools(&self) -> Vec<&'static str> {
        vec!["sh", "sed"]
    }

    async fn probe(&self) -> Result<()> {
        if self.unreachable {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }

    fn dump_command(&self, scope: BackupScope) -> Result<Command> {
        let script = if self.hang_dump {
            format!("echo '{MARKER}'; sleep 30")
        } else if self.fail_dump {
            format!("echo '{MARKER}'; echo 'CREATE TABLE half'; exit 2")
        } else {
            match scope {
                BackupScope::Full => format!("echo '{MARKER}'; cat \"$1\""),
                BackupScope::SchemaOnly => format!("echo '{MARKER}'; grep '^CREATE' \"$1\" || true"),
            }
        };
        let mut cmd = self.shell(&script);
        cmd.stdin(Stdio::null());
        Ok(cmd)
    }

    fn dump_marker(&self) -> &'static [u8] {
        MARKER.as_bytes()
    }

    fn replay_command(&self) -> Result<Command> {
        let script = if self.hang_replay {
            // Only writes the target if it outlives its timeout.
            format!("cat > /dev/null; sleep 1; echo '{LATE_WRITE}' > \"$1\"")
        } else if self.fail_replay {
            "cat > /dev/null; exit 3".to_string()
        } else {
            format!("sed '/^{MARKER}$/d' > \"$1\"")
        };
        let mut cmd = self.shell(&script);
        cmd.stdin(Stdio::piped()).stdout(Stdio::null());
        Ok(cmd)
    }

    async fn drain_connections(&self) -> Result<u64> {
        self.drains.fetch_add(1, Ordering::SeqCst);
        if self.fail_drain {
            anyhow::bail!("permission denied to terminate backends");
        }
        Ok(0)
    }

    async fn reset_target(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        std::fs::write(&self.data_file, b"")?;
        Ok(())
    }

    async fn count_objects(&self) -> Result<i64> {
        let count = self
            .content()
            .lines()
            .filter(|l| l.starts_with("CREATE TABLE"))
            .count();
        Ok(count as i64)
    }
}

#[tokio::test]
async fn reset_target_twice_leaves_equivalently_empty_target() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = FileStore::with_content(&dir.path().join("db.sql"), "CREATE TABLE t;\nINSERT 1;\n");
    store.reset_target().await?;
    let first = store.content();
    let first_count = store.count_objects().await?;
    store.reset_target().await?;
    assert_eq!(store.content(), first);
    assert_eq!(store.count_objects().await?, first_count);
    assert_eq!(first_count, 0);
    Ok(())
}

#[tokio::test]
async fn reset_target_is_safe_when_target_is_missing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = FileStore::new(&dir.path().join("never-created.sql"));
    store.reset_target().await?;
    assert_eq!(store.count_objects().await?, 0);
    Ok(())
}
