// dbvault/src/restore/db_restore.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::mpsc;

use crate::backup::db_dump::drain_to_string;
use crate::datastore::DataStore;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct ReplayStats {
    pub bytes: u64,
    pub duration: Duration,
}

/// Applies an artifact to an (already emptied) target.
#[async_trait]
pub trait Restorer: Send + Sync {
    async fn replay(&self, store: &dyn DataStore, artifact: &Path, timeout: Duration) -> Result<ReplayStats>;
}

/// Decompresses the artifact on a blocking thread and streams it into the
/// store's replay command. The replay process is killed when the artifact
/// turns out to be undecodable part way, so a truncated stream is never
/// committed as if it were complete.
#[derive(Debug, Default)]
pub struct GzipReplayer;

#[async_trait]
impl Restorer for GzipReplayer {
    async fn replay(&self, store: &dyn DataStore, artifact: &Path, timeout: Duration) -> Result<ReplayStats> {
        if !artifact.exists() {
            anyhow::bail!("Artifact for restore not found: {}", artifact.display());
        }
        let started = Instant::now();
        tracing::info!("📥 Replaying {} into '{}'", artifact.display(), store.name());

        let child = store
            .replay_command()?
            .spawn()
            .with_context(|| format!("Failed to start replay process for '{}'", store.name()))?;

        let bytes = tokio::time::timeout(timeout, feed_and_wait(child, artifact.to_path_buf()))
            .await
            .map_err(|_| anyhow::anyhow!("replay into '{}' timed out after {}s", store.name(), timeout.as_secs()))??;

        let duration = started.elapsed();
        tracing::info!(
            "✓ Replayed {} bytes into '{}' in {:.1}s",
            bytes,
            store.name(),
            duration.as_secs_f64()
        );
        Ok(ReplayStats { bytes, duration })
    }
}

async fn feed_and_wait(mut child: Child, artifact: PathBuf) -> Result<u64> {
    let mut stdin = child.stdin.take().context("replay process has no stdin pipe")?;
    let stderr_task = child.stderr.take().map(|s| tokio::spawn(drain_to_string(s)));

    let (tx, mut rx) = mpsc::channel::<io::Result<Vec<u8>>>(8);
    let reader = tokio::task::spawn_blocking(move || {
        let file = match File::open(&artifact) {
            Ok(f) => f,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };
        let mut decoder = GzDecoder::new(BufReader::new(file));
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match decoder.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            }
        }
    });

    let mut fed = 0u64;
    let mut decode_error = None;
    let mut pipe_error = None;
    while let Some(chunk) = rx.recv().await {
        match chunk {
            Ok(bytes) => {
                if let Err(e) = stdin.write_all(&bytes).await {
                    pipe_error = Some(e);
                    break;
                }
                fed += bytes.len() as u64;
            }
            Err(e) => {
                decode_error = Some(e);
                break;
            }
        }
    }
    drop(rx);

    if decode_error.is_some() {
        // Kill before closing stdin so the replay never sees a clean EOF.
        let _ = child.start_kill();
    }
    drop(stdin);

    let status = child.wait().await.context("Failed to wait for replay process")?;
    let _ = reader.await;
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    if let Some(e) = decode_error {
        anyhow::bail!("artifact could not be decompressed after {} bytes: {}", fed, e);
    }
    if !status.success() {
        anyhow::bail!("replay process exited with {}\nStderr: {}", status, stderr.trim());
    }
    if let Some(e) = pipe_error {
        // A clean exit after a broken pipe means the process stopped reading early.
        anyhow::bail!("replay process stopped reading its input: {}", e);
    }
    Ok(fed)
}
