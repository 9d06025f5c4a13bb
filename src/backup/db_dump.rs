// dbvault/src/backup/db_dump.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;

use crate::artifact::{ArtifactName, BackupArtifact, BackupScope, PARTIAL_SUFFIX, VerificationStatus};
use crate::datastore::DataStore;
use crate::errors::{PipelineError, Result};
use crate::utils::PartialFile;

const MAX_NAME_ATTEMPTS: usize = 120;
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub struct ProducedDump {
    pub artifact: BackupArtifact,
    pub duration: Duration,
}

/// Turns a data store's dump command into a compressed artifact on disk.
#[async_trait]
pub trait DumpProducer: Send + Sync {
    async fn produce(
        &self,
        store: &dyn DataStore,
        scope: BackupScope,
        namespace: &str,
        dest_dir: &Path,
        timeout: Duration,
    ) -> Result<ProducedDump>;
}

/// Streams the dump process's stdout through gzip straight into
/// `<name>.partial`, renaming it into place only after both the dump process
/// and the compressor finished cleanly. On any failure, timeout or
/// cancellation the partial file is removed.
#[derive(Debug, Default)]
pub struct GzipDumpProducer;

#[async_trait]
impl DumpProducer for GzipDumpProducer {
    async fn produce(
        &self,
        store: &dyn DataStore,
        scope: BackupScope,
        namespace: &str,
        dest_dir: &Path,
        timeout: Duration,
    ) -> Result<ProducedDump> {
        let started = Instant::now();
        let (name, final_path, file, partial) = reserve_name(dest_dir, namespace, scope, Utc::now())?;
        tracing::info!(
            "🗜 Dumping '{}' ({}) into {}",
            store.name(),
            scope.as_str(),
            final_path.display()
        );

        let mut cmd = store
            .dump_command(scope)
            .map_err(|e| PipelineError::Production(format!("{:#}", e)))?;
        let child = cmd
            .spawn()
            .map_err(|e| PipelineError::Production(format!("failed to start dump process: {}", e)))?;

        let streamed = tokio::time::timeout(timeout, stream_compressed(child, file))
            .await
            .map_err(|_| {
                PipelineError::Production(format!(
                    "dump of '{}' timed out after {}s",
                    store.name(),
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| PipelineError::Production(format!("compression failed: {}", e)))?;

        if !streamed.status.success() {
            return Err(PipelineError::Production(format!(
                "dump process for '{}' exited with {}\nStderr: {}",
                store.name(),
                streamed.status,
                streamed.stderr.trim()
            )));
        }

        partial.commit(&final_path).map_err(|e| {
            PipelineError::Production(format!(
                "failed to move finished dump into place at {}: {}",
                final_path.display(),
                e
            ))
        })?;

        let duration = started.elapsed();
        tracing::info!(
            "✅ Dump written: {} ({} bytes compressed, {} bytes raw, {:.1}s)",
            final_path.display(),
            streamed.compressed_bytes,
            streamed.raw_bytes,
            duration.as_secs_f64()
        );

        Ok(ProducedDump {
            artifact: BackupArtifact {
                name,
                local_path: final_path,
                remote_key: None,
                size_bytes: streamed.compressed_bytes,
                sha256: Some(streamed.sha256),
                status: VerificationStatus::Unverified,
            },
            duration,
        })
    }
}

/// Claims a unique artifact name in `dest_dir`. A name is taken when either
/// its final file or its `.partial` file exists; the timestamp is then moved
/// forward one second so concurrent runs never share an identity.
fn reserve_name(
    dest_dir: &Path,
    namespace: &str,
    scope: BackupScope,
    now: DateTime<Utc>,
) -> Result<(ArtifactName, PathBuf, File, PartialFile)> {
    let mut name = ArtifactName::new(namespace, now, scope);
    for _ in 0..MAX_NAME_ATTEMPTS {
        let final_path = dest_dir.join(name.file_name());
        let partial_path = dest_dir.join(format!("{}{}", name.file_name(), PARTIAL_SUFFIX));
        if !final_path.exists() {
            match OpenOptions::new().write(true).create_new(true).open(&partial_path) {
                Ok(file) => {
                    let partial = PartialFile::new(partial_path);
                    if final_path.exists() {
                        drop(partial);
                    } else {
                        return Ok((name, final_path, file, partial));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(PipelineError::Production(format!(
                        "failed to create {}: {}",
                        partial_path.display(),
                        e
                    )));
                }
            }
        }
        name = name.next_second();
    }
    Err(PipelineError::Production(format!(
        "could not reserve a unique artifact name in {}",
        dest_dir.display()
    )))
}

/// Counts and hashes everything written through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        HashingWriter {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct Streamed {
    status: ExitStatus,
    stderr: String,
    raw_bytes: u64,
    compressed_bytes: u64,
    sha256: String,
}

/// Reads the dump from the child's stdout and hands it to a blocking thread
/// that compresses, hashes and syncs it to `file`.
async fn stream_compressed(mut child: Child, file: File) -> io::Result<Streamed> {
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("dump process has no stdout pipe"))?;
    let stderr_task = child.stderr.take().map(|s| tokio::spawn(drain_to_string(s)));

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(8);
    let compressor = tokio::task::spawn_blocking(move || -> io::Result<(u64, String)> {
        let mut encoder = GzEncoder::new(HashingWriter::new(BufWriter::new(file)), Compression::default());
        while let Some(chunk) = rx.blocking_recv() {
            encoder.write_all(&chunk)?;
        }
        let mut hashing = encoder.finish()?;
        hashing.flush()?;
        let HashingWriter { inner, hasher, written } = hashing;
        let file = inner.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok((written, hex::encode(hasher.finalize())))
    });

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut raw_bytes = 0u64;
    let mut read_error = None;
    let mut compressor_gone = false;
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                raw_bytes += n as u64;
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    compressor_gone = true;
                    break;
                }
            }
            Err(e) => {
                read_error = Some(e);
                break;
            }
        }
    }
    drop(tx);

    if compressor_gone || read_error.is_some() {
        // Nobody drains stdout any more; stop the dump instead of waiting on it.
        let _ = child.start_kill();
    }
    let status = child.wait().await?;
    let (compressed_bytes, sha256) = compressor
        .await
        .map_err(|e| io::Error::other(format!("compression task failed: {}", e)))??;
    if let Some(e) = read_error {
        return Err(e);
    }

    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    Ok(Streamed {
        status,
        stderr,
        raw_bytes,
        compressed_bytes,
        sha256,
    })
}

pub(crate) async fn drain_to_string<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut out = Vec::new();
    let _ = reader.read_to_end(&mut out).await;
    String::from_utf8_lossy(&out).into_owned()
}
