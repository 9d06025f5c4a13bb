// dbvault/src/storage/s3.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use s3::types::ServerSideEncryption;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::{ArchiveStore, RemoteArtifact, join_key};
use crate::artifact::{ArtifactName, PARTIAL_SUFFIX};
use crate::config::SpacesConfig;
use crate::utils::PartialFile;

/// S3-compatible object storage (AWS S3, DigitalOcean Spaces, MinIO).
/// Objects are written with server-side encryption.
pub struct S3ArchiveStore {
    client: s3::Client,
    bucket: String,
    prefix: Option<String>,
    endpoint: String,
}

impl S3ArchiveStore {
    pub async fn connect(spaces_config: &SpacesConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        S3ArchiveStore {
            client: s3::Client::new(&sdk_config),
            bucket: spaces_config.bucket_name.clone(),
            prefix: spaces_config.folder_prefix.clone(),
            endpoint: spaces_config.endpoint_url.clone(),
        }
    }
}

#[async_trait]
impl ArchiveStore for S3ArchiveStore {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix.as_deref().unwrap_or(""))
    }

    fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    async fn check(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .with_context(|| {
                format!(
                    "S3 connection failed. Could not access bucket '{}' with HEAD request. Endpoint: {}",
                    self.bucket, self.endpoint
                )
            })?;
        tracing::debug!("✓ Target bucket {} is accessible.", self.bucket);
        Ok(())
    }

    async fn put_file(&self, local: &Path, key: &str, metadata: &HashMap<String, String>) -> Result<()> {
        let body = ByteStream::from_path(local)
            .await
            .with_context(|| format!("Failed to create ByteStream from file: {}", local.display()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type("application/gzip")
            .server_side_encryption(ServerSideEncryption::Aes256)
            .set_metadata(Some(metadata.clone()))
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to upload file {} to S3 bucket {} with key {}",
                    local.display(),
                    self.bucket,
                    key
                )
            })?;
        Ok(())
    }

    async fn put_text(&self, key: &str, body: String) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body.into_bytes()))
            .content_type("text/plain; charset=utf-8")
            .server_side_encryption(ServerSideEncryption::Aes256)
            .send()
            .await
            .with_context(|| format!("Failed to upload s3://{}/{}", self.bucket, key))?;
        Ok(())
    }

    async fn get_file(&self, key: &str, dest: &Path) -> Result<()> {
        if let Some(parent_dir) = dest.parent() {
            tokio::fs::create_dir_all(parent_dir)
                .await
                .with_context(|| format!("Failed to create directory for download: {}", parent_dir.display()))?;
        }

        let mut object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to get object s3://{}/{}", self.bucket, key))?;

        let partial = PartialFile::new(PathBuf::from(format!("{}{}", dest.display(), PARTIAL_SUFFIX)));
        let mut output_file = File::create(partial.path())
            .await
            .with_context(|| format!("Failed to create destination file: {}", partial.path().display()))?;
        let mut total_bytes_downloaded = 0;
        while let Some(bytes_chunk) = object
            .body
            .try_next()
            .await
            .with_context(|| format!("Download of s3://{}/{} was interrupted", self.bucket, key))?
        {
            output_file
                .write_all(&bytes_chunk)
                .await
                .with_context(|| format!("Failed to write to destination file: {}", partial.path().display()))?;
            total_bytes_downloaded += bytes_chunk.len();
        }
        output_file.flush().await?;
        output_file.sync_all().await?;
        drop(output_file);

        partial
            .replace(dest)
            .with_context(|| format!("Failed to move download into place: {}", dest.display()))?;
        tracing::info!(
            "✅ Successfully downloaded {} bytes from s3://{}/{} to {}",
            total_bytes_downloaded,
            self.bucket,
            key,
            dest.display()
        );
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<RemoteArtifact>> {
        let list_prefix = join_key(self.prefix(), &format!("{}_backup_", namespace));
        let mut listed = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&list_prefix)
                .set_continuation_token(continuation_token.clone())
                .send()
                .await
                .with_context(|| format!("Failed to list s3://{}/{}", self.bucket, list_prefix))?;

            for object in resp.contents() {
                let Some(key) = object.key() else { continue };
                // The listing prefix also matches longer namespaces such as `app_backup_x`.
                match ArtifactName::from_key(key) {
                    Some(name) if name.namespace == namespace => listed.push(RemoteArtifact {
                        key: key.to_string(),
                        name,
                        size_bytes: object.size().unwrap_or(0).max(0) as u64,
                    }),
                    _ => {}
                }
            }

            if resp.is_truncated() == Some(true) {
                continuation_token = resp.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        listed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listed)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to delete s3://{}/{}", self.bucket, key))?;
        Ok(())
    }
}
