// dbvault/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::artifact::is_valid_namespace;
use crate::secrets::SecretsProvider;

const DEFAULT_BACKUP_DIR: &str = "./backups";
const DEFAULT_DATABASE_URL_SECRET: &str = "DATABASE_URL";
const DEFAULT_DUMP_SECS: u64 = 3600;
const DEFAULT_TRANSFER_SECS: u64 = 900;
const DEFAULT_REPLAY_SECS: u64 = 3600;

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRetention {
    pub local_days: u32,
    pub remote_days: u32,
    pub remote_cold_days: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonTimeouts {
    pub dump_secs: Option<u64>,
    pub transfer_secs: Option<u64>,
    pub replay_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRestoreOptions {
    #[serde(default)]
    pub upload_safety_backup: bool,
    pub min_objects: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub namespace: Option<String>,
    pub database_url_secret: Option<String>,
    pub local_backup_dir: Option<PathBuf>,
    pub retention: Option<JsonRetention>,
    pub timeouts: Option<JsonTimeouts>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub remote_dir: Option<PathBuf>,
    pub notify_command: Option<Vec<String>>,
    pub restore: Option<JsonRestoreOptions>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
}

/// Where uploaded artifacts live.
#[derive(Debug, Clone)]
pub enum RemoteConfig {
    Spaces(SpacesConfig),
    Directory(PathBuf),
}

/// Maximum artifact age per storage tier. The cold tier is enforced by the
/// bucket's lifecycle rules; it is carried here only for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub local_days: u32,
    pub remote_days: u32,
    pub remote_cold_days: Option<u32>,
}

impl RetentionPolicy {
    pub fn local_max_age(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.local_days))
    }

    pub fn remote_max_age(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.remote_days))
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            local_days: 7,
            remote_days: 30,
            remote_cold_days: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTimeouts {
    pub dump: Duration,
    pub transfer: Duration,
    pub replay: Duration,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        StepTimeouts {
            dump: Duration::from_secs(DEFAULT_DUMP_SECS),
            transfer: Duration::from_secs(DEFAULT_TRANSFER_SECS),
            replay: Duration::from_secs(DEFAULT_REPLAY_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub namespace: String,
    pub local_backup_dir: PathBuf,
    pub retention: RetentionPolicy,
    pub timeouts: StepTimeouts,
    pub upload: bool,
}

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub namespace: String,
    pub local_backup_dir: PathBuf,
    pub retention: RetentionPolicy,
    pub timeouts: StepTimeouts,
    pub upload_safety_backup: bool,
    pub min_objects: i64,
}

impl RestoreConfig {
    /// Backup settings for the snapshot taken right before a restore. Safety
    /// snapshots get their own namespace so `--latest` never picks one up.
    pub fn safety_backup_config(&self) -> BackupConfig {
        BackupConfig {
            namespace: format!("{}-pre-restore", self.namespace),
            local_backup_dir: self.local_backup_dir.clone(),
            retention: self.retention,
            timeouts: self.timeouts,
            upload: self.upload_safety_backup,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub namespace: String,
    pub database_url_secret: String,
    pub remote: Option<RemoteConfig>,
    pub notify_command: Option<Vec<String>>,
    pub raw_json_config: RawJsonConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw_json_config: RawJsonConfig) -> Result<Self> {
        let namespace = raw_json_config
            .namespace
            .as_ref()
            .context("namespace must be set in config.json")?
            .trim()
            .to_string();
        if !is_valid_namespace(&namespace) {
            anyhow::bail!(
                "namespace '{}' may only contain ASCII letters, digits, '_' and '-'",
                namespace
            );
        }

        if raw_json_config.s3_storage.is_some() && raw_json_config.remote_dir.is_some() {
            anyhow::bail!("s3_storage and remote_dir are mutually exclusive in config.json");
        }

        let remote = raw_json_config
            .remote_dir
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .map(RemoteConfig::Directory);

        if let Some(cmd) = &raw_json_config.notify_command {
            if cmd.is_empty() || cmd[0].trim().is_empty() {
                anyhow::bail!("notify_command must name a program when present");
            }
        }

        Ok(AppConfig {
            namespace,
            database_url_secret: raw_json_config
                .database_url_secret
                .clone()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DATABASE_URL_SECRET.to_string()),
            remote,
            notify_command: raw_json_config.notify_command.clone(),
            raw_json_config,
        })
    }

    /// Resolves S3 settings, pulling keys that are absent from the JSON out of
    /// the secrets provider. Incomplete S3 sections disable remote storage.
    pub fn resolve_remote(&mut self, secrets: &dyn SecretsProvider) -> Result<()> {
        let Some(s3_raw) = self.raw_json_config.s3_storage.clone() else {
            return Ok(());
        };
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());

        let access_key_id = non_empty(&s3_raw.access_key_id)
            .or_else(|| secrets.get("S3_ACCESS_KEY_ID").ok());
        let secret_access_key = non_empty(&s3_raw.secret_access_key)
            .or_else(|| secrets.get("S3_SECRET_ACCESS_KEY").ok());

        match (
            non_empty(&s3_raw.bucket_name),
            non_empty(&s3_raw.region),
            access_key_id,
            secret_access_key,
            non_empty(&s3_raw.endpoint_url),
        ) {
            (Some(bucket_name), Some(region), Some(access_key_id), Some(secret_access_key), Some(endpoint_url)) => {
                self.remote = Some(RemoteConfig::Spaces(SpacesConfig {
                    bucket_name,
                    region,
                    access_key_id,
                    secret_access_key,
                    endpoint_url,
                    folder_prefix: non_empty(&s3_raw.folder_prefix)
                        .map(|p| p.trim_matches('/').to_string()),
                }));
            }
            _ => {
                tracing::warn!(
                    "⚠️ s3_storage is present in config.json but some required fields (bucket_name, region, endpoint_url, access keys) are missing or empty. Remote storage is disabled."
                );
            }
        }
        Ok(())
    }
}

fn load_retention(raw_config: &RawJsonConfig) -> Result<RetentionPolicy> {
    let retention = match &raw_config.retention {
        Some(r) => RetentionPolicy {
            local_days: r.local_days,
            remote_days: r.remote_days,
            remote_cold_days: r.remote_cold_days,
        },
        None => RetentionPolicy::default(),
    };
    // A zero-day window would prune the artifact the current run just made.
    if retention.local_days == 0 || retention.remote_days == 0 {
        anyhow::bail!("retention.local_days and retention.remote_days must be at least 1");
    }
    Ok(retention)
}

fn load_timeouts(raw_config: &RawJsonConfig) -> Result<StepTimeouts> {
    let raw = raw_config.timeouts.clone().unwrap_or_default();
    let pick = |v: Option<u64>, default: u64, field: &str| -> Result<Duration> {
        match v {
            Some(0) => Err(anyhow::anyhow!("timeouts.{} must be greater than zero", field)),
            Some(secs) => Ok(Duration::from_secs(secs)),
            None => Ok(Duration::from_secs(default)),
        }
    };
    Ok(StepTimeouts {
        dump: pick(raw.dump_secs, DEFAULT_DUMP_SECS, "dump_secs")?,
        transfer: pick(raw.transfer_secs, DEFAULT_TRANSFER_SECS, "transfer_secs")?,
        replay: pick(raw.replay_secs, DEFAULT_REPLAY_SECS, "replay_secs")?,
    })
}

fn local_backup_dir(raw_config: &RawJsonConfig) -> Result<PathBuf> {
    let dir = raw_config
        .local_backup_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_DIR));
    if dir.as_os_str().is_empty() {
        return Err(anyhow::anyhow!(
            "local_backup_dir cannot be empty in config.json."
        ));
    }
    Ok(dir)
}

pub fn load_backup_config_from_json(app_config: &AppConfig, no_upload: bool) -> Result<BackupConfig> {
    let raw_config = &app_config.raw_json_config;
    Ok(BackupConfig {
        namespace: app_config.namespace.clone(),
        local_backup_dir: local_backup_dir(raw_config)?,
        retention: load_retention(raw_config)?,
        timeouts: load_timeouts(raw_config)?,
        upload: app_config.remote.is_some() && !no_upload,
    })
}

pub fn load_restore_config_from_json(app_config: &AppConfig) -> Result<RestoreConfig> {
    let raw_config = &app_config.raw_json_config;
    let restore_opts = raw_config.restore.clone().unwrap_or_default();
    let min_objects = restore_opts.min_objects.unwrap_or(1);
    if min_objects < 1 {
        anyhow::bail!("restore.min_objects must be at least 1");
    }
    Ok(RestoreConfig {
        namespace: app_config.namespace.clone(),
        local_backup_dir: local_backup_dir(raw_config)?,
        retention: load_retention(raw_config)?,
        timeouts: load_timeouts(raw_config)?,
        upload_safety_backup: restore_opts.upload_safety_backup && app_config.remote.is_some(),
        min_objects,
    })
}
