// dbvault/src/artifact.rs
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::WalkDir;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
pub const PARTIAL_SUFFIX: &str = ".partial";

/// What a dump contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupScope {
    Full,
    SchemaOnly,
}

impl BackupScope {
    pub fn extension(self) -> &'static str {
        match self {
            BackupScope::Full => "sql.gz",
            BackupScope::SchemaOnly => "schema.sql.gz",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "sql.gz" => Some(BackupScope::Full),
            "schema.sql.gz" => Some(BackupScope::SchemaOnly),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupScope::Full => "full",
            BackupScope::SchemaOnly => "schema-only",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStatus {
    Unverified,
    Valid,
    Invalid,
}

/// `<namespace>_backup_<YYYYMMDD_HHMMSS>.<ext>`, the identity of an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub namespace: String,
    pub timestamp: DateTime<Utc>,
    pub scope: BackupScope,
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9_-]+)_backup_(\d{8}_\d{6})\.([a-z.]+)$")
            .expect("artifact name pattern is a valid regex")
    })
}

pub fn is_valid_namespace(namespace: &str) -> bool {
    !namespace.is_empty()
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl ArtifactName {
    pub fn new(namespace: &str, timestamp: DateTime<Utc>, scope: BackupScope) -> Self {
        // Sub-second precision is not representable in the file name.
        let timestamp = Utc
            .timestamp_opt(timestamp.timestamp(), 0)
            .single()
            .unwrap_or(timestamp);
        ArtifactName {
            namespace: namespace.to_string(),
            timestamp,
            scope,
        }
    }

    /// Parses a bare file name. Returns `None` for anything that does not
    /// follow the naming convention, including in-flight `.partial` files.
    pub fn parse(file_name: &str) -> Option<Self> {
        let caps = name_pattern().captures(file_name)?;
        let namespace = caps.get(1)?.as_str();
        let naive = NaiveDateTime::parse_from_str(caps.get(2)?.as_str(), TIMESTAMP_FORMAT).ok()?;
        let scope = BackupScope::from_extension(caps.get(3)?.as_str())?;
        Some(ArtifactName {
            namespace: namespace.to_string(),
            timestamp: Utc.from_utc_datetime(&naive),
            scope,
        })
    }

    /// Parses the last path component of a local path or a remote key.
    pub fn from_key(key: &str) -> Option<Self> {
        let file_name = key.rsplit('/').next()?;
        Self::parse(file_name)
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_backup_{}.{}",
            self.namespace,
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.scope.extension()
        )
    }

    pub fn next_second(&self) -> Self {
        ArtifactName {
            namespace: self.namespace.clone(),
            timestamp: self.timestamp + chrono::Duration::seconds(1),
            scope: self.scope,
        }
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

impl Ord for ArtifactName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.file_name().cmp(&other.file_name()))
    }
}

impl PartialOrd for ArtifactName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A point-in-time backup file and what is known about it.
#[derive(Debug, Clone)]
pub struct BackupArtifact {
    pub name: ArtifactName,
    pub local_path: PathBuf,
    pub remote_key: Option<String>,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    pub status: VerificationStatus,
}

impl BackupArtifact {
    pub fn local(name: ArtifactName, local_path: PathBuf) -> Self {
        let size_bytes = std::fs::metadata(&local_path).map(|m| m.len()).unwrap_or(0);
        BackupArtifact {
            name,
            local_path,
            remote_key: None,
            size_bytes,
            sha256: None,
            status: VerificationStatus::Unverified,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == VerificationStatus::Valid
    }
}

/// Lists the artifacts of `namespace` directly inside `dir`, oldest first.
/// A missing directory is an empty set.
pub fn list_local_artifacts(dir: &Path, namespace: &str) -> Result<Vec<(ArtifactName, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to read backup directory: {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(file_name) = entry.file_name().to_str() else {
            continue;
        };
        if let Some(name) = ArtifactName::parse(file_name) {
            if name.namespace == namespace {
                found.push((name, entry.path().to_path_buf()));
            }
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

/// The newest local artifact of `namespace`, by embedded timestamp.
pub fn latest_local_artifact(dir: &Path, namespace: &str) -> Result<Option<(ArtifactName, PathBuf)>> {
    Ok(list_local_artifacts(dir, namespace)?.pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn ts(s: &str) -> DateTime<Utc> {
        Utc.from_utc_datetime(&NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).unwrap())
    }

    #[test]
    fn test_name_formats_and_parses() {
        let name = ArtifactName::new("orders_db", ts("20240305_141500"), BackupScope::Full);
        assert_eq!(name.file_name(), "orders_db_backup_20240305_141500.sql.gz");
        assert_eq!(ArtifactName::parse(&name.file_name()), Some(name));

        let schema = ArtifactName::parse("orders_db_backup_20240305_141500.schema.sql.gz").unwrap();
        assert_eq!(schema.scope, BackupScope::SchemaOnly);
        assert_eq!(schema.namespace, "orders_db");
    }

    #[test]
    fn test_parse_rejects_foreign_and_partial_files() {
        assert!(ArtifactName::parse("orders_backup_20240305_141500.sql.gz.partial").is_none());
        assert!(ArtifactName::parse("orders_backup_2024030_141500.sql.gz").is_none());
        assert!(ArtifactName::parse("orders_backup_20240305_141500.tar").is_none());
        assert!(ArtifactName::parse("README.md").is_none());
        assert!(ArtifactName::parse("orders_backup_20241305_141500.sql.gz").is_none());
    }

    #[test]
    fn test_namespace_may_contain_backup_word() {
        let name = ArtifactName::parse("my_backup_service_backup_20240101_000000.sql.gz").unwrap();
        assert_eq!(name.namespace, "my_backup_service");
    }

    #[test]
    fn test_from_key_uses_last_component() {
        let name = ArtifactName::from_key("prod/db/app_backup_20240101_010203.sql.gz").unwrap();
        assert_eq!(name.namespace, "app");
        assert_eq!(name.timestamp, ts("20240101_010203"));
    }

    #[test]
    fn test_ordering_follows_embedded_timestamp() {
        let mut names = vec![
            ArtifactName::parse("app_backup_20240102_000000.sql.gz").unwrap(),
            ArtifactName::parse("app_backup_20231231_235959.sql.gz").unwrap(),
            ArtifactName::parse("app_backup_20240101_120000.schema.sql.gz").unwrap(),
        ];
        names.sort();
        let ordered: Vec<String> = names.iter().map(|n| n.file_name()).collect();
        assert_eq!(
            ordered,
            vec![
                "app_backup_20231231_235959.sql.gz",
                "app_backup_20240101_120000.schema.sql.gz",
                "app_backup_20240102_000000.sql.gz",
            ]
        );
    }

    #[test]
    fn test_list_local_ignores_mtime_and_other_namespaces() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        // Written newest-name first so mtime order disagrees with name order.
        for file in [
            "app_backup_20240301_000000.sql.gz",
            "app_backup_20240101_000000.sql.gz",
            "app-pre-restore_backup_20240401_000000.sql.gz",
            "app_backup_20240501_000000.sql.gz.partial",
            "notes.txt",
        ] {
            fs::write(dir.path().join(file), b"x")?;
        }
        let listed = list_local_artifacts(dir.path(), "app")?;
        let names: Vec<String> = listed.iter().map(|(n, _)| n.file_name()).collect();
        assert_eq!(
            names,
            vec!["app_backup_20240101_000000.sql.gz", "app_backup_20240301_000000.sql.gz"]
        );

        let latest = latest_local_artifact(dir.path(), "app")?.unwrap();
        assert_eq!(latest.0.file_name(), "app_backup_20240301_000000.sql.gz");
        Ok(())
    }

    #[test]
    fn test_missing_directory_is_empty_set() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let listed = list_local_artifacts(&dir.path().join("nope"), "app")?;
        assert!(listed.is_empty());
        Ok(())
    }

    #[test]
    fn test_new_truncates_subseconds() {
        let now = Utc::now();
        let name = ArtifactName::new("app", now, BackupScope::Full);
        assert_eq!(ArtifactName::parse(&name.file_name()), Some(name));
    }
}
