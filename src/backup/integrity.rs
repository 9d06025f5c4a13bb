// dbvault/src/backup/integrity.rs
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::artifact::{BackupArtifact, VerificationStatus};

/// How much decompressed data is searched for the dump marker.
const HEAD_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

impl VerificationResult {
    fn ok() -> Self {
        VerificationResult { valid: true, reason: None }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        VerificationResult {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Structural check of a compressed dump. Cheapest checks run first and the
/// first failure wins:
/// 1. the file exists and is non-empty,
/// 2. the gzip stream decompresses end to end with a matching CRC and length,
/// 3. the decompressed head contains `marker`.
pub fn verify_artifact(path: &Path, marker: &[u8]) -> VerificationResult {
    match std::fs::metadata(path) {
        Ok(meta) if !meta.is_file() => {
            return VerificationResult::invalid(format!("{} is not a regular file", path.display()));
        }
        Ok(meta) if meta.len() == 0 => return VerificationResult::invalid("artifact is empty"),
        Ok(_) => {}
        Err(e) => return VerificationResult::invalid(format!("artifact is not readable: {}", e)),
    }

    if let Err(e) = test_container(path) {
        return VerificationResult::invalid(format!("compression integrity test failed: {}", e));
    }

    match read_head(path) {
        Ok(head) if contains(&head, marker) => VerificationResult::ok(),
        Ok(_) => VerificationResult::invalid(format!(
            "dump marker '{}' not found in the first {} bytes",
            String::from_utf8_lossy(marker),
            HEAD_BYTES
        )),
        Err(e) => VerificationResult::invalid(format!("failed to read decompressed head: {}", e)),
    }
}

/// Runs `verify_artifact` and records the outcome on the artifact.
pub fn verify_in_place(artifact: &mut BackupArtifact, marker: &[u8]) -> VerificationResult {
    let result = verify_artifact(&artifact.local_path, marker);
    artifact.status = if result.valid {
        VerificationStatus::Valid
    } else {
        VerificationStatus::Invalid
    };
    result
}

/// Hex SHA-256 of a file's bytes, the same digest recorded as artifact
/// evidence.
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut File::open(path)?, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn test_container(path: &Path) -> io::Result<u64> {
    let mut decoder = GzDecoder::new(File::open(path)?);
    io::copy(&mut decoder, &mut io::sink())
}

fn read_head(path: &Path) -> io::Result<Vec<u8>> {
    let decoder = GzDecoder::new(File::open(path)?);
    let mut head = Vec::new();
    decoder.take(HEAD_BYTES).read_to_end(&mut head)?;
    Ok(head)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    const MARKER: &[u8] = b"-- PostgreSQL database dump";

    fn write_gz(path: &Path, content: &[u8]) {
        let mut enc = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        enc.write_all(content).unwrap();
        enc.finish().unwrap();
    }

    fn sample_dump() -> Vec<u8> {
        let mut dump = b"--\n-- PostgreSQL database dump\n--\nCREATE TABLE orders (id int);\n".to_vec();
        for i in 0..2000 {
            dump.extend_from_slice(format!("INSERT INTO orders VALUES ({});\n", i * 7919 % 10007).as_bytes());
        }
        dump
    }

    #[test]
    fn test_valid_artifact_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sql.gz");
        write_gz(&path, &sample_dump());
        assert_eq!(verify_artifact(&path, MARKER), VerificationResult::ok());
    }

    #[test]
    fn test_missing_and_empty_files_fail_first_check() {
        let dir = tempfile::tempdir().unwrap();
        let missing = verify_artifact(&dir.path().join("nope.sql.gz"), MARKER);
        assert!(!missing.valid);
        assert!(missing.reason.unwrap().contains("not readable"));

        let empty = dir.path().join("empty.sql.gz");
        File::create(&empty).unwrap();
        let result = verify_artifact(&empty, MARKER);
        assert_eq!(result.reason.as_deref(), Some("artifact is empty"));
    }

    #[test]
    fn test_flipped_byte_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sql.gz");
        write_gz(&path, &sample_dump());

        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let result = verify_artifact(&path, MARKER);
        assert!(!result.valid);
        assert!(result.reason.unwrap().contains("compression integrity"));
    }

    #[test]
    fn test_truncated_artifact_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sql.gz");
        write_gz(&path, &sample_dump());
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 6]).unwrap();
        assert!(!verify_artifact(&path, MARKER).valid);
    }

    #[test]
    fn test_plain_text_is_not_a_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sql.gz");
        std::fs::write(&path, sample_dump()).unwrap();
        let result = verify_artifact(&path, MARKER);
        assert!(result.reason.unwrap().contains("compression integrity"));
    }

    #[test]
    fn test_wrong_format_fails_marker_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sql.gz");
        write_gz(&path, b"this is not a database dump\n");
        let result = verify_artifact(&path, MARKER);
        assert!(!result.valid);
        assert!(result.reason.unwrap().contains("marker"));
    }

    #[test]
    fn test_verify_in_place_sets_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app_backup_20240101_000000.sql.gz");
        write_gz(&path, &sample_dump());
        let name = crate::artifact::ArtifactName::parse("app_backup_20240101_000000.sql.gz").unwrap();
        let mut artifact = BackupArtifact::local(name, path);
        assert_eq!(artifact.status, VerificationStatus::Unverified);
        verify_in_place(&mut artifact, MARKER);
        assert!(artifact.is_valid());
    }
}
