use anyhow::{Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use url::Url;
use which::which;

/// Finds an executable in the system PATH.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).with_context(|| {
        format!(
            "{} executable not found in PATH. Please ensure the client tools are installed and in your PATH.",
            name
        )
    })
}

/// Removes the password from a connection URL before it is logged.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}

/// Creates `dir` if needed and proves it is writable by creating and
/// removing a scratch file in it.
pub fn ensure_writable_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create backup directory: {}", dir.display()))?;
    tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Backup directory is not writable: {}", dir.display()))?;
    Ok(())
}

/// An in-flight `.partial` file, removed when dropped unless it was moved
/// into place. Dropping happens on errors, timeouts and cancellation alike.
#[derive(Debug)]
pub struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    pub fn new(path: PathBuf) -> Self {
        PartialFile { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Renames the file to `final_path`, refusing to replace an existing file.
    pub fn commit(mut self, final_path: &Path) -> io::Result<()> {
        if final_path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", final_path.display()),
            ));
        }
        std::fs::rename(&self.path, final_path)?;
        self.armed = false;
        Ok(())
    }

    /// Renames the file to `final_path`, replacing whatever is there.
    pub fn replace(mut self, final_path: &Path) -> io::Result<()> {
        std::fs::rename(&self.path, final_path)?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("⚠️ Failed to remove partial file {}: {}", self.path.display(), e);
                }
            } else {
                tracing::info!("🧹 Removed partial file {}", self.path.display());
            }
        }
    }
}
