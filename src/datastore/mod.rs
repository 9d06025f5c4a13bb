// dbvault/src/datastore/mod.rs
pub(crate) mod postgres;
#[cfg(test)]
pub(crate) mod testing;

use anyhow::Result;
use async_trait::async_trait;
use tokio::process::Command;

use crate::artifact::BackupScope;
use crate::secrets::SecretsProvider;

pub use postgres::PostgresStore;

/// The dump/restore contract of a data store.
///
/// Dump and replay are black-box subprocesses: exit status 0 means success,
/// anything else is a failure. The orchestrators never look inside the dump
/// beyond `dump_marker`.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Display name of the target. Never contains credentials.
    fn name(&self) -> &str;

    /// Fails when the credentials needed to reach the target are missing.
    fn credentials(&self) -> Result<()> {
        Ok(())
    }

    /// Executables that must be on `PATH` for dump and replay.
    fn required_tools(&self) -> Vec<&'static str>;

    /// Lightweight reachability check.
    async fn probe(&self) -> Result<()>;

    /// A command that writes a dump of `scope` to stdout.
    fn dump_command(&self, scope: BackupScope) -> Result<Command>;

    /// Bytes expected near the start of every decompressed dump.
    fn dump_marker(&self) -> &'static [u8];

    /// A command that reads a dump from stdin and applies it to the target.
    fn replay_command(&self) -> Result<Command>;

    /// Terminates other sessions on the target. Returns how many were ended.
    async fn drain_connections(&self) -> Result<u64>;

    /// Drops and recreates the target. Safe when the target does not exist.
    async fn reset_target(&self) -> Result<()>;

    /// Number of user tables in the target.
    async fn count_objects(&self) -> Result<i64>;
}

/// Opens the PostgreSQL target named by the `secret_name` secret. A missing
/// or malformed secret yields an `UnresolvedStore`, so the failure surfaces
/// in the run's prerequisite check rather than before the run starts.
pub fn open_postgres(secrets: &dyn SecretsProvider, secret_name: &str) -> Box<dyn DataStore> {
    let opened = secrets
        .get(secret_name)
        .map_err(anyhow::Error::from)
        .and_then(|url| PostgresStore::from_url(&url));
    match opened {
        Ok(store) => Box::new(store),
        Err(e) => Box::new(UnresolvedStore::new(secret_name, format!("{:#}", e))),
    }
}

/// A target whose connection secret could not be resolved. Every operation
/// fails with the resolution error.
#[derive(Debug)]
pub struct UnresolvedStore {
    label: String,
    reason: String,
}

impl UnresolvedStore {
    pub fn new(secret_name: &str, reason: String) -> Self {
        UnresolvedStore {
            label: format!("<unresolved {}>", secret_name),
            reason,
        }
    }

    fn fail<T>(&self) -> Result<T> {
        Err(anyhow::anyhow!("{}", self.reason))
    }
}

#[async_trait]
impl DataStore for UnresolvedStore {
    fn name(&self) -> &str {
        &self.label
    }

    fn credentials(&self) -> Result<()> {
        self.fail()
    }

    fn required_tools(&self) -> Vec<&'static str> {
        Vec::new()
    }

    async fn probe(&self) -> Result<()> {
        self.fail()
    }

    fn dump_command(&self, _scope: BackupScope) -> Result<Command> {
        self.fail()
    }

    fn dump_marker(&self) -> &'static [u8] {
        PostgresStore::DUMP_MARKER
    }

    fn replay_command(&self) -> Result<Command> {
        self.fail()
    }

    async fn drain_connections(&self) -> Result<u64> {
        self.fail()
    }

    async fn reset_target(&self) -> Result<()> {
        self.fail()
    }

    async fn count_objects(&self) -> Result<i64> {
        self.fail()
    }
}
