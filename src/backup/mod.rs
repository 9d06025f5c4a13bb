pub(crate) mod db_dump; // Streams a store dump into a compressed artifact
pub(crate) mod integrity; // Structural verification of artifacts
mod logic;

pub use db_dump::{DumpProducer, GzipDumpProducer};
pub use integrity::{file_sha256, verify_artifact, verify_in_place};
pub use logic::BackupOrchestrator;
