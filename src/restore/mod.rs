pub(crate) mod db_restore; // Streams an artifact into the store's replay command
mod logic;
pub(crate) mod session; // Restore state machine and confirmation gate
pub(crate) mod verification;

pub use db_restore::GzipReplayer;
pub use logic::{RestoreOptions, RestoreOrchestrator, RestoreOutcome, RestoreSelection};
pub use session::StdinConfirmer;
