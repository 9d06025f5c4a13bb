// dbvault/src/restore/verification.rs
use crate::datastore::DataStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostVerification {
    pub passed: bool,
    pub detail: String,
}

/// Sanity check of a freshly restored target: at least `min_objects` user
/// tables must exist. A failed query counts as inconclusive, not as an
/// error.
pub async fn verify_restored_target(store: &dyn DataStore, min_objects: i64) -> PostVerification {
    match store.count_objects().await {
        Ok(count) if count >= min_objects => {
            tracing::info!("✓ Found {} tables in restored '{}'", count, store.name());
            PostVerification {
                passed: true,
                detail: format!("{} tables present", count),
            }
        }
        Ok(count) => PostVerification {
            passed: false,
            detail: format!(
                "found {} tables in '{}', expected at least {}",
                count,
                store.name(),
                min_objects
            ),
        },
        Err(e) => PostVerification {
            passed: false,
            detail: format!("could not count tables in '{}': {:#}", store.name(), e),
        },
    }
}
