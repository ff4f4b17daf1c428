//! Startup recovery for jobs left in flight by a previous process.

use tracing::{info, warn};

use crate::error::DatabaseError;
use crate::store::traits::JobStore;

/// Return every `inprog` job to `failed` so the dispatcher retries it.
///
/// Must run once before the first claim. A send that actually went out
/// before the crash will be delivered again.
pub async fn recover(store: &dyn JobStore) -> Result<u64, DatabaseError> {
    let reset = store.reset_in_progress().await?;
    if reset > 0 {
        warn!(count = reset, "Recovered jobs stranded in progress");
    } else {
        info!("No in-progress jobs to recover");
    }
    Ok(reset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::{Job, JobState};
    use crate::store::LibSqlBackend;

    #[tokio::test]
    async fn recover_resets_claimed_jobs() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        // Nothing stranded on a fresh store.
        assert_eq!(recover(&store).await.unwrap(), 0);

        for to in ["a@example.com", "b@example.com"] {
            store
                .insert(&Job::new("k", to, "Hi", 10).with_text_body("x"))
                .await
                .unwrap();
        }
        store.claim_batch(10, 10).await.unwrap();

        assert_eq!(recover(&store).await.unwrap(), 2);
        assert!(store.list_by_state(JobState::InProgress).await.unwrap().is_empty());
        assert_eq!(store.list_by_state(JobState::Failed).await.unwrap().len(), 2);
    }
}
