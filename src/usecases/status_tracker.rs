//! Tracks the outcome of the most recent backup attempt.
//!
//! `current()` is a cheap synchronous read of the cached record; `record()` swaps in a complete
//! new record, then persists it. Persistence failures are logged, never surfaced.

use crate::domain::{BackupOutcome, BackupStatusRecord};
use crate::ports::StatusPort;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

pub struct BackupStatusTracker {
    current: RwLock<BackupStatusRecord>,
    store: Arc<dyn StatusPort>,
    /// Keeps swap + save in the same order across concurrent recorders.
    persist: tokio::sync::Mutex<()>,
}

impl BackupStatusTracker {
    /// Load the persisted record, falling back to the "never run" sentinel.
    pub async fn load(store: Arc<dyn StatusPort>) -> Self {
        let current = match store.load_status().await {
            Ok(Some(record)) => record,
            Ok(None) => BackupStatusRecord::never_run(),
            Err(e) => {
                warn!(error = %e, "could not load backup status; starting fresh");
                BackupStatusRecord::never_run()
            }
        };
        Self {
            current: RwLock::new(current),
            store,
            persist: tokio::sync::Mutex::new(()),
        }
    }

    pub fn current(&self) -> BackupStatusRecord {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn record(&self, outcome: BackupOutcome) -> BackupStatusRecord {
        let _ordered = self.persist.lock().await;
        let record = {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            let next = BackupStatusRecord {
                last_attempt_at: Some(outcome.at),
                success: outcome.success,
                message: outcome.message,
                last_success_at: if outcome.success {
                    Some(outcome.at)
                } else {
                    current.last_success_at
                },
                artifact_id: outcome.artifact_id,
            };
            *current = next.clone();
            next
        };

        if let Err(e) = self.store.save_status(&record).await {
            warn!(error = %e, "could not persist backup status");
        }
        info!(success = record.success, message = %record.message, "backup status recorded");
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainError;
    use crate::test_support::MemoryStores;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn starts_with_never_run_sentinel() {
        let tracker = BackupStatusTracker::load(Arc::new(MemoryStores::default())).await;
        assert!(tracker.current().is_never_run());
    }

    #[tokio::test]
    async fn failure_keeps_last_success_time() {
        let stores = Arc::new(MemoryStores::default());
        let tracker = BackupStatusTracker::load(stores.clone()).await;
        let ok_at = Utc::now() - Duration::days(2);
        let fail_at = Utc::now();

        tracker
            .record(BackupOutcome::succeeded(ok_at, Some("a1".into())))
            .await;
        let rec = tracker
            .record(BackupOutcome::failed(
                fail_at,
                &DomainError::Network("down".into()),
            ))
            .await;

        assert!(!rec.success);
        assert_eq!(rec.last_attempt_at, Some(fail_at));
        assert_eq!(rec.last_success_at, Some(ok_at));
        assert_eq!(rec.artifact_id, None);
        assert_eq!(tracker.current(), rec);
        assert_eq!(stores.saved_status(), Some(rec));
    }

    #[tokio::test]
    async fn persisted_record_survives_reload() {
        let stores = Arc::new(MemoryStores::default());
        let tracker = BackupStatusTracker::load(stores.clone()).await;
        let rec = tracker
            .record(BackupOutcome::succeeded(Utc::now(), None))
            .await;

        let reloaded = BackupStatusTracker::load(stores).await;
        assert_eq!(reloaded.current(), rec);
    }

    #[tokio::test]
    async fn save_failure_still_updates_memory() {
        let stores = Arc::new(MemoryStores::default());
        stores.fail_saves(true);
        let tracker = BackupStatusTracker::load(stores).await;

        let rec = tracker
            .record(BackupOutcome::succeeded(Utc::now(), None))
            .await;

        assert!(rec.success);
        assert_eq!(tracker.current(), rec);
    }
}
