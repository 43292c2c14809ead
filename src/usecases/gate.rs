//! Mutual exclusion over the live application state.
//!
//! Backups and restores both take this gate. `tokio::sync::Mutex` is fair, so a
//! restore that arrives while a backup runs is queued behind it, and vice versa.

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct LiveStateGate {
    inner: Arc<Mutex<()>>,
}

impl LiveStateGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access. Released when the guard drops.
    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.inner).lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn second_holder_waits_for_the_first() {
        let gate = LiveStateGate::new();
        let first = gate.acquire().await;

        let waiting = tokio::time::timeout(Duration::from_millis(50), gate.acquire()).await;
        assert!(waiting.is_err());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), gate.acquire()).await;
        assert!(second.is_ok());
    }
}
