//! Remote store client: connection lifecycle, upload with retry, merged listing, idempotent delete.
//!
//! - Connection: Disconnected -> Connecting -> Connected; AuthExpired from any call drops back
//!   to Disconnected and publishes `ConnectionLost`
//! - Upload creates a pending artifact first (fixing its id), then transfers content, retrying
//!   transient `Network` errors with exponential backoff; the artifact ends success or failed
//! - Every transport call is bounded by a timeout

use crate::domain::{
    ArtifactStatus, BackupArtifact, BackupEvent, DomainError, RemoteConnection, UploadMetadata,
};
use crate::ports::RemoteTransport;
use crate::usecases::events::EventBus;
use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exponential backoff for transient upload failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): base * 2^retry, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(2),
            cap: Duration::from_secs(30),
        }
    }
}

pub struct RemoteStore {
    transport: Arc<dyn RemoteTransport>,
    connection: Mutex<RemoteConnection>,
    events: EventBus,
    retry: RetryPolicy,
    transfer_timeout: Duration,
    auth_timeout: Duration,
}

impl RemoteStore {
    pub fn new(transport: Arc<dyn RemoteTransport>, events: EventBus) -> Self {
        Self {
            transport,
            connection: Mutex::new(RemoteConnection::Disconnected),
            events,
            retry: RetryPolicy::default(),
            transfer_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, transfer: Duration, auth: Duration) -> Self {
        self.transfer_timeout = transfer;
        self.auth_timeout = auth;
        self
    }

    pub fn connection(&self) -> RemoteConnection {
        self.lock_connection().clone()
    }

    /// Start as Connected when the transport still holds a session from a previous run.
    pub async fn resume(&self, account_email: &str) -> bool {
        if !self.transport.has_session().await {
            debug!("no stored session to resume");
            return false;
        }
        let mut conn = self.lock_connection();
        if matches!(*conn, RemoteConnection::Disconnected) {
            *conn = RemoteConnection::Connected {
                account_email: account_email.to_string(),
            };
            info!(account = %account_email, "resumed storage session");
        }
        true
    }

    /// Interactive authorization. Cancellable until Connected; bounded by the auth timeout.
    pub async fn connect(
        &self,
        account_hint: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RemoteConnection, DomainError> {
        {
            let mut conn = self.lock_connection();
            match &*conn {
                RemoteConnection::Connecting { .. } => return Err(DomainError::ConnectionBusy),
                RemoteConnection::Connected { .. } => return Ok(conn.clone()),
                RemoteConnection::Disconnected => {
                    *conn = RemoteConnection::Connecting { since: Utc::now() }
                }
            }
        }
        // Reverts Connecting -> Disconnected on every early exit, including a dropped future.
        let mut guard = ConnectingGuard {
            store: self,
            armed: true,
        };

        info!(hint = account_hint.unwrap_or(""), "authorizing storage account");
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(DomainError::Cancelled),
            r = tokio::time::timeout(self.auth_timeout, self.transport.authorize(account_hint)) => {
                r.unwrap_or(Err(DomainError::AuthTimeout))
            }
        };
        let email = match result {
            Ok(email) => email,
            Err(e) => {
                warn!(error = %e, "authorization failed");
                return Err(e);
            }
        };

        let raced = {
            let mut conn = self.lock_connection();
            if matches!(*conn, RemoteConnection::Connecting { .. }) {
                *conn = RemoteConnection::Connected {
                    account_email: email.clone(),
                };
                false
            } else {
                true
            }
        };
        guard.armed = false;
        if raced {
            warn!("disconnected while authorizing; discarding grant");
            return Err(DomainError::Cancelled);
        }

        info!(account = %email, "storage account connected");
        self.events.publish(BackupEvent::Connected {
            account_email: email.clone(),
        });
        Ok(RemoteConnection::Connected {
            account_email: email,
        })
    }

    /// Always succeeds locally. A failed remote revoke is logged only.
    pub async fn disconnect(&self) {
        let previous = std::mem::replace(
            &mut *self.lock_connection(),
            RemoteConnection::Disconnected,
        );
        if self.transport.has_session().await {
            match self.bounded(None, self.transport.revoke()).await {
                Ok(()) => debug!("remote session revoked"),
                Err(e) => warn!(error = %e, "remote revoke failed; local disconnect stands"),
            }
        }
        if let RemoteConnection::Connected { account_email } = previous {
            info!(account = %account_email, "storage account disconnected");
        }
    }

    /// Account email of the live connection.
    pub fn require_connection(&self) -> Result<String, DomainError> {
        match &*self.lock_connection() {
            RemoteConnection::Connected { account_email } => Ok(account_email.clone()),
            RemoteConnection::Connecting { .. } => Err(DomainError::ConnectionBusy),
            RemoteConnection::Disconnected => Err(DomainError::NotConnected),
        }
    }

    /// Upload `blob` as a new artifact. Exactly one remote id is created per call.
    pub async fn upload(
        &self,
        blob: &[u8],
        metadata: &UploadMetadata,
        cancel: &CancellationToken,
    ) -> Result<BackupArtifact, DomainError> {
        self.require_connection()?;
        let transport = &self.transport;

        // Creating is not idempotent: a retry after a lost response would leave a second object.
        let mut artifact = self
            .bounded(Some(cancel), transport.create_pending(metadata))
            .await?;
        let id = artifact.id.clone();
        info!(artifact_id = %id, name = %artifact.name, size = blob.len(), "artifact created (pending)");

        let mut transfer = self
            .with_retry("put_content", Some(cancel), || {
                transport.put_content(&id, blob)
            })
            .await;
        if transfer.is_ok() {
            transfer = self
                .with_retry("set_status", Some(cancel), || {
                    transport.set_status(&id, ArtifactStatus::Success)
                })
                .await;
        }
        if let Err(e) = transfer {
            warn!(artifact_id = %id, error = %e, "upload failed");
            self.mark_failed(&id).await;
            return Err(e);
        }

        artifact.transition(ArtifactStatus::Success)?;
        artifact.size_bytes = blob.len() as u64;

        match self.bounded(None, transport.share_link(&id)).await {
            Ok(Some(link)) => artifact.shareable_link = Some(link),
            Ok(None) => {}
            Err(e) => warn!(artifact_id = %id, error = %e, "could not create shareable link"),
        }

        info!(artifact_id = %id, "upload complete");
        Ok(artifact)
    }

    /// Lazy, restartable page-by-page listing.
    pub fn list_cursor(&self) -> ListCursor<'_> {
        ListCursor::new(self)
    }

    /// Full listing, newest first by `created_at`, no duplicate ids.
    pub async fn list(&self) -> Result<Vec<BackupArtifact>, DomainError> {
        self.require_connection()?;
        let mut cursor = self.list_cursor();
        let mut all = Vec::new();
        while let Some(page) = cursor.next_page().await? {
            all.extend(page);
        }
        sort_newest_first(&mut all);
        debug!(count = all.len(), "remote listing complete");
        Ok(all)
    }

    pub async fn get(&self, id: &str) -> Result<BackupArtifact, DomainError> {
        self.require_connection()?;
        self.bounded(None, self.transport.get(id)).await
    }

    pub async fn download(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, DomainError> {
        self.require_connection()?;
        let blob = self
            .bounded(Some(cancel), self.transport.download(id))
            .await?;
        info!(artifact_id = %id, size = blob.len(), "artifact downloaded");
        Ok(blob)
    }

    /// Idempotent: an artifact already deleted by someone else counts as deleted.
    pub async fn delete(&self, id: &str) -> Result<(), DomainError> {
        self.require_connection()?;
        match self.bounded(None, self.transport.delete(id)).await {
            Ok(()) => {
                info!(artifact_id = %id, "artifact deleted");
                Ok(())
            }
            Err(DomainError::NotFound(_)) => {
                debug!(artifact_id = %id, "artifact already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Keep the newest `keep` successful artifacts; delete older successes and all failures.
    /// Pending artifacts younger than `stale_pending_after` may belong to an upload in flight and
    /// are left alone; older ones were abandoned (lost response, expired auth) and are removed.
    pub async fn retire_old(&self, keep: usize) -> Result<usize, DomainError> {
        let artifacts = self.list().await?;
        let stale_before = Utc::now()
            - chrono::Duration::from_std(self.stale_pending_after())
                .unwrap_or(chrono::Duration::hours(1));
        let mut kept = 0usize;
        let mut doomed = Vec::new();
        for a in artifacts {
            match a.status {
                ArtifactStatus::Success if kept < keep => kept += 1,
                ArtifactStatus::Success | ArtifactStatus::Failed => doomed.push(a.id),
                ArtifactStatus::Pending if a.created_at < stale_before => {
                    debug!(artifact_id = %a.id, "abandoned pending artifact");
                    doomed.push(a.id)
                }
                ArtifactStatus::Pending => {}
            }
        }

        let mut deleted = 0usize;
        for id in doomed {
            match self.delete(&id).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => warn!(artifact_id = %id, error = %e, "retention delete failed"),
            }
        }
        if deleted > 0 {
            info!(deleted, kept, "retired old artifacts");
        }
        Ok(deleted)
    }

    /// Longest an upload can keep an artifact pending: three retried steps, each with every
    /// attempt timing out and every backoff at its cap.
    pub fn stale_pending_after(&self) -> Duration {
        let attempts = self.retry.max_retries + 1;
        let step = self.transfer_timeout.saturating_mul(attempts)
            + self.retry.cap.saturating_mul(self.retry.max_retries);
        step.saturating_mul(3)
    }

    async fn mark_failed(&self, id: &str) {
        if let Err(e) = self
            .bounded(None, self.transport.set_status(id, ArtifactStatus::Failed))
            .await
        {
            warn!(artifact_id = %id, error = %e, "could not mark artifact failed");
        }
    }

    /// Timeout + optional cancellation around one transport call. Timeouts count as `Network`.
    async fn bounded<T, Fut>(
        &self,
        cancel: Option<&CancellationToken>,
        fut: Fut,
    ) -> Result<T, DomainError>
    where
        Fut: Future<Output = Result<T, DomainError>>,
    {
        let timed = tokio::time::timeout(self.transfer_timeout, fut);
        let outcome = match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Err(DomainError::Cancelled),
                r = timed => r,
            },
            None => timed.await,
        };
        let result = outcome.unwrap_or_else(|_| {
            Err(DomainError::Network(format!(
                "timed out after {}s",
                self.transfer_timeout.as_secs_f32()
            )))
        });
        self.observe(result)
    }

    async fn with_retry<T, F, Fut>(
        &self,
        op: &'static str,
        cancel: Option<&CancellationToken>,
        mut call: F,
    ) -> Result<T, DomainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DomainError>>,
    {
        let mut retry = 0u32;
        loop {
            match self.bounded(cancel, call()).await {
                Err(e) if e.is_transient() && retry < self.retry.max_retries => {
                    let delay = self.retry.delay_for(retry);
                    retry += 1;
                    warn!(
                        op,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure; backing off"
                    );
                    pause(delay, cancel).await?;
                }
                other => return other,
            }
        }
    }

    fn observe<T>(&self, result: Result<T, DomainError>) -> Result<T, DomainError> {
        if let Err(DomainError::AuthExpired) = &result {
            self.drop_connection("authorization expired");
        }
        result
    }

    fn drop_connection(&self, reason: &str) {
        let was_connected = {
            let mut conn = self.lock_connection();
            let was = matches!(*conn, RemoteConnection::Connected { .. });
            if was {
                *conn = RemoteConnection::Disconnected;
            }
            was
        };
        if was_connected {
            warn!(reason, "storage connection lost");
            self.events.publish(BackupEvent::ConnectionLost {
                reason: reason.to_string(),
            });
        }
    }

    fn lock_connection(&self) -> MutexGuard<'_, RemoteConnection> {
        self.connection.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct ConnectingGuard<'a> {
    store: &'a RemoteStore,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut conn = self.store.lock_connection();
            if matches!(*conn, RemoteConnection::Connecting { .. }) {
                *conn = RemoteConnection::Disconnected;
            }
        }
    }
}

async fn pause(delay: Duration, cancel: Option<&CancellationToken>) -> Result<(), DomainError> {
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(DomainError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        },
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

fn sort_newest_first(artifacts: &mut [BackupArtifact]) {
    artifacts.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Page cursor over the remote listing. Drops ids already yielded; a failed page can be
/// fetched again by calling `next_page` once more, and `restart` begins from the top.
pub struct ListCursor<'a> {
    store: &'a RemoteStore,
    next_token: Option<String>,
    done: bool,
    seen: HashSet<String>,
}

impl<'a> ListCursor<'a> {
    fn new(store: &'a RemoteStore) -> Self {
        Self {
            store,
            next_token: None,
            done: false,
            seen: HashSet::new(),
        }
    }

    /// Next batch of unseen artifacts (possibly empty), or `None` when exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<BackupArtifact>>, DomainError> {
        if self.done {
            return Ok(None);
        }
        let store = self.store;
        let token = self.next_token.clone();
        let page = store
            .with_retry("list_page", None, || {
                store.transport.list_page(token.as_deref())
            })
            .await?;

        self.done = page.next_page_token.is_none();
        self.next_token = page.next_page_token;
        let fresh: Vec<BackupArtifact> = page
            .artifacts
            .into_iter()
            .filter(|a| self.seen.insert(a.id.clone()))
            .collect();
        Ok(Some(fresh))
    }

    pub fn restart(&mut self) {
        self.next_token = None;
        self.done = false;
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::remote::{InMemoryTransport, TransportOp};
    use chrono::{DateTime, Duration as ChronoDuration};

    const ACCOUNT: &str = "owner@example.com";

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(5),
        }
    }

    fn store(transport: &Arc<InMemoryTransport>, events: EventBus) -> RemoteStore {
        RemoteStore::new(Arc::clone(transport) as Arc<dyn RemoteTransport>, events)
            .with_retry_policy(fast_retry())
    }

    async fn connected(transport: &Arc<InMemoryTransport>) -> RemoteStore {
        let s = store(transport, EventBus::new());
        s.connect(None, &CancellationToken::new()).await.unwrap();
        s
    }

    fn metadata(name: &str, created_at: DateTime<Utc>) -> UploadMetadata {
        UploadMetadata {
            name: name.to_string(),
            description: "test".into(),
            created_by: ACCOUNT.into(),
            created_at,
            size_bytes: 3,
            fingerprint: None,
        }
    }

    fn seeded(id: &str, created_at: DateTime<Utc>, status: ArtifactStatus) -> BackupArtifact {
        BackupArtifact {
            id: id.into(),
            name: id.into(),
            created_at,
            size_bytes: 1,
            created_by: ACCOUNT.into(),
            shareable_link: None,
            status,
            fingerprint: None,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(0), Duration::from_secs(2));
        assert_eq!(p.delay_for(1), Duration::from_secs(4));
        assert_eq!(p.delay_for(2), Duration::from_secs(8));
        assert_eq!(p.delay_for(4), Duration::from_secs(30));
        assert_eq!(p.delay_for(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn connect_publishes_and_sets_connected() {
        let transport = Arc::new(InMemoryTransport::new(ACCOUNT));
        let events = EventBus::new();
        let mut sub = events.subscribe();
        let s = store(&transport, events);

        let conn = s.connect(None, &CancellationToken::new()).await.unwrap();

        assert_eq!(conn.account_email(), Some(ACCOUNT));
        assert_eq!(s.require_connection().unwrap(), ACCOUNT);
        assert_eq!(
            sub.try_recv(),
            Some(BackupEvent::Connected {
                account_email: ACCOUNT.into()
            })
        );
    }

    #[tokio::test]
    async fn denied_authorization_reverts_to_disconnected() {
        let transport = Arc::new(InMemoryTransport::new(ACCOUNT));
        transport.fail_next(TransportOp::Authorize, DomainError::AuthDenied);
        let s = store(&transport, EventBus::new());

        let err = s.connect(None, &CancellationToken::new()).await.unwrap_err();

        assert_eq!(err, DomainError::AuthDenied);
        assert_eq!(s.connection(), RemoteConnection::Disconnected);
    }

    #[tokio::test]
    async fn slow_authorization_times_out() {
        let transport =
            Arc::new(InMemoryTransport::new(ACCOUNT).with_latency(Duration::from_millis(500)));
        let s = store(&transport, EventBus::new())
            .with_timeouts(Duration::from_secs(1), Duration::from_millis(20));

        let err = s.connect(None, &CancellationToken::new()).await.unwrap_err();

        assert_eq!(err, DomainError::AuthTimeout);
        assert_eq!(s.connection(), RemoteConnection::Disconnected);
    }

    #[tokio::test]
    async fn connect_can_be_cancelled() {
        let transport =
            Arc::new(InMemoryTransport::new(ACCOUNT).with_latency(Duration::from_millis(500)));
        let s = store(&transport, EventBus::new());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = s.connect(None, &cancel).await.unwrap_err();

        assert_eq!(err, DomainError::Cancelled);
        assert_eq!(s.connection(), RemoteConnection::Disconnected);
    }

    #[tokio::test]
    async fn connecting_blocks_other_operations() {
        let transport =
            Arc::new(InMemoryTransport::new(ACCOUNT).with_latency(Duration::from_millis(50)));
        let s = store(&transport, EventBus::new());
        let cancel = CancellationToken::new();

        let (connected, second, listing) = tokio::join!(
            s.connect(None, &cancel),
            async {
                tokio::task::yield_now().await;
                s.connect(None, &cancel).await
            },
            async {
                tokio::task::yield_now().await;
                s.list().await
            }
        );

        assert!(connected.is_ok());
        assert_eq!(second.unwrap_err(), DomainError::ConnectionBusy);
        assert_eq!(listing.unwrap_err(), DomainError::ConnectionBusy);
    }

    #[tokio::test]
    async fn disconnect_then_operations_fail_with_auth_error() {
        let transport = Arc::new(InMemoryTransport::new(ACCOUNT));
        let s = connected(&transport).await;
        s.disconnect().await;

        let cancel = CancellationToken::new();
        let up = s
            .upload(b"abc", &metadata("x", Utc::now()), &cancel)
            .await
            .unwrap_err();
        let list = s.list().await.unwrap_err();
        let down = s.download("anything", &cancel).await.unwrap_err();

        for err in [up, list, down] {
            assert!(err.is_auth(), "expected auth error, got {err:?}");
        }
        assert_eq!(transport.calls(TransportOp::CreatePending), 0);
    }

    #[tokio::test]
    async fn disconnect_survives_revoke_failure_and_is_idempotent() {
        let transport = Arc::new(InMemoryTransport::new(ACCOUNT));
        let s = connected(&transport).await;
        transport.fail_next(TransportOp::Revoke, DomainError::Network("reset".into()));

        s.disconnect().await;
        s.disconnect().await;

        assert_eq!(s.connection(), RemoteConnection::Disconnected);
    }

    #[tokio::test]
    async fn upload_retries_transient_failures_with_one_artifact() {
        let transport = Arc::new(InMemoryTransport::new(ACCOUNT));
        let s = connected(&transport).await;
        transport.fail_next(TransportOp::PutContent, DomainError::Network("reset".into()));
        transport.fail_next(TransportOp::PutContent, DomainError::Network("reset".into()));

        let artifact = s
            .upload(b"abc", &metadata("backup", Utc::now()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(artifact.status, ArtifactStatus::Success);
        assert_eq!(transport.calls(TransportOp::PutContent), 3);
        assert_eq!(transport.calls(TransportOp::CreatePending), 1);
        let stored = transport.objects();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, artifact.id);
        assert_eq!(stored[0].status, ArtifactStatus::Success);
    }

    #[tokio::test]
    async fn upload_gives_up_after_retries_and_marks_failed() {
        let transport = Arc::new(InMemoryTransport::new(ACCOUNT));
        let s = connected(&transport).await;
        for _ in 0..4 {
            transport.fail_next(TransportOp::PutContent, DomainError::Network("down".into()));
        }

        let err = s
            .upload(b"abc", &metadata("backup", Utc::now()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::Network(_)));
        assert_eq!(transport.calls(TransportOp::PutContent), 4);
        let stored = transport.objects();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, ArtifactStatus::Failed);
    }

    #[tokio::test]
    async fn create_is_attempted_once() {
        let transport = Arc::new(InMemoryTransport::new(ACCOUNT));
        let s = connected(&transport).await;
        transport.fail_next(TransportOp::CreatePending, DomainError::Network("reset".into()));

        let err = s
            .upload(b"abc", &metadata("backup", Utc::now()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::Network(_)));
        assert_eq!(transport.calls(TransportOp::CreatePending), 1);
        assert_eq!(transport.calls(TransportOp::PutContent), 0);
    }

    #[tokio::test]
    async fn refused_share_link_keeps_connection() {
        let transport = Arc::new(InMemoryTransport::new(ACCOUNT));
        let events = EventBus::new();
        let s = store(&transport, events.clone());
        s.connect(None, &CancellationToken::new()).await.unwrap();
        let mut sub = events.subscribe();
        transport.fail_next(
            TransportOp::ShareLink,
            DomainError::Io("Drive refused the request: publishOutNotPermitted".into()),
        );

        let artifact = s
            .upload(b"abc", &metadata("backup", Utc::now()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(artifact.status, ArtifactStatus::Success);
        assert_eq!(artifact.shareable_link, None);
        assert_eq!(s.require_connection().unwrap(), ACCOUNT);
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn auth_expired_is_not_retried_and_drops_connection() {
        let transport = Arc::new(InMemoryTransport::new(ACCOUNT));
        let events = EventBus::new();
        let s = store(&transport, events.clone());
        s.connect(None, &CancellationToken::new()).await.unwrap();
        let mut sub = events.subscribe();
        transport.fail_next(TransportOp::PutContent, DomainError::AuthExpired);

        let err = s
            .upload(b"abc", &metadata("backup", Utc::now()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, DomainError::AuthExpired);
        assert_eq!(transport.calls(TransportOp::PutContent), 1);
        assert_eq!(s.connection(), RemoteConnection::Disconnected);
        assert!(matches!(
            sub.try_recv(),
            Some(BackupEvent::ConnectionLost { .. })
        ));
    }

    #[tokio::test]
    async fn quota_exceeded_surfaces_immediately() {
        let transport = Arc::new(InMemoryTransport::new(ACCOUNT).with_quota(2));
        let s = connected(&transport).await;

        let err = s
            .upload(b"abc", &metadata("backup", Utc::now()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, DomainError::QuotaExceeded);
        assert_eq!(transport.calls(TransportOp::PutContent), 1);
        assert_eq!(transport.objects()[0].status, ArtifactStatus::Failed);
    }

    #[tokio::test]
    async fn cancelled_upload_leaves_failed_artifact() {
        let transport =
            Arc::new(InMemoryTransport::new(ACCOUNT).with_latency(Duration::from_millis(300)));
        let s = store(&transport, EventBus::new());
        s.connect(None, &CancellationToken::new()).await.unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = s
            .upload(b"abc", &metadata("backup", Utc::now()), &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, DomainError::Cancelled);
        let stored = transport.objects();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, ArtifactStatus::Failed);
    }

    #[tokio::test]
    async fn listing_merges_pages_newest_first_without_duplicates() {
        let transport = Arc::new(InMemoryTransport::new(ACCOUNT).with_page_size(2));
        let s = connected(&transport).await;
        let now = Utc::now();
        let cancel = CancellationToken::new();
        for offset in [3i64, 0, 4, 1, 2] {
            s.upload(
                b"abc",
                &metadata(&format!("b{offset}"), now - ChronoDuration::hours(offset)),
                &cancel,
            )
            .await
            .unwrap();
        }
        transport.fail_next(TransportOp::ListPage, DomainError::Network("blip".into()));

        let listed = s.list().await.unwrap();

        let names: Vec<_> = listed.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["b0", "b1", "b2", "b3", "b4"]);
        let ids: HashSet<_> = listed.iter().map(|a| a.id.clone()).collect();
        assert_eq!(ids.len(), listed.len());
    }

    #[tokio::test]
    async fn listing_orders_by_creation_not_insertion() {
        let transport = Arc::new(InMemoryTransport::new(ACCOUNT));
        let now = Utc::now();
        let b = seeded("backup-B", now, ArtifactStatus::Pending);
        let mut a = seeded("backup-A", now - ChronoDuration::minutes(5), ArtifactStatus::Success);
        a.size_bytes = 2_500_000;
        transport.insert(a, vec![0; 16]);
        transport.insert(b, Vec::new());
        let s = connected(&transport).await;

        let listed = s.list().await.unwrap();

        let names: Vec<_> = listed.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["backup-B", "backup-A"]);
    }

    #[tokio::test]
    async fn cursor_can_restart() {
        let transport = Arc::new(InMemoryTransport::new(ACCOUNT).with_page_size(1));
        let now = Utc::now();
        transport.insert(seeded("a", now, ArtifactStatus::Success), vec![]);
        transport.insert(seeded("b", now, ArtifactStatus::Success), vec![]);
        let s = connected(&transport).await;

        let mut cursor = s.list_cursor();
        let first = cursor.next_page().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);
        cursor.restart();
        let again = cursor.next_page().await.unwrap().unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn deleting_a_missing_artifact_succeeds() {
        let transport = Arc::new(InMemoryTransport::new(ACCOUNT));
        let s = connected(&transport).await;

        s.delete("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn retention_keeps_newest_successes_and_fresh_pending() {
        let transport = Arc::new(InMemoryTransport::new(ACCOUNT));
        let now = Utc::now();
        for (id, hours, status) in [
            ("s1", 1, ArtifactStatus::Success),
            ("s2", 2, ArtifactStatus::Success),
            ("s3", 3, ArtifactStatus::Success),
            ("f1", 0, ArtifactStatus::Failed),
            ("p0", 5, ArtifactStatus::Pending),
            ("p1", 0, ArtifactStatus::Pending),
        ] {
            transport.insert(seeded(id, now - ChronoDuration::hours(hours), status), vec![]);
        }
        let s = connected(&transport).await;
        assert!(s.stale_pending_after() < Duration::from_secs(5 * 3600));

        let deleted = s.retire_old(2).await.unwrap();

        assert_eq!(deleted, 3);
        let left: Vec<_> = transport.objects().into_iter().map(|a| a.id).collect();
        assert_eq!(left, ["p1", "s1", "s2"]);
    }
}
