//! Caller-facing surface of the backup engine.
//!
//! Wires the components together and keeps the persisted connection fields in step with the
//! live connection: connect marks settings connected; disconnect or an expired authorization
//! marks them disconnected (which also turns cloud backup off).

use crate::domain::{
    ArtifactRef, BackupArtifact, BackupEvent, BackupSettings, BackupStatusRecord,
    ConfirmationToken, DomainError, RemoteConnection, RestoreResult, SettingsUpdate,
};
use crate::ports::{AppStatePort, RemoteTransport, SettingsPort, StatusPort};
use crate::shared::config::AppConfig;
use crate::usecases::events::{EventBus, Subscription};
use crate::usecases::gate::LiveStateGate;
use crate::usecases::remote_store::{RemoteStore, RetryPolicy};
use crate::usecases::restore::{RestoreController, RestorePlan};
use crate::usecases::scheduler::{BackupScheduler, TriggerSource};
use crate::usecases::settings_store::SettingsStore;
use crate::usecases::snapshot::SnapshotProducer;
use crate::usecases::status_tracker::BackupStatusTracker;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub retry: RetryPolicy,
    pub transfer_timeout: Duration,
    pub auth_timeout: Duration,
    pub restore_token_ttl: Duration,
    pub staging_dir: Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            transfer_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(120),
            restore_token_ttl: Duration::from_secs(300),
            staging_dir: None,
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            retry: config.retry_policy(),
            transfer_timeout: config.transfer_timeout(),
            auth_timeout: config.auth_timeout(),
            restore_token_ttl: config.restore_token_ttl(),
            staging_dir: Some(config.data_dir_or_default().join("staging")),
        }
    }
}

pub struct BackupEngine {
    settings: Arc<SettingsStore>,
    remote: Arc<RemoteStore>,
    tracker: Arc<BackupStatusTracker>,
    scheduler: Arc<BackupScheduler>,
    restore: RestoreController,
    events: EventBus,
}

impl BackupEngine {
    /// Load persisted settings and status, and resume a stored storage session if there is one.
    pub async fn new(
        app: Arc<dyn AppStatePort>,
        transport: Arc<dyn RemoteTransport>,
        settings_port: Arc<dyn SettingsPort>,
        status_port: Arc<dyn StatusPort>,
        options: EngineOptions,
    ) -> Result<Self, DomainError> {
        let events = EventBus::new();
        let remote = Arc::new(
            RemoteStore::new(transport, events.clone())
                .with_retry_policy(options.retry)
                .with_timeouts(options.transfer_timeout, options.auth_timeout),
        );
        let settings = Arc::new(SettingsStore::load(settings_port).await?);
        let tracker = Arc::new(BackupStatusTracker::load(status_port).await);

        if let Some(email) = settings.get().google_account_email {
            if !remote.resume(&email).await {
                warn!(account = %email, "stored session is gone; marking account disconnected");
                settings.mark_disconnected().await?;
            }
        }

        let gate = LiveStateGate::new();
        let scheduler = Arc::new(BackupScheduler::new(
            Arc::clone(&settings),
            SnapshotProducer::new(Arc::clone(&app)),
            Arc::clone(&remote),
            Arc::clone(&tracker),
            events.clone(),
            gate.clone(),
        ));
        let mut restore = RestoreController::new(Arc::clone(&remote), app, gate, events.clone())
            .with_token_ttl(options.restore_token_ttl);
        if let Some(dir) = options.staging_dir {
            restore = restore.with_staging_dir(dir);
        }

        Ok(Self {
            settings,
            remote,
            tracker,
            scheduler,
            restore,
            events,
        })
    }

    pub async fn connect(
        &self,
        account_hint: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RemoteConnection, DomainError> {
        let connection = self.remote.connect(account_hint, cancel).await?;
        if let Some(email) = connection.account_email() {
            self.settings.mark_connected(email).await?;
        }
        Ok(connection)
    }

    /// Never fails on the remote side; only a settings write can fail.
    pub async fn disconnect(&self) -> Result<BackupSettings, DomainError> {
        self.remote.disconnect().await;
        self.settings.mark_disconnected().await
    }

    pub async fn run_backup(&self) -> Result<BackupStatusRecord, DomainError> {
        let result = self.scheduler.trigger(TriggerSource::Manual).await;
        self.observe(result).await
    }

    pub fn cancel_backup(&self) -> bool {
        self.scheduler.cancel_running()
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupArtifact>, DomainError> {
        let result = self.remote.list().await;
        self.observe(result).await
    }

    pub async fn delete_backup(&self, id: &str) -> Result<(), DomainError> {
        let result = self.remote.delete(id).await;
        self.observe(result).await
    }

    pub async fn prepare_restore(&self, reference: &ArtifactRef) -> Result<RestorePlan, DomainError> {
        let result = self.restore.prepare(reference).await;
        self.observe(result).await
    }

    pub async fn restore(
        &self,
        reference: &ArtifactRef,
        token: Option<&ConfirmationToken>,
        cancel: &CancellationToken,
    ) -> Result<RestoreResult, DomainError> {
        let result = self.restore.restore(reference, token, cancel).await;
        self.observe(result).await
    }

    pub fn get_settings(&self) -> BackupSettings {
        self.settings.get()
    }

    pub async fn update_settings(&self, update: SettingsUpdate) -> Result<BackupSettings, DomainError> {
        self.settings.update(update).await
    }

    pub fn status(&self) -> BackupStatusRecord {
        self.tracker.current()
    }

    pub fn connection(&self) -> RemoteConnection {
        self.remote.connection()
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.scheduler.next_due()
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Start the timer loop and the connection watcher. Both stop when `shutdown` fires.
    pub fn spawn_scheduler(&self, tick: Duration, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let scheduler = Arc::clone(&self.scheduler).run_loop(tick, shutdown.clone());

        let settings = Arc::clone(&self.settings);
        let mut events = self.events.subscribe();
        let watcher = async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    e = events.recv() => e,
                };
                match event {
                    Some(BackupEvent::ConnectionLost { reason }) => {
                        info!(reason = %reason, "connection lost; updating settings");
                        if let Err(e) = settings.mark_disconnected().await {
                            warn!(error = %e, "could not record disconnection");
                        }
                    }
                    Some(other) => debug!(event = ?other, "engine event"),
                    None => break,
                }
            }
        };

        vec![tokio::spawn(scheduler), tokio::spawn(watcher)]
    }

    async fn observe<T>(&self, result: Result<T, DomainError>) -> Result<T, DomainError> {
        if let Err(DomainError::AuthExpired) = &result {
            if let Err(e) = self.settings.mark_disconnected().await {
                warn!(error = %e, "could not record disconnection");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::remote::{InMemoryTransport, TransportOp};
    use crate::domain::ArtifactStatus;
    use crate::test_support::{MemoryAppState, MemoryStores};

    const ACCOUNT: &str = "owner@example.com";

    struct Setup {
        engine: BackupEngine,
        app: Arc<MemoryAppState>,
        transport: Arc<InMemoryTransport>,
        stores: Arc<MemoryStores>,
    }

    async fn setup(transport: InMemoryTransport, stores: Arc<MemoryStores>) -> Setup {
        let app = Arc::new(MemoryAppState::new(b"v1".to_vec()));
        let transport = Arc::new(transport);
        let engine = BackupEngine::new(
            Arc::clone(&app) as Arc<dyn AppStatePort>,
            Arc::clone(&transport) as Arc<dyn RemoteTransport>,
            Arc::clone(&stores) as Arc<dyn SettingsPort>,
            Arc::clone(&stores) as Arc<dyn StatusPort>,
            EngineOptions {
                retry: RetryPolicy {
                    max_retries: 1,
                    base: Duration::from_millis(1),
                    cap: Duration::from_millis(1),
                },
                ..Default::default()
            },
        )
        .await
        .unwrap();
        Setup {
            engine,
            app,
            transport,
            stores,
        }
    }

    async fn connected_and_enabled() -> Setup {
        let s = setup(InMemoryTransport::new(ACCOUNT), Arc::default()).await;
        s.engine
            .connect(None, &CancellationToken::new())
            .await
            .unwrap();
        s.engine
            .update_settings(SettingsUpdate {
                cloud_backup_enabled: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        s
    }

    #[tokio::test]
    async fn connect_records_account_in_settings() {
        let s = setup(InMemoryTransport::new(ACCOUNT), Arc::default()).await;

        s.engine
            .connect(None, &CancellationToken::new())
            .await
            .unwrap();

        let settings = s.engine.get_settings();
        assert!(settings.google_connected);
        assert_eq!(settings.google_account_email.as_deref(), Some(ACCOUNT));
        assert_eq!(s.stores.saved_settings(), Some(settings));
    }

    #[tokio::test]
    async fn backup_then_restore_round_trip() {
        let s = connected_and_enabled().await;

        let record = s.engine.run_backup().await.unwrap();
        assert!(record.success);
        assert_eq!(s.engine.status(), record);

        let listed = s.engine.list_backups().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ArtifactStatus::Success);
        assert_eq!(record.artifact_id.as_deref(), Some(listed[0].id.as_str()));

        s.app.replace_state(b"v2".to_vec());
        let target = ArtifactRef::Remote(listed[0].id.clone());
        let plan = s.engine.prepare_restore(&target).await.unwrap();
        s.engine
            .restore(&target, Some(&plan.token), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(s.app.state(), b"v1");
    }

    #[tokio::test]
    async fn operations_after_disconnect_fail_with_auth_errors() {
        let s = connected_and_enabled().await;
        s.engine.run_backup().await.unwrap();
        let id = s.engine.list_backups().await.unwrap()[0].id.clone();

        let settings = s.engine.disconnect().await.unwrap();
        assert!(!settings.google_connected);
        assert!(!settings.cloud_backup_enabled);

        let list = s.engine.list_backups().await.unwrap_err();
        assert!(list.is_auth(), "{list:?}");
        let prepare = s
            .engine
            .prepare_restore(&ArtifactRef::Remote(id))
            .await
            .unwrap_err();
        assert!(prepare.is_auth(), "{prepare:?}");
        assert_eq!(
            s.engine.run_backup().await.unwrap_err(),
            DomainError::CloudBackupDisabled
        );
    }

    #[tokio::test]
    async fn expired_authorization_disconnects_settings() {
        let s = connected_and_enabled().await;
        s.transport
            .fail_next(TransportOp::CreatePending, DomainError::AuthExpired);

        let err = s.engine.run_backup().await.unwrap_err();

        assert_eq!(err, DomainError::AuthExpired);
        assert_eq!(s.engine.connection(), RemoteConnection::Disconnected);
        let settings = s.engine.get_settings();
        assert!(!settings.google_connected);
        assert!(!settings.cloud_backup_enabled);
        assert!(!s.engine.status().success);
    }

    #[tokio::test]
    async fn stored_session_is_resumed() {
        let stores = Arc::new(MemoryStores::default());
        stores.put_settings(BackupSettings {
            google_connected: true,
            google_account_email: Some(ACCOUNT.into()),
            cloud_backup_enabled: true,
            ..Default::default()
        });

        let s = setup(InMemoryTransport::new(ACCOUNT).with_session(), stores).await;

        assert_eq!(
            s.engine.connection(),
            RemoteConnection::Connected {
                account_email: ACCOUNT.into()
            }
        );
        assert!(s.engine.get_settings().cloud_backup_enabled);
    }

    #[tokio::test]
    async fn missing_session_clears_stale_connection_flag() {
        let stores = Arc::new(MemoryStores::default());
        stores.put_settings(BackupSettings {
            google_connected: true,
            google_account_email: Some(ACCOUNT.into()),
            cloud_backup_enabled: true,
            ..Default::default()
        });

        let s = setup(InMemoryTransport::new(ACCOUNT), stores).await;

        assert_eq!(s.engine.connection(), RemoteConnection::Disconnected);
        let settings = s.engine.get_settings();
        assert!(!settings.google_connected);
        assert!(!settings.cloud_backup_enabled);
    }

    #[tokio::test]
    async fn background_scheduler_runs_first_backup() {
        let s = connected_and_enabled().await;
        let mut events = s.engine.subscribe();
        let shutdown = CancellationToken::new();

        let handles = s
            .engine
            .spawn_scheduler(Duration::from_secs(3600), shutdown.clone());

        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(BackupEvent::BackupCompleted { record }) = events.recv().await {
                    return record;
                }
            }
        })
        .await
        .unwrap();
        assert!(completed.success);

        shutdown.cancel();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(s.transport.objects().len(), 1);
    }
}
