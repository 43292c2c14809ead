//! Owns `BackupSettings`. Other components get copies; only this store writes.
//!
//! Every change is validated, persisted, then published to readers in one swap.
//! Enabling cloud backup requires a connected account (rejected otherwise, never queued).

use crate::domain::{BackupSettings, DomainError, SettingsUpdate};
use crate::ports::SettingsPort;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

pub struct SettingsStore {
    port: Arc<dyn SettingsPort>,
    current: RwLock<BackupSettings>,
    writer: tokio::sync::Mutex<()>,
}

impl SettingsStore {
    /// Load persisted settings. Invalid combinations from older files are repaired, not rejected.
    pub async fn load(port: Arc<dyn SettingsPort>) -> Result<Self, DomainError> {
        let mut settings = port.load().await?;
        if let Err(e) = settings.validate() {
            warn!(error = %e, "stored settings invalid; repairing");
            repair(&mut settings);
            port.save(&settings).await?;
        }
        Ok(Self {
            port,
            current: RwLock::new(settings),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    pub fn get(&self) -> BackupSettings {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn update(&self, update: SettingsUpdate) -> Result<BackupSettings, DomainError> {
        let _writer = self.writer.lock().await;
        let mut next = self.get();
        update.apply_to(&mut next);
        self.commit(next).await
    }

    pub async fn mark_connected(&self, account_email: &str) -> Result<BackupSettings, DomainError> {
        let _writer = self.writer.lock().await;
        let mut next = self.get();
        next.google_connected = true;
        next.google_account_email = Some(account_email.to_string());
        self.commit(next).await
    }

    /// Clears the account and, since it depends on it, cloud backup enablement.
    pub async fn mark_disconnected(&self) -> Result<BackupSettings, DomainError> {
        let _writer = self.writer.lock().await;
        let mut next = self.get();
        if !next.google_connected && !next.cloud_backup_enabled {
            return Ok(next);
        }
        next.google_connected = false;
        next.google_account_email = None;
        next.cloud_backup_enabled = false;
        self.commit(next).await
    }

    async fn commit(&self, next: BackupSettings) -> Result<BackupSettings, DomainError> {
        next.validate()?;
        if next == self.get() {
            return Ok(next);
        }
        self.port.save(&next).await?;
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = next.clone();
        info!(
            cloud_backup_enabled = next.cloud_backup_enabled,
            frequency = ?next.backup_frequency,
            google_connected = next.google_connected,
            "settings updated"
        );
        Ok(next)
    }
}

fn repair(settings: &mut BackupSettings) {
    if settings.google_connected != settings.google_account_email.is_some() {
        settings.google_connected = false;
        settings.google_account_email = None;
    }
    if !settings.google_connected {
        settings.cloud_backup_enabled = false;
    }
    settings.reminder_interval_days = settings
        .reminder_interval_days
        .clamp(1, BackupSettings::MAX_REMINDER_DAYS);
    if settings.retention_count == Some(0) {
        settings.retention_count = None;
    }
}
