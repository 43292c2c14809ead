//! Domain entities. Pure data structures for the backup engine.
//!
//! No HTTP/SQLite types here; adapters map into these.

use crate::domain::DomainError;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    Pending,
    Success,
    Failed,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Pending => "pending",
            ArtifactStatus::Success => "success",
            ArtifactStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ArtifactStatus::Pending),
            "success" => Some(ArtifactStatus::Success),
            "failed" => Some(ArtifactStatus::Failed),
            _ => None,
        }
    }
}

/// A single backup snapshot held by the remote store (or described from a local file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Account identifier (email) of the uploader.
    pub created_by: String,
    pub shareable_link: Option<String>,
    pub status: ArtifactStatus,
    /// Hex SHA-256 of the archive bytes, when recorded.
    pub fingerprint: Option<String>,
}

impl BackupArtifact {
    /// Pending artifacts move to success or failed exactly once; everything else is frozen.
    pub fn transition(&mut self, to: ArtifactStatus) -> Result<(), DomainError> {
        match (self.status, to) {
            (ArtifactStatus::Pending, ArtifactStatus::Success | ArtifactStatus::Failed) => {
                self.status = to;
                Ok(())
            }
            (from, to) => Err(DomainError::InvalidTransition(format!(
                "artifact {}: {} -> {}",
                self.id,
                from.as_str(),
                to.as_str()
            ))),
        }
    }

    pub fn is_restorable(&self) -> bool {
        self.status == ArtifactStatus::Success
    }
}

/// Output of the snapshot producer: a pending artifact plus the archive bytes.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub artifact: BackupArtifact,
    pub blob: Vec<u8>,
}

/// What the remote store needs to create an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    pub name: String,
    pub description: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub fingerprint: Option<String>,
}

impl UploadMetadata {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            name: snapshot.artifact.name.clone(),
            description: "Cloud backup of application database".to_string(),
            created_by: snapshot.artifact.created_by.clone(),
            created_at: snapshot.artifact.created_at,
            size_bytes: snapshot.blob.len() as u64,
            fingerprint: snapshot.artifact.fingerprint.clone(),
        }
    }
}

/// One page of a remote listing. `next_page_token == None` ends the listing.
#[derive(Debug, Clone, Default)]
pub struct RemotePage {
    pub artifacts: Vec<BackupArtifact>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupFrequency {
    Manual,
    Daily,
    Weekly,
    Monthly,
}

impl BackupFrequency {
    /// Spacing between automatic runs. `None` for manual.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            BackupFrequency::Manual => None,
            BackupFrequency::Daily => Some(Duration::days(1)),
            BackupFrequency::Weekly => Some(Duration::days(7)),
            // Approximation, same as a calendar-agnostic "monthly".
            BackupFrequency::Monthly => Some(Duration::days(30)),
        }
    }
}

/// Persisted configuration. Owned by the settings store; read-only elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Directory for local archive copies. Empty disables local copies.
    pub local_path: PathBuf,
    pub cloud_backup_enabled: bool,
    pub backup_frequency: BackupFrequency,
    /// Time of day (UTC) for automatic runs.
    pub backup_time: Option<NaiveTime>,
    pub reminder_enabled: bool,
    pub reminder_interval_days: u32,
    pub google_connected: bool,
    pub google_account_email: Option<String>,
    /// Keep this many successful remote artifacts; older ones are retired.
    pub retention_count: Option<u32>,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            local_path: PathBuf::new(),
            cloud_backup_enabled: false,
            backup_frequency: BackupFrequency::Daily,
            backup_time: None,
            reminder_enabled: true,
            reminder_interval_days: 7,
            google_connected: false,
            google_account_email: None,
            retention_count: None,
        }
    }
}

impl BackupSettings {
    pub const MAX_REMINDER_DAYS: u32 = 365;

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.reminder_interval_days == 0 || self.reminder_interval_days > Self::MAX_REMINDER_DAYS
        {
            return Err(DomainError::InvalidSettings(format!(
                "reminder_interval_days must be within 1..={}",
                Self::MAX_REMINDER_DAYS
            )));
        }
        if self.google_connected != self.google_account_email.is_some() {
            return Err(DomainError::InvalidSettings(
                "google_account_email must be set if and only if google_connected".into(),
            ));
        }
        if self.cloud_backup_enabled && !self.google_connected {
            return Err(DomainError::InvalidSettings(
                "connect a Google account before enabling cloud backup".into(),
            ));
        }
        if self.retention_count == Some(0) {
            return Err(DomainError::InvalidSettings(
                "retention_count must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// User-editable subset of settings. Connection fields are driven by the connection lifecycle.
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub local_path: Option<PathBuf>,
    pub cloud_backup_enabled: Option<bool>,
    pub backup_frequency: Option<BackupFrequency>,
    pub backup_time: Option<Option<NaiveTime>>,
    pub reminder_enabled: Option<bool>,
    pub reminder_interval_days: Option<u32>,
    pub retention_count: Option<Option<u32>>,
}

impl SettingsUpdate {
    pub fn apply_to(&self, settings: &mut BackupSettings) {
        if let Some(p) = &self.local_path {
            settings.local_path = p.clone();
        }
        if let Some(v) = self.cloud_backup_enabled {
            settings.cloud_backup_enabled = v;
        }
        if let Some(f) = self.backup_frequency {
            settings.backup_frequency = f;
        }
        if let Some(t) = self.backup_time {
            settings.backup_time = t;
        }
        if let Some(v) = self.reminder_enabled {
            settings.reminder_enabled = v;
        }
        if let Some(d) = self.reminder_interval_days {
            settings.reminder_interval_days = d;
        }
        if let Some(r) = self.retention_count {
            settings.retention_count = r;
        }
    }
}

/// Outcome of the most recent backup attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStatusRecord {
    /// `None` only for the "never run" sentinel.
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub message: String,
    /// Carried forward across failed attempts; drives reminders.
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub artifact_id: Option<String>,
}

impl BackupStatusRecord {
    pub fn never_run() -> Self {
        Self {
            last_attempt_at: None,
            success: false,
            message: "No backup has run yet".to_string(),
            last_success_at: None,
            artifact_id: None,
        }
    }

    pub fn is_never_run(&self) -> bool {
        self.last_attempt_at.is_none()
    }
}

/// Input to the status tracker.
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub at: DateTime<Utc>,
    pub success: bool,
    pub message: String,
    pub artifact_id: Option<String>,
}

impl BackupOutcome {
    pub fn succeeded(at: DateTime<Utc>, artifact_id: Option<String>) -> Self {
        Self {
            at,
            success: true,
            message: "Backup completed successfully".to_string(),
            artifact_id,
        }
    }

    pub fn failed(at: DateTime<Utc>, error: &DomainError) -> Self {
        Self {
            at,
            success: false,
            message: format!("Backup failed: {}", error),
            artifact_id: None,
        }
    }
}

/// Authorized link to the external storage account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteConnection {
    Disconnected,
    Connecting { since: DateTime<Utc> },
    Connected { account_email: String },
}

impl RemoteConnection {
    pub fn account_email(&self) -> Option<&str> {
        match self {
            RemoteConnection::Connected { account_email } => Some(account_email),
            _ => None,
        }
    }
}

/// Where a restore reads from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactRef {
    Remote(String),
    Local(PathBuf),
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactRef::Remote(id) => write!(f, "remote:{}", id),
            ArtifactRef::Local(path) => write!(f, "local:{}", path.display()),
        }
    }
}

/// Proof that the user confirmed a destructive restore.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfirmationToken(String);

impl ConfirmationToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreResult {
    pub source: ArtifactRef,
    pub artifact_name: String,
    pub bytes_restored: u64,
    pub restored_at: DateTime<Utc>,
}

/// Typed notifications published by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupEvent {
    Connected { account_email: String },
    ConnectionLost { reason: String },
    BackupCompleted { record: BackupStatusRecord },
    ReminderDue {
        last_success_at: Option<DateTime<Utc>>,
        interval_days: u32,
    },
    RestoreCompleted { result: RestoreResult },
    /// The application should reload its state from the database.
    ReloadRequested,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(status: ArtifactStatus) -> BackupArtifact {
        BackupArtifact {
            id: "a1".into(),
            name: "backup-A".into(),
            created_at: Utc::now(),
            size_bytes: 10,
            created_by: "me@example.com".into(),
            shareable_link: None,
            status,
            fingerprint: None,
        }
    }

    #[test]
    fn pending_transitions_once() {
        let mut a = artifact(ArtifactStatus::Pending);
        a.transition(ArtifactStatus::Success).unwrap();
        assert!(a.is_restorable());
        assert!(matches!(
            a.transition(ArtifactStatus::Failed),
            Err(DomainError::InvalidTransition(_))
        ));
        assert_eq!(a.status, ArtifactStatus::Success);
    }

    #[test]
    fn failed_is_terminal() {
        let mut a = artifact(ArtifactStatus::Failed);
        assert!(a.transition(ArtifactStatus::Success).is_err());
    }

    #[test]
    fn default_settings_are_valid() {
        BackupSettings::default().validate().unwrap();
    }

    #[test]
    fn email_must_match_connection_flag() {
        let s = BackupSettings {
            google_connected: true,
            ..Default::default()
        };
        assert!(matches!(s.validate(), Err(DomainError::InvalidSettings(_))));

        let s = BackupSettings {
            google_account_email: Some("me@example.com".into()),
            ..Default::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn cloud_backup_requires_connection() {
        let s = BackupSettings {
            cloud_backup_enabled: true,
            ..Default::default()
        };
        assert!(s.validate().is_err());

        let s = BackupSettings {
            cloud_backup_enabled: true,
            google_connected: true,
            google_account_email: Some("me@example.com".into()),
            ..Default::default()
        };
        s.validate().unwrap();
    }

    #[test]
    fn reminder_interval_bounds() {
        for days in [0, 366] {
            let s = BackupSettings {
                reminder_interval_days: days,
                ..Default::default()
            };
            assert!(s.validate().is_err(), "{} days accepted", days);
        }
    }

    #[test]
    fn update_applies_only_present_fields() {
        let mut s = BackupSettings::default();
        let update = SettingsUpdate {
            backup_frequency: Some(BackupFrequency::Weekly),
            backup_time: Some(NaiveTime::from_hms_opt(2, 0, 0)),
            ..Default::default()
        };
        update.apply_to(&mut s);
        assert_eq!(s.backup_frequency, BackupFrequency::Weekly);
        assert_eq!(s.backup_time, NaiveTime::from_hms_opt(2, 0, 0));
        assert_eq!(s.reminder_interval_days, 7);
    }

    #[test]
    fn settings_json_uses_defaults_for_missing_fields() {
        let s: BackupSettings = serde_json::from_str(r#"{"backup_frequency":"weekly"}"#).unwrap();
        assert_eq!(s.backup_frequency, BackupFrequency::Weekly);
        assert!(s.reminder_enabled);
    }
}
