//! Implements SettingsPort and StatusPort using JSON files in the data directory.
//!
//! settings.json holds `BackupSettings`, status.json the latest `BackupStatusRecord`.

use crate::domain::{BackupSettings, BackupStatusRecord, DomainError};
use crate::ports::{SettingsPort, StatusPort};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

pub const SETTINGS_FILE: &str = "settings.json";
pub const STATUS_FILE: &str = "status.json";

/// JSON file-based settings + status storage.
pub struct JsonStore {
    settings_path: PathBuf,
    status_path: PathBuf,
}

impl JsonStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let dir = data_dir.as_ref();
        Self {
            settings_path: dir.join(SETTINGS_FILE),
            status_path: dir.join(STATUS_FILE),
        }
    }

    /// `None` when the file does not exist. A corrupt file is logged and treated as missing.
    async fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, DomainError> {
        let raw = match fs::read_to_string(path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DomainError::Settings(format!("read {}: {}", path.display(), e))),
        };
        match serde_json::from_str(&raw) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable file");
                Ok(None)
            }
        }
    }

    /// Atomic save: temp file, sync_all, rename over the target.
    async fn write<T: Serialize>(path: &Path, value: &T) -> Result<(), DomainError> {
        let json =
            serde_json::to_string_pretty(value).map_err(|e| DomainError::Settings(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DomainError::Settings(format!("create {}: {}", parent.display(), e)))?;
        }

        let temp_path = path.with_extension("json.tmp");
        let mut f = fs::File::create(&temp_path)
            .await
            .map_err(|e| DomainError::Settings(format!("create temp file: {}", e)))?;
        f.write_all(json.as_bytes())
            .await
            .map_err(|e| DomainError::Settings(format!("write temp file: {}", e)))?;
        f.sync_all()
            .await
            .map_err(|e| DomainError::Settings(format!("sync temp file: {}", e)))?;
        drop(f);

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| DomainError::Settings(format!("atomic rename failed: {}", e)))
    }
}

#[async_trait::async_trait]
impl SettingsPort for JsonStore {
    async fn load(&self) -> Result<BackupSettings, DomainError> {
        Ok(Self::read(&self.settings_path).await?.unwrap_or_default())
    }

    async fn save(&self, settings: &BackupSettings) -> Result<(), DomainError> {
        Self::write(&self.settings_path, settings).await
    }
}

#[async_trait::async_trait]
impl StatusPort for JsonStore {
    async fn load_status(&self) -> Result<Option<BackupStatusRecord>, DomainError> {
        Self::read(&self.status_path).await
    }

    async fn save_status(&self, record: &BackupStatusRecord) -> Result<(), DomainError> {
        Self::write(&self.status_path, record).await
    }
}
