//! Application configuration. Paths, OAuth credentials, timeouts, retry policy.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Redirect URI for the loopback OAuth callback.
pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8765/callback";

/// Drive folder (created on first use) that holds the backup archives.
pub const DEFAULT_DRIVE_FOLDER: &str = "Cloud Backups";

#[derive(Debug, Deserialize, Default)]
pub struct AppConfig {
    /// Directory for settings.json, status.json, tokens.json. Read from CLOUD_BACKUP_DATA_DIR.
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Application database to snapshot. Defaults to `<data_dir>/app.db`.
    #[serde(default)]
    pub database_path: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // Google Drive
    // ─────────────────────────────────────────────────────────────────────────
    #[serde(default)]
    pub google_client_id: Option<String>,

    #[serde(default)]
    pub google_client_secret: Option<String>,

    #[serde(default)]
    pub google_redirect_uri: Option<String>,

    #[serde(default)]
    pub drive_folder: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // Timeouts & retry
    // ─────────────────────────────────────────────────────────────────────────
    /// Per-call bound on uploads/downloads/listing (default 30).
    #[serde(default)]
    pub transfer_timeout_secs: Option<u64>,

    /// Bound on interactive authorization (default 120).
    #[serde(default)]
    pub auth_timeout_secs: Option<u64>,

    #[serde(default)]
    pub retry_max: Option<u32>,

    #[serde(default)]
    pub retry_base_secs: Option<u64>,

    #[serde(default)]
    pub retry_cap_secs: Option<u64>,

    /// Scheduler wake-up period (default 3600).
    #[serde(default)]
    pub scheduler_tick_secs: Option<u64>,

    /// Lifetime of a restore confirmation token (default 300).
    #[serde(default)]
    pub restore_token_ttl_secs: Option<u64>,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();
        let mut c = config::Config::builder();
        c = c.add_source(config::Environment::with_prefix("CLOUD_BACKUP"));
        if let Ok(path) = std::env::var("CLOUD_BACKUP_CONFIG") {
            c = c.add_source(config::File::with_name(&path));
        }
        c.build()?.try_deserialize()
    }

    pub fn data_dir_or_default(&self) -> PathBuf {
        PathBuf::from(self.data_dir.as_deref().unwrap_or("./data"))
    }

    pub fn database_path_or_default(&self) -> PathBuf {
        self.database_path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_dir_or_default().join("app.db"))
    }

    pub fn redirect_uri_or_default(&self) -> String {
        self.google_redirect_uri
            .clone()
            .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string())
    }

    pub fn drive_folder_or_default(&self) -> String {
        self.drive_folder
            .clone()
            .unwrap_or_else(|| DEFAULT_DRIVE_FOLDER.to_string())
    }

    /// Returns true if Google OAuth client credentials are present.
    pub fn is_google_configured(&self) -> bool {
        self.google_client_id
            .as_deref()
            .is_some_and(|s| !s.is_empty())
            && self
                .google_client_secret
                .as_deref()
                .is_some_and(|s| !s.is_empty())
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs.unwrap_or(30))
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs.unwrap_or(120))
    }

    pub fn retry_policy(&self) -> crate::usecases::RetryPolicy {
        crate::usecases::RetryPolicy {
            max_retries: self.retry_max.unwrap_or(3),
            base: Duration::from_secs(self.retry_base_secs.unwrap_or(2)),
            cap: Duration::from_secs(self.retry_cap_secs.unwrap_or(30)),
        }
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs.unwrap_or(3600))
    }

    pub fn restore_token_ttl(&self) -> Duration {
        Duration::from_secs(self.restore_token_ttl_secs.unwrap_or(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.transfer_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.auth_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.database_path_or_default(), PathBuf::from("./data/app.db"));
        let retry = cfg.retry_policy();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.base, Duration::from_secs(2));
        assert_eq!(retry.cap, Duration::from_secs(30));
        assert!(!cfg.is_google_configured());
    }

    #[test]
    fn empty_client_id_is_not_configured() {
        let cfg = AppConfig {
            google_client_id: Some(String::new()),
            google_client_secret: Some("secret".into()),
            ..Default::default()
        };
        assert!(!cfg.is_google_configured());
    }
}
