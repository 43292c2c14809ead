//! Outbound ports. Application calls into infrastructure.
//!
//! Implemented by adapters.

use crate::domain::{
    ArtifactStatus, BackupArtifact, BackupSettings, BackupStatusRecord, DomainError, RemotePage,
    UploadMetadata,
};

/// Live application state. Both calls are guarded by the adapter so a reader
/// never observes a half-applied restore.
#[async_trait::async_trait]
pub trait AppStatePort: Send + Sync {
    /// Read a consistent, self-contained dump of the live state.
    async fn read_snapshot(&self) -> Result<Vec<u8>, DomainError>;

    /// Replace the live state with `payload`. All-or-nothing: on error the
    /// previous state must be untouched.
    async fn write_snapshot(&self, payload: &[u8]) -> Result<(), DomainError>;
}

/// Settings persistence.
#[async_trait::async_trait]
pub trait SettingsPort: Send + Sync {
    /// Load persisted settings. Returns defaults when nothing is stored yet.
    async fn load(&self) -> Result<BackupSettings, DomainError>;

    async fn save(&self, settings: &BackupSettings) -> Result<(), DomainError>;
}

/// Durable storage for the most recent backup status record.
#[async_trait::async_trait]
pub trait StatusPort: Send + Sync {
    async fn load_status(&self) -> Result<Option<BackupStatusRecord>, DomainError>;

    async fn save_status(&self, record: &BackupStatusRecord) -> Result<(), DomainError>;
}

/// Remote object store transport (e.g. Google Drive). Provider quirks are
/// translated into `DomainError` kinds here; the core never sees HTTP codes.
#[async_trait::async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Interactive authorization. Returns the account email on success.
    async fn authorize(&self, account_hint: Option<&str>) -> Result<String, DomainError>;

    /// Whether previously granted credentials are still held locally.
    async fn has_session(&self) -> bool;

    /// Revoke and forget credentials.
    async fn revoke(&self) -> Result<(), DomainError>;

    /// Create the remote object with status=pending and no content. Fixes the artifact id.
    async fn create_pending(&self, metadata: &UploadMetadata)
    -> Result<BackupArtifact, DomainError>;

    /// Upload (or re-upload) the content of an existing pending object.
    async fn put_content(&self, id: &str, blob: &[u8]) -> Result<(), DomainError>;

    /// Record the terminal status of an object.
    async fn set_status(&self, id: &str, status: ArtifactStatus) -> Result<(), DomainError>;

    /// Make the object readable by link and return the link.
    async fn share_link(&self, id: &str) -> Result<Option<String>, DomainError>;

    /// Fetch one page of the listing. `None` starts from the beginning.
    async fn list_page(&self, page_token: Option<&str>) -> Result<RemotePage, DomainError>;

    async fn get(&self, id: &str) -> Result<BackupArtifact, DomainError>;

    async fn download(&self, id: &str) -> Result<Vec<u8>, DomainError>;

    /// Delete an object. `NotFound` when it is already gone.
    async fn delete(&self, id: &str) -> Result<(), DomainError>;
}
