//! Domain errors. Used by ports and use cases.
//!
//! Adapters map infrastructure errors (HTTP, SQLite, filesystem) into these.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Authorization denied by the user")]
    AuthDenied,

    #[error("Authorization timed out waiting for the user")]
    AuthTimeout,

    /// Credentials are no longer valid. The connection drops to Disconnected;
    /// the caller must reconnect before retrying.
    #[error("Authorization expired; reconnect the storage account")]
    AuthExpired,

    #[error("Not connected to a storage account")]
    NotConnected,

    #[error("Connection to the storage account is in progress")]
    ConnectionBusy,

    /// Transient transport failure. Retried by the upload path.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote storage quota exceeded")]
    QuotaExceeded,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backup artifact unavailable: {0}")]
    ArtifactUnavailable(String),

    #[error("Restore requires an explicit confirmation token")]
    ConfirmationRequired,

    #[error("Integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Application state unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("A backup is already running")]
    BackupInProgress,

    #[error("Cloud backup is disabled")]
    CloudBackupDisabled,

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Settings store error: {0}")]
    Settings(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl DomainError {
    /// Only transport hiccups are worth retrying automatically.
    pub fn is_transient(&self) -> bool {
        matches!(self, DomainError::Network(_))
    }

    /// Errors that mean "the account link is not usable right now".
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            DomainError::AuthDenied
                | DomainError::AuthTimeout
                | DomainError::AuthExpired
                | DomainError::NotConnected
        )
    }
}

impl From<std::io::Error> for DomainError {
    fn from(e: std::io::Error) -> Self {
        DomainError::Io(e.to_string())
    }
}
