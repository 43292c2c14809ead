//! Core domain layer. No external I/O dependencies.
//!
//! Entities and business rules live here. Dependencies flow inward.

pub mod entities;
pub mod errors;

pub use entities::{
    ArtifactRef, ArtifactStatus, BackupArtifact, BackupEvent, BackupFrequency, BackupOutcome,
    BackupSettings, BackupStatusRecord, ConfirmationToken, RemoteConnection, RemotePage,
    RestoreResult, SettingsUpdate, Snapshot, UploadMetadata,
};
pub use errors::DomainError;
