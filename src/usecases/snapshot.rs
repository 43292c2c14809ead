//! Snapshot producer: live state dump -> zip archive with manifest -> pending artifact.
//!
//! Archive layout:
//! - `backup.sql`: the state dump as produced by `AppStatePort::read_snapshot`
//! - `manifest.json`: format version, creator, and the SHA-256 + size of `backup.sql`
//!
//! The artifact fingerprint is the SHA-256 of the whole archive.

use crate::domain::{ArtifactStatus, BackupArtifact, DomainError, Snapshot};
use crate::ports::AppStatePort;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const PAYLOAD_ENTRY: &str = "backup.sql";
pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub payload_sha256: String,
    pub payload_size: u64,
}

pub struct SnapshotProducer {
    app: Arc<dyn AppStatePort>,
}

impl SnapshotProducer {
    pub fn new(app: Arc<dyn AppStatePort>) -> Self {
        Self { app }
    }

    /// Capture the live state. The adapter holds its read guard only for the dump itself;
    /// compression runs afterwards on the blocking pool.
    pub async fn snapshot(&self, created_by: &str) -> Result<Snapshot, DomainError> {
        let payload = self.app.read_snapshot().await?;
        let created_at = Utc::now();
        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            created_at,
            created_by: created_by.to_string(),
            payload_sha256: sha256_hex(&payload),
            payload_size: payload.len() as u64,
        };
        debug!(payload_size = manifest.payload_size, "state dump captured");

        let blob = tokio::task::spawn_blocking(move || pack(&payload, &manifest))
            .await
            .map_err(|e| DomainError::Archive(format!("packing task failed: {}", e)))??;

        let artifact = BackupArtifact {
            id: uuid::Uuid::new_v4().to_string(),
            name: artifact_name(created_at),
            created_at,
            size_bytes: blob.len() as u64,
            created_by: created_by.to_string(),
            shareable_link: None,
            status: ArtifactStatus::Pending,
            fingerprint: Some(sha256_hex(&blob)),
        };
        info!(name = %artifact.name, size = artifact.size_bytes, "snapshot created");
        Ok(Snapshot { artifact, blob })
    }
}

pub fn artifact_name(at: DateTime<Utc>) -> String {
    format!("backup-{}.zip", at.format("%Y%m%dT%H%M%SZ"))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn pack(payload: &[u8], manifest: &Manifest) -> Result<Vec<u8>, DomainError> {
    let manifest_json = serde_json::to_vec_pretty(manifest)
        .map_err(|e| DomainError::Archive(format!("manifest: {}", e)))?;
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file(MANIFEST_ENTRY, options).map_err(archive_err)?;
    zip.write_all(&manifest_json)?;
    zip.start_file(PAYLOAD_ENTRY, options).map_err(archive_err)?;
    zip.write_all(payload)?;
    let cursor = zip.finish().map_err(archive_err)?;
    Ok(cursor.into_inner())
}

/// Extract and verify the payload. A payload that disagrees with its manifest is
/// an `IntegrityMismatch`; a malformed archive is an `Archive` error.
pub fn unpack(blob: &[u8]) -> Result<(Manifest, Vec<u8>), DomainError> {
    let mut archive = ZipArchive::new(Cursor::new(blob)).map_err(archive_err)?;

    let manifest: Manifest = {
        let mut entry = archive.by_name(MANIFEST_ENTRY).map_err(archive_err)?;
        let mut raw = Vec::new();
        entry.read_to_end(&mut raw)?;
        serde_json::from_slice(&raw)
            .map_err(|e| DomainError::Archive(format!("manifest: {}", e)))?
    };
    if manifest.format_version > FORMAT_VERSION {
        return Err(DomainError::Archive(format!(
            "unsupported archive format {}",
            manifest.format_version
        )));
    }

    let mut payload = Vec::new();
    archive
        .by_name(PAYLOAD_ENTRY)
        .map_err(archive_err)?
        .read_to_end(&mut payload)?;

    if payload.len() as u64 != manifest.payload_size {
        return Err(DomainError::IntegrityMismatch {
            expected: format!("{} bytes", manifest.payload_size),
            actual: format!("{} bytes", payload.len()),
        });
    }
    let actual = sha256_hex(&payload);
    if actual != manifest.payload_sha256 {
        return Err(DomainError::IntegrityMismatch {
            expected: manifest.payload_sha256,
            actual,
        });
    }
    Ok((manifest, payload))
}

/// Write the archive into `dir` under the artifact name. Returns the file path.
pub async fn write_local_copy(dir: &Path, snapshot: &Snapshot) -> Result<PathBuf, DomainError> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(&snapshot.artifact.name);
    let tmp = path.with_extension("zip.tmp");
    tokio::fs::write(&tmp, &snapshot.blob).await?;
    tokio::fs::rename(&tmp, &path).await?;
    debug!(path = %path.display(), "local copy written");
    Ok(path)
}

fn archive_err(e: zip::result::ZipError) -> DomainError {
    DomainError::Archive(e.to_string())
}
