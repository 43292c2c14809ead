//! Guarded restore of a remote or local backup artifact.
//!
//! Order of operations:
//! 1. Resolve the reference to a restorable (status=success) artifact
//! 2. Check the single-use confirmation token issued by `prepare`
//! 3. Take the live-state gate (queues behind a running backup)
//! 4. Stage the archive in a temporary directory and verify size + fingerprint
//! 5. Unpack (verifies the manifest) and hand the payload to the state adapter,
//!    which swaps it in all-or-nothing
//!
//! Nothing touches live state before step 5, so every earlier failure leaves it untouched.

use crate::domain::{
    ArtifactRef, ArtifactStatus, BackupArtifact, BackupEvent, ConfirmationToken, DomainError,
    RemoteConnection, RestoreResult,
};
use crate::ports::AppStatePort;
use crate::usecases::events::EventBus;
use crate::usecases::gate::LiveStateGate;
use crate::usecases::remote_store::RemoteStore;
use crate::usecases::snapshot;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STAGED_FILE: &str = "artifact.zip";

/// A validated restore target plus the token that authorizes it.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub artifact: BackupArtifact,
    pub token: ConfirmationToken,
    pub expires_at: DateTime<Utc>,
}

struct PendingConfirmation {
    reference: ArtifactRef,
    expires_at: DateTime<Utc>,
}

pub struct RestoreController {
    remote: Arc<RemoteStore>,
    app: Arc<dyn AppStatePort>,
    gate: LiveStateGate,
    events: EventBus,
    staging_dir: Option<PathBuf>,
    token_ttl: Duration,
    pending: Mutex<HashMap<ConfirmationToken, PendingConfirmation>>,
}

impl RestoreController {
    pub fn new(
        remote: Arc<RemoteStore>,
        app: Arc<dyn AppStatePort>,
        gate: LiveStateGate,
        events: EventBus,
    ) -> Self {
        Self {
            remote,
            app,
            gate,
            events,
            staging_dir: None,
            token_ttl: Duration::from_secs(300),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Stage downloads under `dir` instead of the system temp directory.
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Validate the target and issue a confirmation token for it.
    pub async fn prepare(&self, reference: &ArtifactRef) -> Result<RestorePlan, DomainError> {
        let artifact = self.resolve(reference).await?;
        let token = ConfirmationToken::new(uuid::Uuid::new_v4().simple().to_string());
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(self.token_ttl).unwrap_or(chrono::Duration::minutes(5));

        let mut pending = self.lock_pending();
        pending.retain(|_, p| p.expires_at > now);
        pending.insert(
            token.clone(),
            PendingConfirmation {
                reference: reference.clone(),
                expires_at,
            },
        );
        info!(artifact_ref = %reference, name = %artifact.name, "restore prepared; awaiting confirmation");
        Ok(RestorePlan {
            artifact,
            token,
            expires_at,
        })
    }

    pub async fn restore(
        &self,
        reference: &ArtifactRef,
        token: Option<&ConfirmationToken>,
        cancel: &CancellationToken,
    ) -> Result<RestoreResult, DomainError> {
        let artifact = self.resolve(reference).await?;
        self.consume_token(reference, token)?;

        debug!(artifact_ref = %reference, "waiting for live state");
        let _live = self.gate.acquire().await;
        info!(artifact_ref = %reference, name = %artifact.name, "restore started");

        let staging = self.staging_area().await?;
        // Remote names are free-form ("nightly/backup.zip", "../x"); never build paths from them.
        let staged = staging.path().join(STAGED_FILE);
        match reference {
            ArtifactRef::Remote(id) => {
                let blob = self.remote.download(id, cancel).await?;
                tokio::fs::write(&staged, &blob).await?;
            }
            ArtifactRef::Local(path) => {
                tokio::fs::copy(path, &staged).await?;
            }
        }
        let blob = tokio::fs::read(&staged).await?;
        verify(&artifact, &blob)?;

        let (manifest, payload) = tokio::task::spawn_blocking(move || snapshot::unpack(&blob))
            .await
            .map_err(|e| DomainError::Archive(format!("unpack task failed: {}", e)))??;
        debug!(created_by = %manifest.created_by, created_at = %manifest.created_at, "archive verified");

        if cancel.is_cancelled() {
            return Err(DomainError::Cancelled);
        }
        self.app.write_snapshot(&payload).await?;

        let result = RestoreResult {
            source: reference.clone(),
            artifact_name: artifact.name,
            bytes_restored: payload.len() as u64,
            restored_at: Utc::now(),
        };
        info!(artifact_ref = %reference, bytes = result.bytes_restored, "restore complete");
        self.events.publish(BackupEvent::RestoreCompleted {
            result: result.clone(),
        });
        self.events.publish(BackupEvent::ReloadRequested);
        Ok(result)
    }

    async fn resolve(&self, reference: &ArtifactRef) -> Result<BackupArtifact, DomainError> {
        let artifact = match reference {
            ArtifactRef::Remote(id) => match self.remote.get(id).await {
                Ok(a) => a,
                Err(DomainError::NotFound(_)) => {
                    return Err(DomainError::ArtifactUnavailable(format!(
                        "{} does not exist",
                        reference
                    )));
                }
                Err(e) => return Err(e),
            },
            ArtifactRef::Local(path) => {
                // Local files need no account, but nothing proceeds while one is being connected.
                if let RemoteConnection::Connecting { .. } = self.remote.connection() {
                    return Err(DomainError::ConnectionBusy);
                }
                describe_local(path).await?
            }
        };
        if !artifact.is_restorable() {
            return Err(DomainError::ArtifactUnavailable(format!(
                "{} has status {}",
                reference,
                artifact.status.as_str()
            )));
        }
        Ok(artifact)
    }

    fn consume_token(
        &self,
        reference: &ArtifactRef,
        token: Option<&ConfirmationToken>,
    ) -> Result<(), DomainError> {
        let Some(token) = token else {
            warn!(artifact_ref = %reference, "restore refused: no confirmation");
            return Err(DomainError::ConfirmationRequired);
        };
        let mut pending = self.lock_pending();
        let valid = pending
            .get(token)
            .is_some_and(|p| p.reference == *reference && p.expires_at > Utc::now());
        if !valid {
            warn!(artifact_ref = %reference, "restore refused: confirmation invalid or expired");
            return Err(DomainError::ConfirmationRequired);
        }
        pending.remove(token);
        Ok(())
    }

    async fn staging_area(&self) -> Result<tempfile::TempDir, DomainError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("restore-");
        let dir = match &self.staging_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                builder.tempdir_in(dir)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<ConfirmationToken, PendingConfirmation>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A local archive is restorable when it exists as a regular file.
async fn describe_local(path: &Path) -> Result<BackupArtifact, DomainError> {
    let unavailable = |why: &str| {
        DomainError::ArtifactUnavailable(format!("{}: {}", path.display(), why))
    };
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(unavailable("no such file")),
        Err(e) => return Err(e.into()),
    };
    if !meta.is_file() {
        return Err(unavailable("not a file"));
    }
    let created_at = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "backup.zip".to_string());

    Ok(BackupArtifact {
        id: path.display().to_string(),
        name,
        created_at,
        size_bytes: meta.len(),
        created_by: "local".to_string(),
        shareable_link: None,
        status: ArtifactStatus::Success,
        fingerprint: None,
    })
}

fn verify(artifact: &BackupArtifact, blob: &[u8]) -> Result<(), DomainError> {
    if blob.len() as u64 != artifact.size_bytes {
        return Err(DomainError::IntegrityMismatch {
            expected: format!("{} bytes", artifact.size_bytes),
            actual: format!("{} bytes", blob.len()),
        });
    }
    if let Some(expected) = &artifact.fingerprint {
        let actual = snapshot::sha256_hex(blob);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(DomainError::IntegrityMismatch {
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(())
}
