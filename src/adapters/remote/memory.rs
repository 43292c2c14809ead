//! In-memory remote transport. Offline fallback and test double.
//!
//! Behaves like a small object store: ids are assigned on create, listing is paged,
//! and faults can be queued per operation to simulate a flaky provider.

use crate::domain::{ArtifactStatus, BackupArtifact, DomainError, RemotePage, UploadMetadata};
use crate::ports::RemoteTransport;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportOp {
    Authorize,
    Revoke,
    CreatePending,
    PutContent,
    SetStatus,
    ShareLink,
    ListPage,
    Get,
    Download,
    Delete,
}

struct StoredObject {
    artifact: BackupArtifact,
    content: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    next_id: u64,
    session: bool,
    faults: HashMap<TransportOp, VecDeque<DomainError>>,
    calls: HashMap<TransportOp, usize>,
}

pub struct InMemoryTransport {
    account_email: String,
    page_size: usize,
    latency: Option<Duration>,
    quota_bytes: Option<u64>,
    inner: Mutex<Inner>,
}

impl InMemoryTransport {
    pub fn new(account_email: impl Into<String>) -> Self {
        Self {
            account_email: account_email.into(),
            page_size: 100,
            latency: None,
            quota_bytes: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Delay applied to authorize, content transfer and download.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    /// Start with a stored session, as if authorized in a previous run.
    pub fn with_session(self) -> Self {
        self.lock().session = true;
        self
    }

    /// Queue an error for the next call of `op`. Queued errors are consumed in order.
    pub fn fail_next(&self, op: TransportOp, error: DomainError) {
        self.lock().faults.entry(op).or_default().push_back(error);
    }

    pub fn calls(&self, op: TransportOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// All stored artifacts, ordered by id.
    pub fn objects(&self) -> Vec<BackupArtifact> {
        self.lock()
            .objects
            .values()
            .map(|o| o.artifact.clone())
            .collect()
    }

    pub fn insert(&self, artifact: BackupArtifact, content: Vec<u8>) {
        self.lock()
            .objects
            .insert(artifact.id.clone(), StoredObject { artifact, content });
    }

    /// Replace stored bytes without touching recorded metadata (simulates corruption).
    pub fn overwrite_content(&self, id: &str, content: Vec<u8>) {
        if let Some(o) = self.lock().objects.get_mut(id) {
            o.content = content;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count the call, pop a queued fault, and require a session for non-auth operations.
    fn enter(&self, op: TransportOp) -> Result<(), DomainError> {
        let mut inner = self.lock();
        *inner.calls.entry(op).or_default() += 1;
        if let Some(err) = inner.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        if !matches!(op, TransportOp::Authorize | TransportOp::Revoke) && !inner.session {
            return Err(DomainError::AuthExpired);
        }
        Ok(())
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn not_found(id: &str) -> DomainError {
        DomainError::NotFound(format!("object {}", id))
    }
}

#[async_trait::async_trait]
impl RemoteTransport for InMemoryTransport {
    async fn authorize(&self, _account_hint: Option<&str>) -> Result<String, DomainError> {
        self.enter(TransportOp::Authorize)?;
        self.delay().await;
        self.lock().session = true;
        info!(account = %self.account_email, "[MEMORY] authorized");
        Ok(self.account_email.clone())
    }

    async fn has_session(&self) -> bool {
        self.lock().session
    }

    async fn revoke(&self) -> Result<(), DomainError> {
        // The session is forgotten locally even when the remote call "fails".
        self.lock().session = false;
        self.enter(TransportOp::Revoke)
    }

    async fn create_pending(
        &self,
        metadata: &UploadMetadata,
    ) -> Result<BackupArtifact, DomainError> {
        self.enter(TransportOp::CreatePending)?;
        let mut inner = self.lock();
        inner.next_id += 1;
        let artifact = BackupArtifact {
            id: format!("mem-{:06}", inner.next_id),
            name: metadata.name.clone(),
            created_at: metadata.created_at,
            size_bytes: metadata.size_bytes,
            created_by: metadata.created_by.clone(),
            shareable_link: None,
            status: ArtifactStatus::Pending,
            fingerprint: metadata.fingerprint.clone(),
        };
        inner.objects.insert(
            artifact.id.clone(),
            StoredObject {
                artifact: artifact.clone(),
                content: Vec::new(),
            },
        );
        Ok(artifact)
    }

    async fn put_content(&self, id: &str, blob: &[u8]) -> Result<(), DomainError> {
        self.enter(TransportOp::PutContent)?;
        self.delay().await;
        let mut inner = self.lock();
        if let Some(quota) = self.quota_bytes {
            let used: u64 = inner
                .objects
                .iter()
                .filter(|(k, _)| k.as_str() != id)
                .map(|(_, o)| o.content.len() as u64)
                .sum();
            if used + blob.len() as u64 > quota {
                return Err(DomainError::QuotaExceeded);
            }
        }
        let object = inner.objects.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        object.content = blob.to_vec();
        object.artifact.size_bytes = blob.len() as u64;
        Ok(())
    }

    async fn set_status(&self, id: &str, status: ArtifactStatus) -> Result<(), DomainError> {
        self.enter(TransportOp::SetStatus)?;
        let mut inner = self.lock();
        let object = inner.objects.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        object.artifact.transition(status)
    }

    async fn share_link(&self, id: &str) -> Result<Option<String>, DomainError> {
        self.enter(TransportOp::ShareLink)?;
        let mut inner = self.lock();
        let object = inner.objects.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        let link = format!("memory://backups/{}", id);
        object.artifact.shareable_link = Some(link.clone());
        Ok(Some(link))
    }

    async fn list_page(&self, page_token: Option<&str>) -> Result<RemotePage, DomainError> {
        self.enter(TransportOp::ListPage)?;
        let start: usize = match page_token {
            Some(t) => t
                .parse()
                .map_err(|_| DomainError::Network(format!("bad page token {}", t)))?,
            None => 0,
        };
        let inner = self.lock();
        let artifacts: Vec<BackupArtifact> = inner
            .objects
            .values()
            .skip(start)
            .take(self.page_size)
            .map(|o| o.artifact.clone())
            .collect();
        let end = start + artifacts.len();
        let next_page_token = (end < inner.objects.len()).then(|| end.to_string());
        Ok(RemotePage {
            artifacts,
            next_page_token,
        })
    }

    async fn get(&self, id: &str) -> Result<BackupArtifact, DomainError> {
        self.enter(TransportOp::Get)?;
        self.lock()
            .objects
            .get(id)
            .map(|o| o.artifact.clone())
            .ok_or_else(|| Self::not_found(id))
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, DomainError> {
        self.enter(TransportOp::Download)?;
        self.delay().await;
        self.lock()
            .objects
            .get(id)
            .map(|o| o.content.clone())
            .ok_or_else(|| Self::not_found(id))
    }

    async fn delete(&self, id: &str) -> Result<(), DomainError> {
        self.enter(TransportOp::Delete)?;
        self.lock()
            .objects
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(id))
    }
}
