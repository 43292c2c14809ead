//! Implements RemoteTransport on the Google Drive v3 REST API.
//!
//! Archives live in one Drive folder and are tagged with `appProperties`:
//! - `app`: marks files created by this tool (listing filters on it)
//! - `status`: pending | success | failed
//! - `createdBy`, `createdAt`, `sizeBytes`, `fingerprint`: the recorded artifact metadata
//!
//! A 401 or a rejected refresh is `AuthExpired`; quota errors are `QuotaExceeded`;
//! 408/429/5xx and wire failures are `Network`. Other 403s (sharing blocked by the domain,
//! missing file permissions) are `Io`: the credentials are still good.

use crate::adapters::remote::oauth::{OAuthClient, TokenStore, Tokens, UrlPrompt, transport_err};
use crate::domain::{ArtifactStatus, BackupArtifact, DomainError, RemotePage, UploadMetadata};
use crate::ports::RemoteTransport;
use crate::shared::config::AppConfig;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const FILES_ENDPOINT: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_ENDPOINT: &str = "https://www.googleapis.com/upload/drive/v3/files";
const ABOUT_ENDPOINT: &str = "https://www.googleapis.com/drive/v3/about";
const FILE_FIELDS: &str = "id,name,createdTime,size,webViewLink,appProperties";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const ARCHIVE_MIME: &str = "application/zip";
const APP_TAG: &str = "cloud-backup";
const PAGE_SIZE: &str = "100";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    created_time: Option<DateTime<Utc>>,
    /// Decimal string, present for binary content.
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    web_view_link: Option<String>,
    #[serde(default)]
    app_properties: HashMap<String, String>,
}

impl DriveFile {
    fn into_artifact(self) -> BackupArtifact {
        let prop = |k: &str| self.app_properties.get(k).cloned();
        let status = prop("status")
            .and_then(|s| ArtifactStatus::parse(&s))
            .unwrap_or(ArtifactStatus::Pending);
        let created_at = prop("createdAt")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc))
            .or(self.created_time)
            .unwrap_or_else(Utc::now);
        let size_bytes = prop("sizeBytes")
            .or_else(|| self.size.clone())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        BackupArtifact {
            created_by: prop("createdBy").unwrap_or_default(),
            fingerprint: prop("fingerprint"),
            id: self.id,
            name: self.name,
            created_at,
            size_bytes,
            shareable_link: self.web_view_link,
            status,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct About {
    user: AboutUser,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AboutUser {
    email_address: String,
}

pub struct GoogleDriveTransport {
    http: Client,
    oauth: OAuthClient,
    token_store: TokenStore,
    /// Cached tokens; `None` until loaded or after revoke.
    tokens: Mutex<Option<Tokens>>,
    loaded: Mutex<bool>,
    folder_name: String,
    folder_id: Mutex<Option<String>>,
}

impl GoogleDriveTransport {
    /// Build from configuration. Fails when client credentials are missing.
    pub fn from_config(
        config: &AppConfig,
        oauth_prompt: Option<UrlPrompt>,
    ) -> Result<Self, DomainError> {
        if !config.is_google_configured() {
            return Err(DomainError::Settings(
                "CLOUD_BACKUP_GOOGLE_CLIENT_ID and CLOUD_BACKUP_GOOGLE_CLIENT_SECRET are required".into(),
            ));
        }
        let http = Client::builder()
            .user_agent(concat!("cloud-backup/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DomainError::Settings(format!("http client: {}", e)))?;
        let mut oauth = OAuthClient::new(
            http.clone(),
            config.google_client_id.clone().unwrap_or_default(),
            config.google_client_secret.clone().unwrap_or_default(),
            config.redirect_uri_or_default(),
        );
        if let Some(prompt) = oauth_prompt {
            oauth = oauth.with_prompt(prompt);
        }
        Ok(Self {
            http,
            oauth,
            token_store: TokenStore::new(config.data_dir_or_default().join("tokens.json")),
            tokens: Mutex::new(None),
            loaded: Mutex::new(false),
            folder_name: config.drive_folder_or_default(),
            folder_id: Mutex::new(None),
        })
    }

    /// Current tokens, loading tokens.json on first use.
    async fn current_tokens(&self) -> Option<Tokens> {
        let mut loaded = self.loaded.lock().await;
        if !*loaded {
            *loaded = true;
            match self.token_store.load().await {
                Ok(t) => *self.tokens.lock().await = t,
                Err(e) => warn!(error = %e, "could not read stored tokens"),
            }
        }
        self.tokens.lock().await.clone()
    }

    /// A valid access token, refreshing it when close to expiry.
    async fn access_token(&self) -> Result<String, DomainError> {
        let tokens = self.current_tokens().await.ok_or(DomainError::AuthExpired)?;
        if !tokens.is_expired(Utc::now()) {
            return Ok(tokens.access_token);
        }
        let refreshed = self.oauth.refresh(&tokens).await?;
        if let Err(e) = self.token_store.save(&refreshed).await {
            warn!(error = %e, "could not persist refreshed tokens");
        }
        let access = refreshed.access_token.clone();
        *self.tokens.lock().await = Some(refreshed);
        Ok(access)
    }

    /// Authorized request; non-2xx responses are mapped to domain errors.
    async fn send(&self, request: RequestBuilder) -> Result<Response, DomainError> {
        let token = self.access_token().await?;
        let resp = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_err)?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(map_status(status, &body))
    }

    async fn send_json<T: serde::de::DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, DomainError> {
        self.send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| DomainError::Network(format!("decode response: {}", e)))
    }

    async fn account_email(&self) -> Result<String, DomainError> {
        let about: About = self
            .send_json(
                self.http
                    .get(ABOUT_ENDPOINT)
                    .query(&[("fields", "user(emailAddress)")]),
            )
            .await?;
        Ok(about.user.email_address)
    }

    /// Id of the backup folder, created on first use.
    async fn folder(&self) -> Result<String, DomainError> {
        let mut cached = self.folder_id.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }
        let q = format!(
            "name = '{}' and mimeType = '{}' and trashed = false",
            escape_query(&self.folder_name),
            FOLDER_MIME
        );
        let found: FileList = self
            .send_json(
                self.http
                    .get(FILES_ENDPOINT)
                    .query(&[("q", q.as_str()), ("fields", "files(id)"), ("pageSize", "1")]),
            )
            .await?;
        let id = match found.files.into_iter().next() {
            Some(f) => f.id,
            None => {
                let created: DriveFile = self
                    .send_json(
                        self.http
                            .post(FILES_ENDPOINT)
                            .query(&[("fields", "id")])
                            .json(&json!({ "name": self.folder_name, "mimeType": FOLDER_MIME })),
                    )
                    .await?;
                info!(folder = %self.folder_name, "created Drive backup folder");
                created.id
            }
        };
        *cached = Some(id.clone());
        Ok(id)
    }
}

#[async_trait::async_trait]
impl RemoteTransport for GoogleDriveTransport {
    async fn authorize(&self, account_hint: Option<&str>) -> Result<String, DomainError> {
        let mut tokens = self.oauth.authorize(account_hint).await?;
        *self.tokens.lock().await = Some(tokens.clone());
        *self.loaded.lock().await = true;

        let email = self.account_email().await?;
        tokens.account_email = Some(email.clone());
        self.token_store.save(&tokens).await?;
        *self.tokens.lock().await = Some(tokens);
        *self.folder_id.lock().await = None;
        info!(account = %email, "[DRIVE] authorized");
        Ok(email)
    }

    async fn has_session(&self) -> bool {
        self.current_tokens().await.is_some()
    }

    async fn revoke(&self) -> Result<(), DomainError> {
        let tokens = self.current_tokens().await;
        *self.tokens.lock().await = None;
        *self.folder_id.lock().await = None;
        self.token_store.clear().await?;
        match tokens {
            Some(t) => self.oauth.revoke(&t).await,
            None => Ok(()),
        }
    }

    async fn create_pending(&self, metadata: &UploadMetadata) -> Result<BackupArtifact, DomainError> {
        let folder = self.folder().await?;
        let body = json!({
            "name": metadata.name,
            "description": metadata.description,
            "mimeType": ARCHIVE_MIME,
            "parents": [folder],
            "appProperties": {
                "app": APP_TAG,
                "status": ArtifactStatus::Pending.as_str(),
                "createdBy": metadata.created_by,
                "createdAt": metadata.created_at.to_rfc3339(),
                "sizeBytes": metadata.size_bytes.to_string(),
                "fingerprint": metadata.fingerprint.clone().unwrap_or_default(),
            },
        });
        let file: DriveFile = self
            .send_json(
                self.http
                    .post(FILES_ENDPOINT)
                    .query(&[("fields", FILE_FIELDS)])
                    .json(&body),
            )
            .await?;
        debug!(file_id = %file.id, "[DRIVE] pending file created");
        let mut artifact = file.into_artifact();
        if artifact.fingerprint.as_deref() == Some("") {
            artifact.fingerprint = None;
        }
        Ok(artifact)
    }

    async fn put_content(&self, id: &str, blob: &[u8]) -> Result<(), DomainError> {
        self.send(
            self.http
                .patch(format!("{}/{}", UPLOAD_ENDPOINT, id))
                .query(&[("uploadType", "media")])
                .header(reqwest::header::CONTENT_TYPE, ARCHIVE_MIME)
                .body(blob.to_vec()),
        )
        .await?;
        debug!(file_id = %id, bytes = blob.len(), "[DRIVE] content uploaded");
        Ok(())
    }

    async fn set_status(&self, id: &str, status: ArtifactStatus) -> Result<(), DomainError> {
        self.send(
            self.http
                .patch(format!("{}/{}", FILES_ENDPOINT, id))
                .query(&[("fields", "id")])
                .json(&json!({ "appProperties": { "status": status.as_str() } })),
        )
        .await?;
        Ok(())
    }

    async fn share_link(&self, id: &str) -> Result<Option<String>, DomainError> {
        self.send(
            self.http
                .post(format!("{}/{}/permissions", FILES_ENDPOINT, id))
                .json(&json!({ "role": "reader", "type": "anyone" })),
        )
        .await?;
        let file: DriveFile = self
            .send_json(
                self.http
                    .get(format!("{}/{}", FILES_ENDPOINT, id))
                    .query(&[("fields", "id,webViewLink")]),
            )
            .await?;
        Ok(file.web_view_link)
    }

    async fn list_page(&self, page_token: Option<&str>) -> Result<RemotePage, DomainError> {
        let folder = self.folder().await?;
        let q = format!(
            "'{}' in parents and trashed = false and appProperties has {{ key='app' and value='{}' }}",
            escape_query(&folder),
            APP_TAG
        );
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let mut request = self.http.get(FILES_ENDPOINT).query(&[
            ("q", q.as_str()),
            ("fields", fields.as_str()),
            ("orderBy", "createdTime desc"),
            ("pageSize", PAGE_SIZE),
        ]);
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }
        let list: FileList = self.send_json(request).await?;
        Ok(RemotePage {
            artifacts: list.files.into_iter().map(DriveFile::into_artifact).collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn get(&self, id: &str) -> Result<BackupArtifact, DomainError> {
        let file: DriveFile = self
            .send_json(
                self.http
                    .get(format!("{}/{}", FILES_ENDPOINT, id))
                    .query(&[("fields", FILE_FIELDS)]),
            )
            .await?;
        Ok(file.into_artifact())
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, DomainError> {
        let resp = self
            .send(
                self.http
                    .get(format!("{}/{}", FILES_ENDPOINT, id))
                    .query(&[("alt", "media")]),
            )
            .await?;
        let bytes = resp.bytes().await.map_err(transport_err)?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, id: &str) -> Result<(), DomainError> {
        self.send(self.http.delete(format!("{}/{}", FILES_ENDPOINT, id)))
            .await?;
        Ok(())
    }
}

/// Drive query string literal escaping.
fn escape_query(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn map_status(status: StatusCode, body: &str) -> DomainError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        StatusCode::UNAUTHORIZED => DomainError::AuthExpired,
        StatusCode::FORBIDDEN if body.contains("storageQuotaExceeded") || body.contains("quotaExceeded") => {
            DomainError::QuotaExceeded
        }
        StatusCode::FORBIDDEN
            if body.contains("rateLimitExceeded") || body.contains("RateLimitExceeded") =>
        {
            DomainError::Network(format!("rate limited: {}", snippet))
        }
        StatusCode::FORBIDDEN => DomainError::Io(format!("Drive refused the request: {}", snippet)),
        StatusCode::NOT_FOUND => DomainError::NotFound(snippet),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            DomainError::Network(format!("{}: {}", status, snippet))
        }
        s if s.is_server_error() => DomainError::Network(format!("{}: {}", status, snippet)),
        _ => DomainError::Io(format!("Drive API returned {}: {}", status, snippet)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_domain_errors() {
        assert_eq!(map_status(StatusCode::UNAUTHORIZED, ""), DomainError::AuthExpired);
        assert_eq!(
            map_status(
                StatusCode::FORBIDDEN,
                r#"{"error":{"errors":[{"reason":"storageQuotaExceeded"}]}}"#
            ),
            DomainError::QuotaExceeded
        );
        assert!(map_status(StatusCode::FORBIDDEN, "userRateLimitExceeded").is_transient());
        assert!(matches!(
            map_status(StatusCode::NOT_FOUND, "File not found"),
            DomainError::NotFound(_)
        ));
        for s in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(map_status(s, "").is_transient(), "{s}");
        }
        assert!(!map_status(StatusCode::BAD_REQUEST, "bad").is_transient());
    }

    #[test]
    fn permission_refusals_keep_the_session() {
        for reason in ["publishOutNotPermitted", "insufficientFilePermissions"] {
            let body = format!(r#"{{"error":{{"code":403,"errors":[{{"reason":"{reason}"}}]}}}}"#);
            let err = map_status(StatusCode::FORBIDDEN, &body);
            assert!(matches!(err, DomainError::Io(_)), "{reason}: {err:?}");
            assert!(!err.is_auth());
            assert!(!err.is_transient());
        }
    }

    #[test]
    fn drive_file_uses_recorded_metadata() {
        let file: DriveFile = serde_json::from_str(
            r#"{
                "id": "f1",
                "name": "backup-20240101T000000Z.zip",
                "createdTime": "2024-01-01T00:00:05Z",
                "size": "999",
                "webViewLink": "https://drive.google.com/file/d/f1/view",
                "appProperties": {
                    "app": "cloud-backup",
                    "status": "success",
                    "createdBy": "me@example.com",
                    "createdAt": "2024-01-01T00:00:00Z",
                    "sizeBytes": "2500000",
                    "fingerprint": "abc123"
                }
            }"#,
        )
        .unwrap();

        let a = file.into_artifact();
        assert_eq!(a.id, "f1");
        assert_eq!(a.status, ArtifactStatus::Success);
        assert_eq!(a.size_bytes, 2_500_000);
        assert_eq!(a.created_by, "me@example.com");
        assert_eq!(a.created_at.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(a.fingerprint.as_deref(), Some("abc123"));
        assert!(a.shareable_link.is_some());
    }

    #[test]
    fn untagged_file_defaults_to_pending() {
        let file: DriveFile =
            serde_json::from_str(r#"{"id":"f2","createdTime":"2024-02-01T10:00:00Z","size":"12"}"#)
                .unwrap();
        let a = file.into_artifact();
        assert_eq!(a.status, ArtifactStatus::Pending);
        assert_eq!(a.size_bytes, 12);
        assert_eq!(a.fingerprint, None);
    }

    #[test]
    fn query_literals_are_escaped() {
        assert_eq!(escape_query("Bob's backups"), "Bob\\'s backups");
    }

    #[tokio::test]
    async fn missing_credentials_are_rejected() {
        let result = GoogleDriveTransport::from_config(&AppConfig::default(), None);
        assert!(matches!(result, Err(DomainError::Settings(_))));
    }

    #[tokio::test]
    async fn no_tokens_means_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            data_dir: Some(dir.path().to_string_lossy().into_owned()),
            google_client_id: Some("id".into()),
            google_client_secret: Some("secret".into()),
            ..Default::default()
        };
        let drive = GoogleDriveTransport::from_config(&config, None).unwrap();

        assert!(!drive.has_session().await);
        assert_eq!(
            drive.list_page(None).await.unwrap_err(),
            DomainError::AuthExpired
        );
    }
}
