//! Google OAuth 2.0 for installed apps: authorization code + PKCE over a loopback redirect.
//!
//! Tokens are kept in tokens.json next to the settings, written atomically.

use crate::domain::DomainError;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const REVOKE_ENDPOINT: &str = "https://oauth2.googleapis.com/revoke";
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

/// Refresh this long before the reported expiry.
const EXPIRY_SLACK_SECS: i64 = 60;
const MAX_REQUEST_BYTES: usize = 16 * 1024;
const REQUEST_READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub account_email: Option<String>,
}

impl Tokens {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_SLACK_SECS) >= self.expires_at
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct TokenError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// PKCE verifier/challenge pair plus the anti-forgery state.
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
    pub state: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let verifier = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        Self {
            challenge: challenge_for(&verifier),
            verifier,
            state: uuid::Uuid::new_v4().simple().to_string(),
        }
    }
}

/// S256 code challenge.
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Called with the URL the user has to open.
pub type UrlPrompt = Arc<dyn Fn(&str) + Send + Sync>;

pub struct OAuthClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    prompt: Option<UrlPrompt>,
}

impl OAuthClient {
    pub fn new(
        http: reqwest::Client,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            http,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: UrlPrompt) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn authorization_url(&self, pkce: &Pkce, login_hint: Option<&str>) -> Result<Url, DomainError> {
        let mut url = Url::parse_with_params(
            AUTH_ENDPOINT,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", DRIVE_SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("code_challenge", pkce.challenge.as_str()),
                ("code_challenge_method", "S256"),
                ("state", pkce.state.as_str()),
            ],
        )
        .map_err(|e| DomainError::Settings(format!("authorization url: {}", e)))?;
        if let Some(hint) = login_hint {
            url.query_pairs_mut().append_pair("login_hint", hint);
        }
        Ok(url)
    }

    /// Full interactive flow. The caller bounds it with a timeout; dropping the future
    /// closes the loopback listener.
    pub async fn authorize(&self, login_hint: Option<&str>) -> Result<Tokens, DomainError> {
        let listener = self.bind_redirect().await?;
        let pkce = Pkce::generate();
        let url = self.authorization_url(&pkce, login_hint)?;

        info!("waiting for Google authorization in the browser");
        match &self.prompt {
            Some(prompt) => prompt(url.as_str()),
            None => info!(url = %url, "open this URL to authorize"),
        }

        let code = wait_for_callback(&listener, &pkce.state).await?;
        debug!("authorization code received");
        self.exchange_code(&code, &pkce.verifier).await
    }

    async fn bind_redirect(&self) -> Result<TcpListener, DomainError> {
        let url = Url::parse(&self.redirect_uri)
            .map_err(|e| DomainError::Settings(format!("redirect uri: {}", e)))?;
        let host = url.host_str().unwrap_or("127.0.0.1");
        let port = url.port_or_known_default().unwrap_or(80);
        TcpListener::bind((host, port))
            .await
            .map_err(|e| DomainError::Network(format!("bind {}:{}: {}", host, port, e)))
    }

    async fn exchange_code(&self, code: &str, verifier: &str) -> Result<Tokens, DomainError> {
        let resp = self
            .http
            .post(TOKEN_ENDPOINT)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("code_verifier", verifier),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(transport_err)?;
        let token = read_token_response(resp, DomainError::AuthDenied).await?;
        info!("authorization code exchanged");
        Ok(Tokens {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
            account_email: None,
        })
    }

    /// New access token from a refresh token. A rejected grant is `AuthExpired`.
    pub async fn refresh(&self, tokens: &Tokens) -> Result<Tokens, DomainError> {
        let refresh_token = tokens
            .refresh_token
            .as_deref()
            .ok_or(DomainError::AuthExpired)?;
        let resp = self
            .http
            .post(TOKEN_ENDPOINT)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(transport_err)?;
        let token = read_token_response(resp, DomainError::AuthExpired).await?;
        debug!("access token refreshed");
        Ok(Tokens {
            access_token: token.access_token,
            // Google usually omits the refresh token on refresh; keep the old one.
            refresh_token: token.refresh_token.or_else(|| tokens.refresh_token.clone()),
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
            account_email: tokens.account_email.clone(),
        })
    }

    pub async fn revoke(&self, tokens: &Tokens) -> Result<(), DomainError> {
        let token = tokens
            .refresh_token
            .as_deref()
            .unwrap_or(&tokens.access_token);
        let resp = self
            .http
            .post(REVOKE_ENDPOINT)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(transport_err)?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            // Already revoked or expired.
            StatusCode::BAD_REQUEST => Ok(()),
            s => Err(DomainError::Network(format!("revoke returned {}", s))),
        }
    }
}

async fn read_token_response(
    resp: reqwest::Response,
    rejected: DomainError,
) -> Result<TokenResponse, DomainError> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json::<TokenResponse>()
            .await
            .map_err(|e| DomainError::Network(format!("token response: {}", e)));
    }
    let body = resp.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(DomainError::Network(format!("token endpoint returned {}", status)));
    }
    match serde_json::from_str::<TokenError>(&body) {
        Ok(err) => warn!(
            error = %err.error,
            description = err.error_description.as_deref().unwrap_or(""),
            "token request rejected"
        ),
        Err(_) => warn!(%status, "token request rejected"),
    }
    Err(rejected)
}

/// Map a reqwest failure. Everything on the wire is transient from our point of view.
pub(crate) fn transport_err(e: reqwest::Error) -> DomainError {
    if e.is_timeout() {
        DomainError::Network(format!("request timed out: {}", e))
    } else if e.is_connect() {
        DomainError::Network(format!("connection failed: {}", e))
    } else {
        DomainError::Network(e.to_string())
    }
}

/// Serve the loopback redirect until a request carrying our state (or an error) arrives.
/// Each connection is read on its own task, so an idle socket (a browser preconnect)
/// cannot hold up the real callback.
pub async fn wait_for_callback(listener: &TcpListener, expected_state: &str) -> Result<String, DomainError> {
    let (tx, mut rx) = mpsc::channel::<Result<String, DomainError>>(1);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) =
                    accepted.map_err(|e| DomainError::Network(format!("accept: {}", e)))?;
                debug!(%peer, "redirect connection");
                let tx = tx.clone();
                let expected = expected_state.to_string();
                tokio::spawn(async move {
                    let handled =
                        tokio::time::timeout(REQUEST_READ_TIMEOUT, handle_redirect(stream, &expected));
                    match handled.await {
                        Ok(Some(outcome)) => {
                            let _ = tx.send(outcome).await;
                        }
                        Ok(None) => {}
                        Err(_) => debug!(%peer, "redirect connection idle; dropped"),
                    }
                });
            }
            Some(outcome) = rx.recv() => return outcome,
        }
    }
}

/// `None` for requests that are not the OAuth callback.
async fn handle_redirect(
    mut stream: TcpStream,
    expected_state: &str,
) -> Option<Result<String, DomainError>> {
    let target = read_request_target(&mut stream).await?;
    let Some(params) = CallbackParams::parse(&target) else {
        respond(&mut stream, "404 Not Found", "Not found.").await;
        return None;
    };

    if let Some(error) = params.error {
        respond(&mut stream, "200 OK", "Authorization was cancelled. You can close this tab.").await;
        warn!(error = %error, "authorization denied");
        return Some(Err(DomainError::AuthDenied));
    }
    if params.state.as_deref() != Some(expected_state) {
        respond(&mut stream, "400 Bad Request", "Authorization state mismatch.").await;
        warn!("authorization callback with unexpected state");
        return Some(Err(DomainError::AuthDenied));
    }
    Some(match params.code {
        Some(code) => {
            respond(&mut stream, "200 OK", "Authorization complete. You can close this tab.").await;
            Ok(code)
        }
        None => {
            respond(&mut stream, "400 Bad Request", "Missing authorization code.").await;
            Err(DomainError::AuthDenied)
        }
    })
}

#[derive(Debug, Default, PartialEq, Eq)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

impl CallbackParams {
    /// `None` unless the target carries at least one OAuth parameter.
    fn parse(target: &str) -> Option<Self> {
        let url = Url::parse(&format!("http://localhost{}", target)).ok()?;
        let mut params = Self::default();
        for (k, v) in url.query_pairs() {
            match k.as_ref() {
                "code" => params.code = Some(v.into_owned()),
                "state" => params.state = Some(v.into_owned()),
                "error" => params.error = Some(v.into_owned()),
                _ => {}
            }
        }
        (params != Self::default()).then_some(params)
    }
}

/// Request-target of an HTTP/1.x request line, e.g. `/callback?code=...`.
async fn read_request_target(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") && buf.len() < MAX_REQUEST_BYTES {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let head = String::from_utf8_lossy(&buf);
    let mut parts = head.lines().next()?.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(target)) => Some(target.to_string()),
        _ => None,
    }
}

async fn respond(stream: &mut TcpStream, status: &str, message: &str) {
    let body = format!("<html><body><p>{}</p></body></html>", message);
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!(error = %e, "could not answer redirect request");
    }
    let _ = stream.shutdown().await;
}

/// tokens.json storage.
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub async fn load(&self) -> Result<Option<Tokens>, DomainError> {
        match fs::read_to_string(&self.path).await {
            Ok(s) => match serde_json::from_str(&s) {
                Ok(t) => Ok(Some(t)),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "ignoring unreadable token file");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DomainError::Settings(format!("read tokens: {}", e))),
        }
    }

    pub async fn save(&self, tokens: &Tokens) -> Result<(), DomainError> {
        let json =
            serde_json::to_string_pretty(tokens).map_err(|e| DomainError::Settings(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_path = self.path.with_extension("json.tmp");
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
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| DomainError::Settings(format!("atomic rename failed: {}", e)))
    }

    pub async fn clear(&self) -> Result<(), DomainError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OAuthClient {
        OAuthClient::new(
            reqwest::Client::new(),
            "client-123",
            "secret",
            "http://127.0.0.1:8765/callback",
        )
    }

    async fn send_request(addr: std::net::SocketAddr, target: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", target);
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut resp = String::new();
        stream.read_to_string(&mut resp).await.unwrap();
        resp
    }

    #[test]
    fn challenge_matches_rfc7636_example() {
        assert_eq!(
            challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuwGTYoSDHk"
        );
    }

    #[test]
    fn verifier_has_valid_length() {
        let pkce = Pkce::generate();
        assert!((43..=128).contains(&pkce.verifier.len()));
        assert_eq!(pkce.challenge, challenge_for(&pkce.verifier));
    }

    #[test]
    fn authorization_url_carries_pkce_and_hint() {
        let pkce = Pkce::generate();
        let url = client()
            .authorization_url(&pkce, Some("me@example.com"))
            .unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(pairs["client_id"], "client-123");
        assert_eq!(pairs["code_challenge"], pkce.challenge);
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["state"], pkce.state);
        assert_eq!(pairs["scope"], DRIVE_SCOPE);
        assert_eq!(pairs["access_type"], "offline");
        assert_eq!(pairs["login_hint"], "me@example.com");
    }

    #[test]
    fn callback_params_parse() {
        assert_eq!(
            CallbackParams::parse("/callback?code=abc%2F1&state=s1"),
            Some(CallbackParams {
                code: Some("abc/1".into()),
                state: Some("s1".into()),
                error: None,
            })
        );
        assert_eq!(CallbackParams::parse("/favicon.ico"), None);
    }

    #[test]
    fn tokens_expire_with_slack() {
        let now = Utc::now();
        let t = Tokens {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: now + Duration::seconds(30),
            account_email: None,
        };
        assert!(t.is_expired(now));
        let t = Tokens {
            expires_at: now + Duration::seconds(3600),
            ..t
        };
        assert!(!t.is_expired(now));
    }

    #[tokio::test]
    async fn loopback_returns_code_for_matching_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let browser = tokio::spawn(async move {
            let favicon = send_request(addr, "/favicon.ico").await;
            let done = send_request(addr, "/callback?state=xyz&code=the-code").await;
            (favicon, done)
        });
        let code = wait_for_callback(&listener, "xyz").await.unwrap();
        let (favicon, done) = browser.await.unwrap();

        assert_eq!(code, "the-code");
        assert!(favicon.starts_with("HTTP/1.1 404"));
        assert!(done.starts_with("HTTP/1.1 200"));
    }

    #[tokio::test]
    async fn idle_connection_does_not_block_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let preconnect = TcpStream::connect(addr).await.unwrap();
        let browser = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            send_request(addr, "/callback?state=xyz&code=late-code").await
        });
        let code = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            wait_for_callback(&listener, "xyz"),
        )
        .await
        .expect("callback stuck behind idle socket")
        .unwrap();

        assert_eq!(code, "late-code");
        assert!(browser.await.unwrap().starts_with("HTTP/1.1 200"));
        drop(preconnect);
    }

    #[tokio::test]
    async fn denied_consent_is_auth_denied() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { send_request(addr, "/callback?error=access_denied&state=xyz").await });

        assert_eq!(
            wait_for_callback(&listener, "xyz").await.unwrap_err(),
            DomainError::AuthDenied
        );
    }

    #[tokio::test]
    async fn forged_state_is_auth_denied() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { send_request(addr, "/callback?code=c&state=other").await });

        assert_eq!(
            wait_for_callback(&listener, "xyz").await.unwrap_err(),
            DomainError::AuthDenied
        );
    }

    #[tokio::test]
    async fn token_store_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));
        assert!(store.load().await.unwrap().is_none());

        let tokens = Tokens {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            expires_at: Utc::now(),
            account_email: Some("me@example.com".into()),
        };
        store.save(&tokens).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(tokens));

        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }
}
