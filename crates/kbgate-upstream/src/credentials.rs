use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use kbgate_core::{CoreError, TokenProvider, unix_millis};
use reqwest::{
    Client, Url,
    cookie::{CookieStore, Jar},
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const TOKEN_COOKIE: &str = "token";
pub const AUTHORIZATION_COOKIE: &str = "AUTHORIZATION";

/// Upstream session token and the instant (unix millis) it stops being usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedCredential {
    pub token: String,
    pub expires_at: i64,
}

impl CachedCredential {
    pub fn is_usable_at(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at
    }

    /// Expiry `ttl` after `now_ms`, clamped to `i64::MAX`.
    pub fn expiry_after(now_ms: i64, ttl: Duration) -> i64 {
        now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
    }
}

/// The credential file shared across restarts.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing, unreadable or corrupt file is a miss, never an error.
    pub async fn read(&self) -> Option<CachedCredential> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
            Err(error) => {
                warn!(event = "credential.file.unreadable", path = %self.path.display(), %error);
                return None;
            }
        };
        match serde_json::from_slice::<CachedCredential>(&raw) {
            Ok(credential) => Some(credential),
            Err(error) => {
                warn!(event = "credential.file.corrupt", path = %self.path.display(), %error);
                None
            }
        }
    }

    /// Writes a sibling temp file and renames it over the target so readers
    /// never observe a half-written credential.
    pub async fn write(&self, credential: &CachedCredential) -> std::io::Result<()> {
        let data = serde_json::to_vec(credential)?;
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        tokio::fs::write(&temp, &data).await?;
        if let Err(error) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self) -> Result<String, CoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSettings {
    pub login_url: String,
    pub login_name: Option<String>,
    pub password: Option<String>,
    pub timeout_seconds: u64,
}

/// Form login against the upstream auth endpoint. The session token comes
/// back as a cookie, so every login uses a fresh jar.
pub struct HttpAuthenticator {
    settings: LoginSettings,
}

impl HttpAuthenticator {
    pub fn new(settings: LoginSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn login(&self) -> Result<String, CoreError> {
        let (Some(login_name), Some(password)) =
            (self.settings.login_name.as_deref(), self.settings.password.as_deref())
        else {
            return Err(CoreError::Auth("login credentials are not configured".to_string()));
        };
        let url = Url::parse(&self.settings.login_url)
            .map_err(|err| CoreError::Auth(format!("invalid login url: {err}")))?;

        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .cookie_provider(jar.clone())
            .timeout(Duration::from_secs(self.settings.timeout_seconds))
            .build()
            .map_err(|err| CoreError::Auth(format!("login client init failed: {err}")))?;

        let response = client
            .post(url.clone())
            .form(&[("loginName", login_name), ("password", password)])
            .send()
            .await
            .map_err(|err| CoreError::Auth(format!("login request failed: {err}")))?;

        let cookies = jar
            .cookies(&url)
            .and_then(|value| value.to_str().ok().map(str::to_string))
            .unwrap_or_default();
        if let Some(token) = token_from_cookie_header(&cookies) {
            debug!(event = "credential.login.cookie_found", status = response.status().as_u16());
            return Ok(token);
        }

        Err(CoreError::Auth(format!(
            "no token cookie (status: {}, headers: {:?}, cookies: {:?})",
            response.status().as_u16(),
            response.headers(),
            cookies
        )))
    }
}

/// Picks the session token out of a `Cookie` header value, preferring
/// `token` over `AUTHORIZATION`.
pub fn token_from_cookie_header(header: &str) -> Option<String> {
    let pairs = header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .filter(|(_, value)| !value.is_empty())
        .collect::<Vec<_>>();
    [TOKEN_COOKIE, AUTHORIZATION_COOKIE].into_iter().find_map(|name| {
        pairs.iter().find(|(key, _)| *key == name).map(|(_, value)| value.to_string())
    })
}

/// Process-wide upstream token. The whole check, reload, login and persist
/// sequence runs under one lock, so concurrent callers share a single login.
pub struct CredentialCache {
    store: CredentialStore,
    authenticator: Arc<dyn Authenticator>,
    ttl: Duration,
    state: Mutex<Option<CachedCredential>>,
}

impl CredentialCache {
    pub fn new(store: CredentialStore, authenticator: Arc<dyn Authenticator>, ttl: Duration) -> Self {
        Self { store, authenticator, ttl, state: Mutex::new(None) }
    }
}

#[async_trait]
impl TokenProvider for CredentialCache {
    async fn valid_token(&self) -> Result<String, CoreError> {
        let mut guard = self.state.lock().await;
        let now_ms = unix_millis();

        if let Some(credential) = guard.as_ref()
            && credential.is_usable_at(now_ms)
        {
            return Ok(credential.token.clone());
        }

        if let Some(credential) = self.store.read().await
            && credential.is_usable_at(now_ms)
        {
            debug!(event = "credential.cache.hit", source = "file");
            let token = credential.token.clone();
            *guard = Some(credential);
            return Ok(token);
        }

        info!(event = "credential.cache.miss", "logging in to upstream");
        let token = self.authenticator.login().await?;
        let credential = CachedCredential {
            token: token.clone(),
            expires_at: CachedCredential::expiry_after(unix_millis(), self.ttl),
        };
        if let Err(error) = self.store.write(&credential).await {
            warn!(event = "credential.file.write_failed", path = %self.store.path().display(), %error);
        }
        info!(event = "credential.cache.refreshed", expires_at = credential.expires_at);
        *guard = Some(credential);
        Ok(token)
    }
}
