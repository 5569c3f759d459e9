pub mod claude;
pub mod codex;

use crate::clock::Clock;
use crate::error::UsageError;
use crate::models::ProviderId;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const REFRESH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Tokens are treated as expired slightly before their stated expiry.
const EXPIRY_SKEW_SECONDS: i64 = 60;

/// OAuth material for one provider, as read from its CLI's credential file.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub provider: ProviderId,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub id_token: Option<String>,
    pub account_id: Option<String>,
    /// Raw plan/tier strings, most specific first
    pub plan_hints: Vec<String>,
    /// Static API key rather than an OAuth token
    pub is_api_key: bool,
}

impl Credential {
    pub fn bearer(provider: ProviderId, access_token: impl Into<String>) -> Self {
        Self {
            provider,
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            last_refresh: None,
            id_token: None,
            account_id: None,
            plan_hints: Vec::new(),
            is_api_key: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= now + Duration::seconds(EXPIRY_SKEW_SECONDS))
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        if self.is_api_key || self.refresh_token.is_none() {
            return false;
        }
        self.is_expired(now)
            || match self.provider {
                ProviderId::Claude => false,
                ProviderId::Codex => codex::is_stale(self, now),
            }
    }
}

/// Token endpoint response shared by both providers.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshedTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<f64>,
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn load(&self, provider: ProviderId) -> Result<Credential, UsageError>;
}

/// Reads credential files written by each provider's CLI and refreshes them
/// in place when they expire.
///
/// A refresh that cannot be written back is kept in memory and served in
/// place of the file until the file changes or a later write succeeds, so a
/// rotated refresh token is never lost.
pub struct CredentialStore {
    paths: HashMap<ProviderId, PathBuf>,
    token_endpoints: HashMap<ProviderId, String>,
    locks: HashMap<ProviderId, Arc<Mutex<()>>>,
    unsaved: std::sync::Mutex<HashMap<ProviderId, UnsavedRefresh>>,
    write_back: bool,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
}

/// Refreshed credential JSON plus the file contents it supersedes.
struct UnsavedRefresh {
    base: String,
    root: Value,
}

impl CredentialStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REFRESH_TIMEOUT)
            .user_agent(concat!("usagebar/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        let mut paths = HashMap::new();
        paths.insert(ProviderId::Claude, claude::credentials_path());
        paths.insert(ProviderId::Codex, codex::credentials_path());

        let mut token_endpoints = HashMap::new();
        token_endpoints.insert(ProviderId::Claude, claude::TOKEN_ENDPOINT.to_string());
        token_endpoints.insert(ProviderId::Codex, codex::TOKEN_ENDPOINT.to_string());

        let locks = ProviderId::ALL
            .iter()
            .map(|p| (*p, Arc::new(Mutex::new(()))))
            .collect();

        Self {
            paths,
            token_endpoints,
            locks,
            unsaved: std::sync::Mutex::new(HashMap::new()),
            write_back: true,
            client,
            clock,
        }
    }

    /// Never write refreshed credentials to disk.
    #[cfg(test)]
    pub fn read_only(mut self) -> Self {
        self.write_back = false;
        self
    }

    #[cfg(test)]
    pub fn with_path(mut self, provider: ProviderId, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(provider, path.into());
        self
    }

    #[cfg(test)]
    pub fn with_token_endpoint(mut self, provider: ProviderId, url: impl Into<String>) -> Self {
        self.token_endpoints.insert(provider, url.into());
        self
    }

    pub fn path(&self, provider: ProviderId) -> PathBuf {
        self.paths
            .get(&provider)
            .cloned()
            .unwrap_or_else(|| match provider {
                ProviderId::Claude => claude::credentials_path(),
                ProviderId::Codex => codex::credentials_path(),
            })
    }

    async fn read(&self, provider: ProviderId) -> Result<(Credential, Value, String), UsageError> {
        let path = self.path(provider);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(UsageError::Unauthenticated(format!(
                    "Not logged in. Run `{}` to authenticate.",
                    provider.login_command()
                )));
            }
            Err(e) => {
                return Err(UsageError::Unauthenticated(format!(
                    "Failed to read credentials at {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let root = match self.unsaved_root(provider, &content) {
            Some(root) => root,
            None => serde_json::from_str(content.trim()).map_err(|e| {
                UsageError::Unauthenticated(format!("Failed to parse {}: {}", path.display(), e))
            })?,
        };
        let credential = match provider {
            ProviderId::Claude => claude::parse(&root)?,
            ProviderId::Codex => codex::parse(&root)?,
        };
        Ok((credential, root, content))
    }

    fn unsaved(&self) -> std::sync::MutexGuard<'_, HashMap<ProviderId, UnsavedRefresh>> {
        self.unsaved.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// In-memory refresh for `provider`, unless the file on disk has moved on
    /// since it was made.
    fn unsaved_root(&self, provider: ProviderId, content: &str) -> Option<Value> {
        let mut unsaved = self.unsaved();
        let entry = unsaved.get(&provider)?;
        if entry.base == content {
            return Some(entry.root.clone());
        }
        tracing::info!(provider = %provider, "Credential file changed on disk, dropping unsaved refresh");
        unsaved.remove(&provider);
        None
    }

    async fn refresh(&self, provider: ProviderId) -> Result<Credential, UsageError> {
        let lock = self
            .locks
            .get(&provider)
            .cloned()
            .unwrap_or_else(|| Arc::new(Mutex::new(())));
        let _guard = lock.lock().await;
        let path = self.path(provider);
        let _file_lock = CredentialFileLock::acquire(lock_path_for(&path)).await?;

        // Another pipeline or process may have refreshed while we waited.
        let (current, mut root, content) = self.read(provider).await?;
        let now = self.clock.now();
        if !current.needs_refresh(now) {
            tracing::debug!(provider = %provider, "Credential already refreshed");
            return Ok(current);
        }

        let refresh_token = current.refresh_token.clone().ok_or_else(|| {
            UsageError::Unauthenticated(format!(
                "No refresh token. Run `{}` to log in again.",
                provider.login_command()
            ))
        })?;

        let endpoint = self
            .token_endpoints
            .get(&provider)
            .cloned()
            .unwrap_or_default();
        let body = match provider {
            ProviderId::Claude => claude::refresh_body(&refresh_token),
            ProviderId::Codex => codex::refresh_body(&refresh_token),
        };
        let tokens = request_refresh(&self.client, &endpoint, &body).await?;

        match provider {
            ProviderId::Claude => claude::apply_refresh(&mut root, &tokens, now),
            ProviderId::Codex => codex::apply_refresh(&mut root, &tokens, now),
        }

        let written = if self.write_back {
            write_json_atomic(path.clone(), &root).await
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "credential write-back disabled",
            ))
        };
        match written {
            Ok(()) => {
                self.unsaved().remove(&provider);
                tracing::info!(provider = %provider, path = %path.display(), "Refreshed OAuth token");
            }
            Err(e) => {
                tracing::error!(
                    provider = %provider,
                    path = %path.display(),
                    error = %e,
                    "Failed to persist refreshed credentials, keeping them in memory"
                );
                self.unsaved().insert(
                    provider,
                    UnsavedRefresh {
                        base: content,
                        root: root.clone(),
                    },
                );
            }
        }

        match provider {
            ProviderId::Claude => claude::parse(&root),
            ProviderId::Codex => codex::parse(&root),
        }
    }
}

#[async_trait]
impl CredentialSource for CredentialStore {
    async fn load(&self, provider: ProviderId) -> Result<Credential, UsageError> {
        let (credential, _, _) = self.read(provider).await?;
        let now = self.clock.now();

        if !credential.needs_refresh(now) {
            if credential.is_expired(now) {
                return Err(UsageError::Unauthenticated(format!(
                    "Token expired. Run `{}` to refresh.",
                    provider.login_command()
                )));
            }
            return Ok(credential);
        }

        match self.refresh(provider).await {
            Ok(refreshed) => Ok(refreshed),
            Err(e) if !credential.is_expired(now) => {
                tracing::warn!(provider = %provider, error = %e, "Proactive token refresh failed, using current token");
                Ok(credential)
            }
            Err(e) => Err(UsageError::Unauthenticated(format!(
                "Token expired and refresh failed ({}). Run `{}` to log in.",
                e,
                provider.login_command()
            ))),
        }
    }
}

/// Fixed credentials, for mock mode and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    credentials: HashMap<ProviderId, Credential>,
}

impl StaticCredentials {
    pub fn new(credentials: impl IntoIterator<Item = Credential>) -> Self {
        Self {
            credentials: credentials
                .into_iter()
                .map(|c| (c.provider, c))
                .collect(),
        }
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn load(&self, provider: ProviderId) -> Result<Credential, UsageError> {
        self.credentials.get(&provider).cloned().ok_or_else(|| {
            UsageError::Unauthenticated(format!(
                "Not logged in. Run `{}` to authenticate.",
                provider.login_command()
            ))
        })
    }
}

/// Exclusive advisory lock on a sidecar file, released on drop.
struct CredentialFileLock {
    file: File,
}

impl CredentialFileLock {
    async fn acquire(path: PathBuf) -> Result<Self, UsageError> {
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok::<_, std::io::Error>(CredentialFileLock { file })
        })
        .await
        .map_err(|e| UsageError::Unauthenticated(format!("Credential lock task failed: {e}")))?
        .map_err(|e| UsageError::Unauthenticated(format!("Failed to lock credentials: {e}")))
    }
}

impl Drop for CredentialFileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "credentials".to_string());
    path.with_file_name(format!("{name}.lock"))
}

async fn request_refresh(
    client: &reqwest::Client,
    endpoint: &str,
    body: &Value,
) -> Result<RefreshedTokens, UsageError> {
    let response = client
        .post(endpoint)
        .json(body)
        .send()
        .await
        .map_err(|e| UsageError::from_transport("Token refresh failed", e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(UsageError::Unauthenticated(format!(
            "Token refresh rejected ({})",
            status
        )));
    }

    response
        .json()
        .await
        .map_err(|e| UsageError::ParseError(format!("Invalid token refresh response: {e}")))
}

/// Replace `path` with pretty-printed JSON via temp file + rename.
async fn write_json_atomic(path: PathBuf, root: &Value) -> std::io::Result<()> {
    let content = serde_json::to_vec_pretty(root)?;
    tokio::task::spawn_blocking(move || {
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut temp = tempfile::NamedTempFile::new_in(&parent)?;
        temp.write_all(&content)?;
        temp.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        temp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Decode the claims segment of a JWT without verifying it.
pub fn parse_jwt_payload(token: &str) -> Option<Value> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('=').as_bytes())
        .ok()?;
    serde_json::from_slice(&decoded).ok()
}

pub(crate) fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
