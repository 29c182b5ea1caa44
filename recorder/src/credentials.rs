//! Credential manager – owns the cloud access token lifecycle.
//!
//! At most one token is cached, persisted as `{access_token, expires_at}`.
//! The cached expiry is set short of the provider's real lifetime so an
//! upload never starts on a token that dies mid-request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use memo_common::store::{load_json, save_json, KeyValueStore, TOKEN_KEY};

/// The only scope ever requested: per-file write access.
pub const DRIVE_FILE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

/// Subtracted from the provider's lifetime before caching.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("authentication failed: {0}")]
    Failed(String),

    #[error("cloud storage is not configured")]
    NotConfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// No user interaction; fails when that is not enough.
    Silent,
    /// Interact only if needed.
    Interactive,
    /// Force a fresh consent.
    Consent,
}

/// Why authentication was requested; folder selection gets one consent retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthContext {
    Upload,
    FolderSelection,
}

#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    /// Lifetime reported by the provider.
    pub expires_in: Duration,
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn request_token(&self, prompt: PromptMode) -> Result<TokenGrant, AuthError>;
}

/// Persisted form of the cached token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub access_token: String,
    /// Epoch milliseconds.
    pub expires_at: i64,
}

impl StoredCredential {
    /// Valid strictly before `expires_at`.
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialState {
    NoToken,
    Pending,
    Valid { expires_at: i64 },
    Expired,
}

/// How long a grant is trusted locally.
fn cache_lifetime(expires_in: Duration) -> Duration {
    if expires_in > EXPIRY_MARGIN * 2 {
        expires_in - EXPIRY_MARGIN
    } else {
        expires_in / 2
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct CredentialManager {
    provider: Option<Arc<dyn TokenProvider>>,
    store: Arc<dyn KeyValueStore>,
    token: Option<StoredCredential>,
    pending: bool,
}

impl CredentialManager {
    /// Load any persisted token.  `provider` is `None` when cloud storage
    /// is not configured; every authentication then fails.
    pub fn new(provider: Option<Arc<dyn TokenProvider>>, store: Arc<dyn KeyValueStore>) -> Self {
        let token = match load_json::<StoredCredential>(store.as_ref(), TOKEN_KEY) {
            Ok(token) => token,
            Err(e) => {
                warn!("Cannot read cached credential: {e}");
                None
            }
        };
        if let Some(t) = &token {
            debug!("Loaded cached credential (expires_at={})", t.expires_at);
        }
        Self {
            provider,
            store,
            token,
            pending: false,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.provider.is_some()
    }

    pub fn state(&self) -> CredentialState {
        if self.pending {
            return CredentialState::Pending;
        }
        match &self.token {
            None => CredentialState::NoToken,
            Some(t) if t.is_valid_at(now_ms()) => CredentialState::Valid {
                expires_at: t.expires_at,
            },
            Some(_) => CredentialState::Expired,
        }
    }

    /// Whether the persisted token is still usable.  Never mutates.
    pub fn check_validity(&self) -> bool {
        self.check_validity_at(now_ms())
    }

    pub fn check_validity_at(&self, now_ms: i64) -> bool {
        let persisted = match load_json::<StoredCredential>(self.store.as_ref(), TOKEN_KEY) {
            Ok(persisted) => persisted,
            Err(e) => {
                debug!("Cannot read cached credential, using in-memory copy: {e}");
                self.token.clone()
            }
        };
        persisted.map(|t| t.is_valid_at(now_ms)).unwrap_or(false)
    }

    /// The cached token, if it is still valid.
    pub fn access_token(&self) -> Option<String> {
        self.token
            .as_ref()
            .filter(|t| t.is_valid_at(now_ms()))
            .map(|t| t.access_token.clone())
    }

    /// Obtain a valid token, reusing the cached one when possible.
    pub async fn authenticate(&mut self, prompt: PromptMode, context: AuthContext) -> Result<String, AuthError> {
        if let Some(token) = self.access_token() {
            debug!("Reusing cached credential");
            return Ok(token);
        }
        let provider = self.provider.clone().ok_or(AuthError::NotConfigured)?;

        let result = {
            let _pending = PendingFlag::raise(&mut self.pending);
            let mut result = provider.request_token(prompt).await;
            if let Err(e) = &result {
                if context == AuthContext::FolderSelection && prompt != PromptMode::Consent {
                    warn!("Token request failed ({e}) – retrying with consent prompt");
                    result = provider.request_token(PromptMode::Consent).await;
                }
            }
            result
        };

        let grant = result?;
        Ok(self.cache(grant))
    }

    fn cache(&mut self, grant: TokenGrant) -> String {
        let lifetime = cache_lifetime(grant.expires_in);
        let credential = StoredCredential {
            access_token: grant.access_token,
            expires_at: now_ms() + lifetime.as_millis() as i64,
        };
        if let Err(e) = save_json(self.store.as_ref(), TOKEN_KEY, &credential) {
            warn!("Cannot persist credential: {e}");
        }
        info!("Credential cached for {}s", lifetime.as_secs());
        let token = credential.access_token.clone();
        self.token = Some(credential);
        token
    }

    /// Purge the cached token from memory and storage.
    pub fn invalidate(&mut self) {
        if let Err(e) = self.store.remove(TOKEN_KEY) {
            warn!("Cannot purge cached credential: {e}");
        }
        if self.token.take().is_some() {
            info!("Credential invalidated");
        }
    }
}

/// Holds `pending` up for the lifetime of a token request, including one
/// that is dropped before it completes.
struct PendingFlag<'a>(&'a mut bool);

impl<'a> PendingFlag<'a> {
    fn raise(flag: &'a mut bool) -> Self {
        *flag = true;
        Self(flag)
    }
}

impl Drop for PendingFlag<'_> {
    fn drop(&mut self) {
        *self.0 = false;
    }
}
