//! # Backend Session
//!
//! Bearer-token source for the backend client. The controlling app owns
//! sign-in; this module only holds the token and refreshes it shortly
//! before it expires.
//!
//! ## Refresh Outcomes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Session Token Refresh                            │
//! │                                                                         │
//! │  token within 5 min of expiry                                          │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  POST /api/v1/users/refresh-session-token { refreshToken }              │
//! │        │                                                                │
//! │        ├── 2xx, success + token ──────────► Refreshed (token replaced)  │
//! │        ├── 401/403 or success=false ──────► Rejected  (token cleared)   │
//! │        └── transport error, 5xx, or any ──► Retry     (stale token kept │
//! │            unexpected body                              for next call)  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

/// Margin before token expiration to trigger refresh (5 minutes)
const REFRESH_MARGIN_SECS: u64 = 300;

/// Lifetime assumed when the refresh response does not state one.
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 15 * 60;

/// Supplies the bearer token for backend calls.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Current access token, refreshed first if it is about to expire.
    async fn access_token(&self) -> SyncResult<String>;
}

/// A fixed token, or none at all.
#[derive(Debug, Clone, Default)]
pub struct StaticSessionProvider {
    token: Option<String>,
}

impl StaticSessionProvider {
    pub fn new(token: Option<String>) -> Self {
        StaticSessionProvider { token }
    }
}

#[async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn access_token(&self) -> SyncResult<String> {
        self.token
            .clone()
            .ok_or_else(|| SyncError::AuthFailed("no session token configured".into()))
    }
}

// =============================================================================
// Refreshing Session
// =============================================================================

/// Token pair held by a [`TokenSession`].
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub access_token: String,
    /// When the access token expires (local time)
    pub expires_at: Instant,
    pub refresh_token: String,
}

impl TokenInfo {
    pub fn new(access_token: String, refresh_token: String, lifetime: Duration) -> Self {
        TokenInfo {
            access_token,
            expires_at: Instant::now() + lifetime,
            refresh_token,
        }
    }

    /// Check if the token is expired or about to expire
    pub fn needs_refresh(&self) -> bool {
        Instant::now() + Duration::from_secs(REFRESH_MARGIN_SECS) >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining_secs(&self) -> u64 {
        self.expires_at
            .saturating_duration_since(Instant::now())
            .as_secs()
    }
}

/// Result of a refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new token was stored.
    Refreshed,
    /// The backend refused the refresh token. The session is cleared.
    Rejected,
    /// The attempt failed in a way that may succeed later. The stale token
    /// is kept.
    Retry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody {
    success: Option<bool>,
    token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// Session that refreshes its token against the backend.
#[derive(Debug, Clone)]
pub struct TokenSession {
    http: reqwest::Client,
    refresh_url: String,
    token: Arc<RwLock<Option<TokenInfo>>>,
}

impl TokenSession {
    pub fn new(backend_url: &str, timeout: Duration) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("session HTTP client: {e}")))?;

        Ok(TokenSession {
            http,
            refresh_url: format!(
                "{}/api/v1/users/refresh-session-token",
                backend_url.trim_end_matches('/')
            ),
            token: Arc::new(RwLock::new(None)),
        })
    }

    /// Installs a token obtained by the sign-in flow.
    pub async fn set_token(&self, token: TokenInfo) {
        *self.token.write().await = Some(token);
    }

    pub async fn clear(&self) {
        *self.token.write().await = None;
    }

    /// Get current token info (without triggering refresh)
    pub async fn current_token(&self) -> Option<TokenInfo> {
        self.token.read().await.clone()
    }

    /// Refreshes the token now, regardless of its expiry.
    pub async fn refresh(&self) -> RefreshOutcome {
        let mut guard = self.token.write().await;
        self.refresh_locked(&mut guard).await
    }

    async fn refresh_locked(&self, slot: &mut Option<TokenInfo>) -> RefreshOutcome {
        let Some(refresh_token) = slot.as_ref().map(|t| t.refresh_token.clone()) else {
            return RefreshOutcome::Rejected;
        };

        let resp = match self
            .http
            .post(&self.refresh_url)
            .json(&json!({ "refreshToken": refresh_token }))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "Session refresh failed to reach backend");
                return RefreshOutcome::Retry;
            }
        };

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            warn!(status = status.as_u16(), "Refresh token rejected, clearing session");
            *slot = None;
            return RefreshOutcome::Rejected;
        }
        if !status.is_success() {
            warn!(status = status.as_u16(), "Session refresh failed, keeping stale token");
            return RefreshOutcome::Retry;
        }

        let body: RefreshBody = match resp.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Unreadable refresh response, keeping stale token");
                return RefreshOutcome::Retry;
            }
        };

        match body {
            RefreshBody {
                success: Some(false),
                ..
            } => {
                warn!("Backend refused session refresh, clearing session");
                *slot = None;
                RefreshOutcome::Rejected
            }
            RefreshBody {
                token: Some(access_token),
                refresh_token: new_refresh,
                expires_in,
                ..
            } => {
                let lifetime =
                    Duration::from_secs(expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS));
                let info = TokenInfo::new(
                    access_token,
                    new_refresh.unwrap_or(refresh_token),
                    lifetime,
                );
                info!(expires_in_secs = info.remaining_secs(), "Session token refreshed");
                *slot = Some(info);
                RefreshOutcome::Refreshed
            }
            _ => {
                warn!("Refresh response without a token, keeping stale token");
                RefreshOutcome::Retry
            }
        }
    }
}

#[async_trait]
impl SessionProvider for TokenSession {
    async fn access_token(&self) -> SyncResult<String> {
        {
            let guard = self.token.read().await;
            if let Some(token) = guard.as_ref() {
                if !token.needs_refresh() {
                    debug!(remaining_secs = token.remaining_secs(), "Using cached token");
                    return Ok(token.access_token.clone());
                }
            }
        }

        let mut guard = self.token.write().await;

        // Double-check after acquiring write lock
        if let Some(token) = guard.as_ref() {
            if !token.needs_refresh() {
                return Ok(token.access_token.clone());
            }
        } else {
            return Err(SyncError::AuthFailed("not signed in".into()));
        }

        match self.refresh_locked(&mut guard).await {
            RefreshOutcome::Rejected => Err(SyncError::AuthFailed("session expired".into())),
            RefreshOutcome::Refreshed | RefreshOutcome::Retry => guard
                .as_ref()
                .map(|t| t.access_token.clone())
                .ok_or_else(|| SyncError::AuthFailed("session expired".into())),
        }
    }
}
