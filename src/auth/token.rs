//! OAuth2 token values and the on-disk token cache.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Tokens within this margin of expiry are refreshed proactively.
pub fn refresh_margin() -> Duration {
    Duration::seconds(300)
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// OAuth2 token with the metadata needed for persistence and expiry checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Token {
    /// Short-lived access token presented to the service.
    pub access_token: String,
    /// Long-lived refresh token, empty when the flow granted none.
    #[serde(default)]
    pub refresh_token: String,
    /// Absolute expiry time of the access token.
    pub expires_at: DateTime<Utc>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
}

impl OAuth2Token {
    /// Whether the token is expired or will expire within `margin`.
    pub fn is_expired(&self, margin: Duration) -> bool {
        Utc::now() >= self.expires_at - margin
    }
}

/// Observable position in the credential lifecycle, for logs and the
/// status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    /// No token cached; an interactive step is needed.
    NoToken,
    /// Token valid and not near expiry.
    Valid,
    /// Token valid but within the refresh margin.
    Expiring,
    /// Token past expiry; only a refresh (or re-auth) can revive it.
    RevokedOrExpired,
}

impl CredentialState {
    /// Classifies a cached token.
    pub fn of(token: Option<&OAuth2Token>) -> Self {
        match token {
            None => Self::NoToken,
            Some(t) if t.is_expired(Duration::zero()) => Self::RevokedOrExpired,
            Some(t) if t.is_expired(refresh_margin()) => Self::Expiring,
            Some(_) => Self::Valid,
        }
    }
}

/// File-backed token cache with restrictive permissions.
///
/// A cache that fails to refresh is renamed aside (`<file>.invalid`) rather
/// than deleted, so a user can inspect what was revoked.
#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    /// Creates a cache at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The cache file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the cached token, if present and well-formed.
    pub fn load(&self) -> Option<OAuth2Token> {
        let bytes = std::fs::read(&self.path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(token) => {
                debug!(path = %self.path.display(), "loaded cached token");
                Some(token)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring malformed token cache");
                None
            }
        }
    }

    /// Persists a token with owner-only permissions.
    pub fn save(&self, token: &OAuth2Token) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(token)
            .map_err(std::io::Error::other)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "saved token");
        Ok(())
    }

    /// Moves a revoked cache aside so the next run reports a clean
    /// authentication-required condition instead of retrying a dead token.
    pub fn invalidate(&self) {
        if !self.path.exists() {
            return;
        }
        let invalid = self.path.with_extension("invalid");
        let _ = std::fs::remove_file(&invalid);
        if let Err(e) = std::fs::rename(&self.path, &invalid) {
            warn!(path = %self.path.display(), error = %e, "failed to set aside invalid token");
        }
    }
}

/// Suggested wait before the Nth retry after a revoked-token condition.
///
/// Capped exponential: 60s doubling per attempt, capped at one hour. Used by
/// the status-icon collaborator to pace re-auth prompts.
pub fn auth_retry_backoff(attempt: u32) -> std::time::Duration {
    const BASE_SECS: u64 = 60;
    const CAP_SECS: u64 = 3600;
    let secs = BASE_SECS.saturating_mul(1u64 << attempt.min(10));
    std::time::Duration::from_secs(secs.min(CAP_SECS))
}
