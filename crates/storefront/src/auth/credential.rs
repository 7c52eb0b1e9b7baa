//! Auth status derived from a stored credential token.
//!
//! Tokens are JWT-shaped (`header.payload.signature`). Only the payload is
//! inspected: `sub` becomes the user ID and `exp` (seconds since the epoch)
//! decides expiry. Signature checks belong to the server; an invalid token
//! simply fails the first authenticated API call.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, instrument};

use super::{AuthStatus, AuthStatusProvider};

/// Claims read from a credential token payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenClaims {
    /// Subject (user ID).
    pub sub: String,
    /// Expiry, seconds since the Unix epoch.
    #[serde(default)]
    pub exp: Option<i64>,
}

impl TokenClaims {
    /// Whether the token is expired at `now`. Tokens without `exp` never expire.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.exp.is_some_and(|exp| exp <= now.timestamp())
    }
}

/// Decode the payload of a JWT-shaped token.
///
/// Returns `None` if the token is malformed.
#[must_use]
pub fn decode_claims(token: &str) -> Option<TokenClaims> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };

    // Some issuers pad their segments even though JWT forbids it
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// [`AuthStatusProvider`] fed by credential-token checks.
///
/// Starts in the loading state. Call [`begin_resolution`](Self::begin_resolution)
/// when a credential lookup starts and [`resolve`](Self::resolve) with the
/// stored token (or `None`) when it finishes.
#[derive(Debug, Clone)]
pub struct CredentialAuthProvider {
    sender: watch::Sender<AuthStatus>,
}

impl CredentialAuthProvider {
    /// New provider in the loading state.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(AuthStatus::loading());
        Self { sender }
    }

    /// Mark credentials as being resolved.
    pub fn begin_resolution(&self) {
        self.publish(AuthStatus::loading());
    }

    /// Resolve the status from the stored token, if any.
    ///
    /// Returns the published status.
    #[instrument(skip_all)]
    pub fn resolve(&self, token: Option<&str>) -> AuthStatus {
        self.resolve_at(token, Utc::now())
    }

    /// [`resolve`](Self::resolve) with an explicit clock.
    pub fn resolve_at(&self, token: Option<&str>, now: DateTime<Utc>) -> AuthStatus {
        let status = match token.map(decode_claims) {
            None => AuthStatus::anonymous(),
            Some(None) => {
                debug!("Credential token is malformed");
                AuthStatus::anonymous()
            }
            Some(Some(claims)) if claims.is_expired_at(now) => {
                debug!(user_id = %claims.sub, "Credential token is expired");
                AuthStatus::anonymous()
            }
            Some(Some(claims)) => AuthStatus::authenticated(claims.sub),
        };
        self.publish(status.clone());
        status
    }

    /// Publish a logged-out status.
    pub fn logout(&self) {
        self.publish(AuthStatus::anonymous());
    }

    fn publish(&self, status: AuthStatus) {
        self.sender.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            debug!(
                is_authenticated = status.is_authenticated,
                is_loading = status.is_loading,
                "Auth status changed"
            );
            *current = status;
            true
        });
    }
}

impl Default for CredentialAuthProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthStatusProvider for CredentialAuthProvider {
    fn subscribe(&self) -> watch::Receiver<AuthStatus> {
        self.sender.subscribe()
    }

    fn current(&self) -> AuthStatus {
        self.sender.borrow().clone()
    }
}
