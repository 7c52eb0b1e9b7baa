//! Authentication status signal.
//!
//! The cart core never authenticates anyone. It only reads an [`AuthStatus`]
//! published by an [`AuthStatusProvider`] and reacts to changes.
//!
//! Providers must keep `is_loading` true only while credentials are being
//! resolved. Consumers ignore `is_authenticated` until `is_loading` is false.

mod credential;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use basket_core::UserId;

pub use credential::{CredentialAuthProvider, TokenClaims, decode_claims};

/// Snapshot of the shopper's authentication state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStatus {
    pub is_authenticated: bool,
    pub is_loading: bool,
    pub user_id: Option<UserId>,
}

impl AuthStatus {
    /// Credentials are still being resolved.
    #[must_use]
    pub const fn loading() -> Self {
        Self {
            is_authenticated: false,
            is_loading: true,
            user_id: None,
        }
    }

    /// Resolved, not logged in.
    #[must_use]
    pub const fn anonymous() -> Self {
        Self {
            is_authenticated: false,
            is_loading: false,
            user_id: None,
        }
    }

    /// Resolved, logged in as `user_id`.
    #[must_use]
    pub fn authenticated(user_id: impl Into<UserId>) -> Self {
        Self {
            is_authenticated: true,
            is_loading: false,
            user_id: Some(user_id.into()),
        }
    }

    /// Resolved and logged in.
    #[must_use]
    pub const fn is_logged_in(&self) -> bool {
        !self.is_loading && self.is_authenticated
    }

    /// Resolved and logged out.
    #[must_use]
    pub const fn is_logged_out(&self) -> bool {
        !self.is_loading && !self.is_authenticated
    }
}

impl Default for AuthStatus {
    fn default() -> Self {
        Self::loading()
    }
}

/// Source of [`AuthStatus`] updates.
pub trait AuthStatusProvider: Send + Sync {
    /// Receiver that observes every status change.
    fn subscribe(&self) -> watch::Receiver<AuthStatus>;

    /// The latest status.
    fn current(&self) -> AuthStatus {
        self.subscribe().borrow().clone()
    }
}
