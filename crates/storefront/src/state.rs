//! Session state shared across the storefront.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::{ApiError, HttpCartApi};
use crate::auth::{AuthStatus, AuthStatusProvider, CredentialAuthProvider};
use crate::cart::CartStore;
use crate::config::BasketConfig;
use crate::merger::CartMerger;
use crate::storage::FileStorage;

/// Cart store over the configured file storage and HTTP Cart API.
pub type SessionCartStore = CartStore<FileStorage, HttpCartApi>;

/// Error creating a [`Session`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("cart API client: {0}")]
    Api(#[from] ApiError),
}

/// Everything one shopper session needs: the cart store, the auth status
/// provider and the merger wired between them.
///
/// This struct is cheaply cloneable via `Arc`.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: BasketConfig,
    api: HttpCartApi,
    store: SessionCartStore,
    auth: CredentialAuthProvider,
    merger: Arc<CartMerger<SessionCartStore>>,
}

impl Session {
    /// Create a new session and load the persisted cart.
    ///
    /// # Errors
    ///
    /// Returns an error if the Cart API client cannot be built.
    pub fn new(config: BasketConfig) -> Result<Self, SessionError> {
        let api = HttpCartApi::new(&config.api)?;
        let storage = FileStorage::new(config.storage.dir.clone());
        let store = CartStore::open(storage, config.storage.key.clone(), api.clone());
        let auth = CredentialAuthProvider::new();
        let merger = Arc::new(CartMerger::new(store.clone()));

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                api,
                store,
                auth,
                merger,
            }),
        })
    }

    /// Get a reference to the basket configuration.
    #[must_use]
    pub fn config(&self) -> &BasketConfig {
        &self.inner.config
    }

    /// Get a reference to the cart store.
    #[must_use]
    pub fn store(&self) -> &SessionCartStore {
        &self.inner.store
    }

    /// Get a reference to the auth status provider.
    #[must_use]
    pub fn auth(&self) -> &CredentialAuthProvider {
        &self.inner.auth
    }

    /// Get a reference to the merge controller.
    #[must_use]
    pub fn merger(&self) -> &Arc<CartMerger<SessionCartStore>> {
        &self.inner.merger
    }

    /// Start the merger on the tokio runtime, following this session's auth
    /// status until the session is dropped.
    #[must_use = "dropping the handle detaches the merger task"]
    pub fn spawn_merger(&self) -> JoinHandle<()> {
        let statuses = self.inner.auth.subscribe();
        tokio::spawn(Arc::clone(&self.inner.merger).run(statuses))
    }

    /// Log in with a credential token.
    ///
    /// The token is installed on the API client before the status is
    /// published, so the merge it triggers is authorized.
    pub fn login(&self, token: SecretString) -> AuthStatus {
        self.inner.auth.begin_resolution();
        self.inner.api.set_bearer_token(Some(token.clone()));

        let status = self.inner.auth.resolve(Some(token.expose_secret()));
        if status.is_logged_in() {
            info!("Shopper logged in");
        } else {
            self.inner.api.set_bearer_token(None);
        }
        status
    }

    /// Log out and drop the bearer token.
    pub fn logout(&self) {
        self.inner.api.set_bearer_token(None);
        self.inner.auth.logout();
        info!("Shopper logged out");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use basket_core::{CurrencyCode, Price, ProductId, UserId};

    use super::*;
    use crate::config::{CartApiConfig, StorageConfig};
    use crate::merger::MergerState;

    fn config(dir: &std::path::Path) -> BasketConfig {
        BasketConfig {
            api: CartApiConfig::new("http://127.0.0.1:9/api").unwrap(),
            storage: StorageConfig {
                dir: dir.to_path_buf(),
                key: "cart-storage".to_string(),
            },
            sentry_dsn: None,
            sentry_environment: None,
        }
    }

    fn token(sub: &str) -> SecretString {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let body = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"{sub}"}}"#));
        SecretString::from(format!("{header}.{body}.sig"))
    }

    #[test]
    fn test_new_session_starts_loading_with_guest_cart() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(config(dir.path())).unwrap();

        assert!(session.auth().current().is_loading);
        assert!(!session.store().snapshot().is_authenticated());
        assert_eq!(session.merger().state(), MergerState::Idle);
        assert_eq!(
            session.store().api().endpoint().as_str(),
            "http://127.0.0.1:9/api/cart"
        );
    }

    #[test]
    fn test_login_and_logout_publish_status() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(config(dir.path())).unwrap();
        let mut statuses = session.auth().subscribe();

        let status = session.login(token("user-7"));
        assert!(status.is_logged_in());
        assert_eq!(status.user_id, Some(UserId::new("user-7")));
        assert!(statuses.has_changed().unwrap());
        assert_eq!(*statuses.borrow_and_update(), status);

        session.logout();
        assert!(statuses.borrow_and_update().is_logged_out());
    }

    #[test]
    fn test_login_with_malformed_token_stays_anonymous() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(config(dir.path())).unwrap();

        let status = session.login(SecretString::from("not-a-token"));
        assert!(status.is_logged_out());
    }

    #[test]
    fn test_cart_survives_new_session() {
        let dir = tempfile::tempdir().unwrap();
        {
            let session = Session::new(config(dir.path())).unwrap();
            session
                .store()
                .add_item(
                    ProductId::new("A"),
                    None,
                    2,
                    Price::from_cents(1_000, CurrencyCode::USD),
                )
                .unwrap();
        }

        let session = Session::new(config(dir.path())).unwrap();
        assert_eq!(session.store().snapshot().total_quantity(), 2);
    }
}
