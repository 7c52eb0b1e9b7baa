//! `reqwest` implementation of the Cart API.

use std::sync::{Arc, PoisonError, RwLock};

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument};
use url::Url;

use basket_core::CartLineItem;

use super::{ApiError, CartApi, ReplaceCartRequest, ServerCart};
use crate::config::CartApiConfig;

/// Response bodies are truncated to this many characters in errors and logs.
const BODY_PREVIEW_CHARS: usize = 200;

/// Client for the Cart REST API.
///
/// Cheap to clone; clones share the HTTP connection pool and bearer token.
#[derive(Clone)]
pub struct HttpCartApi {
    inner: Arc<HttpCartApiInner>,
}

struct HttpCartApiInner {
    client: reqwest::Client,
    endpoint: Url,
    token: RwLock<Option<SecretString>>,
}

impl HttpCartApi {
    /// Create a new Cart API client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the endpoint
    /// URL cannot be derived from the base URL.
    pub fn new(config: &CartApiConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        let endpoint = config.base_url.join("cart")?;

        Ok(Self {
            inner: Arc::new(HttpCartApiInner {
                client,
                endpoint,
                token: RwLock::new(config.token.clone()),
            }),
        })
    }

    /// The `/cart` endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    /// Replace the bearer token sent with every request.
    pub fn set_bearer_token(&self, token: Option<SecretString>) {
        *self
            .inner
            .token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let token = self
            .inner
            .token
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match token.as_ref() {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    /// Send a request and decode a cart from the response.
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<ServerCart, ApiError> {
        let response = self
            .authorize(request)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();

        // Get response body as text first for better error diagnostics
        let response_text = response.text().await?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ApiError::Unauthorized);
        }

        if status == reqwest::StatusCode::CONFLICT {
            // The body is the cart the server kept, when it sent one
            let kept = serde_json::from_str::<ServerCart>(&response_text).ok();
            tracing::warn!(
                has_cart = kept.is_some(),
                "Cart API rejected the cart with a conflict"
            );
            return Err(ApiError::Conflict(kept));
        }

        if !status.is_success() {
            let body = preview(&response_text);
            tracing::error!(
                status = %status,
                body = %body,
                "Cart API returned non-success status"
            );
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&response_text).map_err(|e| {
            tracing::error!(
                error = %e,
                body = %preview(&response_text),
                "Failed to parse Cart API response"
            );
            ApiError::Parse(e)
        })
    }
}

impl CartApi for HttpCartApi {
    #[instrument(skip(self), fields(endpoint = %self.inner.endpoint))]
    async fn fetch_cart(&self) -> Result<ServerCart, ApiError> {
        let request = self.inner.client.get(self.inner.endpoint.clone());
        let cart = self.execute(request).await?;
        debug!(lines = cart.items.len(), "Fetched server cart");
        Ok(cart)
    }

    #[instrument(skip(self, items), fields(endpoint = %self.inner.endpoint, lines = items.len()))]
    async fn replace_cart(&self, items: &[CartLineItem]) -> Result<ServerCart, ApiError> {
        let request = self
            .inner
            .client
            .put(self.inner.endpoint.clone())
            .header("Idempotency-Key", uuid::Uuid::new_v4().to_string())
            .json(&ReplaceCartRequest { items });
        let cart = self.execute(request).await?;
        debug!(lines = cart.items.len(), "Replaced server cart");
        Ok(cart)
    }
}

fn preview(body: &str) -> String {
    body.chars().take(BODY_PREVIEW_CHARS).collect()
}
