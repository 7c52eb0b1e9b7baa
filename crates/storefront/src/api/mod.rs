//! Cart REST API.
//!
//! # Endpoints
//!
//! - `GET {base}/cart` - the authenticated shopper's server cart (may be empty)
//! - `PUT {base}/cart` - replace the server cart with `{"items": [...]}`;
//!   the response body is the authoritative cart after server-side checks
//!   such as stock clamping
//!
//! The server is the source of truth for authenticated carts. A `409 Conflict`
//! may carry the cart the server settled on instead of the one requested.
//!
//! [`CartApi`] is the seam the store depends on; [`HttpCartApi`] is the
//! `reqwest` implementation.

mod client;

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use basket_core::{Cart, CartLineItem, UserId};

pub use client::HttpCartApi;

/// Errors that can occur when calling the Cart API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP request failed (connection, timeout, TLS).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status other than the ones mapped below.
    #[error("HTTP {status}: {body}")]
    Status {
        /// Response status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },

    /// The endpoint URL could not be built.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Credentials missing, expired, or rejected.
    #[error("Unauthorized")]
    Unauthorized,

    /// The server rejected the request, optionally returning the cart it kept.
    #[error("Conflict")]
    Conflict(Option<ServerCart>),
}

/// A cart as returned by the Cart API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCart {
    /// Account the cart belongs to.
    pub owner_id: UserId,
    /// Server lines, possibly with stock limits.
    #[serde(default)]
    pub items: Vec<ServerCartLine>,
}

impl ServerCart {
    /// Convert to a local authenticated cart.
    #[must_use]
    pub fn into_cart(self) -> Cart {
        Cart::authenticated(self.owner_id, self.items.into_iter().map(|line| line.item))
    }
}

/// A server cart line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCartLine {
    #[serde(flatten)]
    pub item: CartLineItem,
    /// Units the shopper may hold, when the server declares a limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_stock: Option<u32>,
}

/// Request body for `PUT /cart`.
#[derive(Debug, Serialize)]
pub struct ReplaceCartRequest<'a> {
    pub items: &'a [CartLineItem],
}

/// Server-side cart operations used by the merge.
///
/// # Implementation Notes
///
/// - Implementations must be thread-safe (`Send + Sync`)
/// - Both calls act on behalf of the currently authenticated shopper
pub trait CartApi: Send + Sync {
    /// Fetch the shopper's server cart.
    fn fetch_cart(&self) -> impl Future<Output = Result<ServerCart, ApiError>> + Send;

    /// Replace the shopper's server cart and return the authoritative result.
    fn replace_cart(
        &self,
        items: &[CartLineItem],
    ) -> impl Future<Output = Result<ServerCart, ApiError>> + Send;
}
