//! Unified cart error handling with Sentry integration.
//!
//! [`CartError`] is returned by every [`crate::cart::CartStore`] operation.
//! Local validation errors are meant for the UI layer to display; merge
//! errors are meant for the [`crate::merger::CartMerger`] to decide retry
//! policy, and are captured to Sentry there.

use thiserror::Error;

use basket_core::{LineKey, QuantityError};

use crate::api::ApiError;
use crate::storage::StorageError;

/// Error type for cart store operations.
#[derive(Debug, Error)]
pub enum CartError {
    /// Quantity was below one. Use `remove_item` to drop a line.
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(#[from] QuantityError),

    /// No line with the given key.
    #[error("Item not found: {0}")]
    ItemNotFound(LineKey),

    /// The Cart API was unreachable or answered with a non-success status.
    #[error("Merge failed: {0}")]
    MergeNetworkFailure(#[source] ApiError),

    /// The server rejected the merged cart without returning a usable one.
    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    /// Durable storage could not be written.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl CartError {
    /// Whether a later retry of the same operation could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MergeNetworkFailure(_) | Self::MergeConflict(_) | Self::Storage(_)
        )
    }
}

/// Result type alias for `CartError`.
pub type Result<T> = std::result::Result<T, CartError>;

/// Capture an error to Sentry and log it with the event ID.
pub fn capture(err: &CartError, context: &str) {
    let event_id = sentry::capture_error(err);
    tracing::error!(
        error = %err,
        sentry_event_id = %event_id,
        "{context}"
    );
}

/// Set the Sentry user context from a user ID.
///
/// Call this after successful authentication to associate errors with users.
pub fn set_sentry_user(user_id: &impl ToString) {
    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry::User {
            id: Some(user_id.to_string()),
            ..Default::default()
        }));
    });
}

/// Clear the Sentry user context.
///
/// Call this on logout to stop associating errors with the user.
pub fn clear_sentry_user() {
    sentry::configure_scope(|scope| {
        scope.set_user(None);
    });
}

/// Add a breadcrumb for cart actions.
///
/// Breadcrumbs appear in Sentry error reports to show the trail of actions
/// leading up to an error.
///
/// # Example
///
/// ```rust,ignore
/// add_breadcrumb("cart", "Guest cart merged", Some(&[("lines", "3")]));
/// ```
pub fn add_breadcrumb(category: &str, message: &str, data: Option<&[(&str, &str)]>) {
    let mut breadcrumb = sentry::Breadcrumb {
        category: Some(category.to_string()),
        message: Some(message.to_string()),
        level: sentry::Level::Info,
        ..Default::default()
    };

    if let Some(pairs) = data {
        for (key, value) in pairs {
            breadcrumb.data.insert(
                (*key).to_string(),
                serde_json::Value::String((*value).to_string()),
            );
        }
    }

    sentry::add_breadcrumb(breadcrumb);
}
