//! Storefront cart configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `BASKET_API_BASE_URL` - Base URL of the Cart REST API (e.g., `https://shop.example/api/`)
//!
//! ## Optional
//! - `BASKET_API_TOKEN` - Bearer token used until the shopper logs in
//! - `BASKET_API_TIMEOUT_SECS` - Request timeout in seconds (default: 10)
//! - `BASKET_STORAGE_DIR` - Directory for the persisted cart (default: .basket)
//! - `BASKET_STORAGE_KEY` - Storage name of the persisted cart (default: cart-storage)
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment name

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;
use url::Url;

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_STORAGE_DIR: &str = ".basket";
const DEFAULT_STORAGE_KEY: &str = "cart-storage";

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct BasketConfig {
    /// Cart REST API settings
    pub api: CartApiConfig,
    /// Durable cart storage settings
    pub storage: StorageConfig,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment name
    pub sentry_environment: Option<String>,
}

/// Cart REST API configuration.
///
/// Implements `Debug` manually to redact the token.
#[derive(Clone)]
pub struct CartApiConfig {
    /// Base URL, always ending in `/` so relative joins stay under it
    pub base_url: Url,
    /// Initial bearer token
    pub token: Option<SecretString>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl std::fmt::Debug for CartApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CartApiConfig")
            .field("base_url", &self.base_url.as_str())
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CartApiConfig {
    /// Build an API configuration with the default timeout and no token.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnvVar` if `base_url` does not parse.
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: parse_base_url("BASKET_API_BASE_URL", base_url)?,
            token: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        })
    }
}

/// Durable storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding persisted state
    pub dir: PathBuf,
    /// Storage name the cart is saved under
    pub key: String,
}

impl BasketConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);

        let base_url = env.required("BASKET_API_BASE_URL")?;
        let timeout_secs = env
            .optional("BASKET_API_TIMEOUT_SECS")
            .map(|value| value.parse::<u64>())
            .transpose()
            .map_err(|e| {
                ConfigError::InvalidEnvVar("BASKET_API_TIMEOUT_SECS".to_string(), e.to_string())
            })?
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Ok(Self {
            api: CartApiConfig {
                base_url: parse_base_url("BASKET_API_BASE_URL", &base_url)?,
                token: env.optional("BASKET_API_TOKEN").map(SecretString::from),
                timeout: Duration::from_secs(timeout_secs),
            },
            storage: StorageConfig {
                dir: PathBuf::from(env.or_default("BASKET_STORAGE_DIR", DEFAULT_STORAGE_DIR)),
                key: env.or_default("BASKET_STORAGE_KEY", DEFAULT_STORAGE_KEY),
            },
            sentry_dsn: env.optional("SENTRY_DSN"),
            sentry_environment: env.optional("SENTRY_ENVIRONMENT"),
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Get a required variable.
    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    /// Get an optional variable, treating empty values as unset.
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    /// Get a variable with a default value.
    fn or_default(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }
}

/// Parse a base URL and make sure it ends in `/`.
fn parse_base_url(var_name: &str, value: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(value)
        .map_err(|e| ConfigError::InvalidEnvVar(var_name.to_string(), e.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidEnvVar(
            var_name.to_string(),
            "must be an absolute http(s) URL".to_string(),
        ));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<BasketConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        BasketConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_missing_base_url() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "BASKET_API_BASE_URL"));
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("BASKET_API_BASE_URL", "https://shop.example/api")]).unwrap();

        assert_eq!(config.api.base_url.as_str(), "https://shop.example/api/");
        assert!(config.api.token.is_none());
        assert_eq!(config.api.timeout, Duration::from_secs(10));
        assert_eq!(config.storage.dir, PathBuf::from(".basket"));
        assert_eq!(config.storage.key, "cart-storage");
        assert!(config.sentry_dsn.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("BASKET_API_BASE_URL", "http://127.0.0.1:8080/"),
            ("BASKET_API_TOKEN", "tok"),
            ("BASKET_API_TIMEOUT_SECS", "3"),
            ("BASKET_STORAGE_DIR", "/tmp/carts"),
            ("BASKET_STORAGE_KEY", "my-cart"),
        ])
        .unwrap();

        assert_eq!(config.api.token.unwrap().expose_secret(), "tok");
        assert_eq!(config.api.timeout, Duration::from_secs(3));
        assert_eq!(config.storage.key, "my-cart");
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            load(&[("BASKET_API_BASE_URL", "not a url")]),
            Err(ConfigError::InvalidEnvVar(_, _))
        ));
        assert!(matches!(
            load(&[
                ("BASKET_API_BASE_URL", "https://shop.example"),
                ("BASKET_API_TIMEOUT_SECS", "soon"),
            ]),
            Err(ConfigError::InvalidEnvVar(_, _))
        ));
    }

    #[test]
    fn test_api_config_new_uses_default_timeout() {
        let api = CartApiConfig::new("https://shop.example").unwrap();
        let loaded = load(&[("BASKET_API_BASE_URL", "https://shop.example")]).unwrap();

        assert_eq!(api.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(api.timeout, loaded.api.timeout);
        assert!(api.token.is_none());
    }

    #[test]
    fn test_api_config_debug_redacts_token() {
        let mut api = CartApiConfig::new("https://shop.example").unwrap();
        api.token = Some(SecretString::from("super_secret_bearer"));

        let debug_output = format!("{api:?}");
        assert!(debug_output.contains("shop.example"));
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_bearer"));
    }
}
