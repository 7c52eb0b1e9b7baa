//! Tracing and Sentry setup for processes embedding the cart.

use sentry::integrations::tracing as sentry_tracing;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::BasketConfig;

/// Filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "basket_storefront=info";

/// Initialize Sentry error tracking and return guard that must be kept alive.
#[must_use]
pub fn init_sentry(config: &BasketConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_ref()?;

    let guard = sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: config
                .sentry_environment
                .clone()
                .map(std::borrow::Cow::Owned),
            attach_stacktrace: true,
            ..Default::default()
        },
    ));

    tracing::info!("Sentry initialized");
    Some(guard)
}

/// Filter tracing events to Sentry event types.
#[must_use]
pub fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN => sentry_tracing::EventFilter::Event,
        tracing::Level::INFO | tracing::Level::DEBUG => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    }
}

/// Install Sentry and the global tracing subscriber.
///
/// Sentry is initialized first so the tracing layer reports to it. If a
/// global subscriber is already installed (as in tests), the existing one is
/// kept. Keep the returned guard alive for the life of the process.
#[must_use]
pub fn init(config: &BasketConfig) -> Option<sentry::ClientInitGuard> {
    let guard = init_sentry(config);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already installed");
    }

    guard
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{CartApiConfig, StorageConfig};

    fn filter_for(level: tracing::Level) -> sentry_tracing::EventFilter {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let span = match level {
                tracing::Level::ERROR => tracing::error_span!("cart"),
                tracing::Level::WARN => tracing::warn_span!("cart"),
                tracing::Level::INFO => tracing::info_span!("cart"),
                tracing::Level::DEBUG => tracing::debug_span!("cart"),
                _ => tracing::trace_span!("cart"),
            };
            sentry_event_filter(span.metadata().unwrap())
        })
    }

    #[test]
    fn test_event_filter_levels() {
        use sentry_tracing::EventFilter;

        assert!(filter_for(tracing::Level::ERROR).bits() == EventFilter::Event.bits());
        assert!(filter_for(tracing::Level::WARN).bits() == EventFilter::Event.bits());
        assert!(filter_for(tracing::Level::INFO).bits() == EventFilter::Breadcrumb.bits());
        assert!(filter_for(tracing::Level::DEBUG).bits() == EventFilter::Breadcrumb.bits());
        assert!(filter_for(tracing::Level::TRACE).bits() == EventFilter::Ignore.bits());
    }

    #[test]
    fn test_init_without_dsn_has_no_guard() {
        let config = BasketConfig {
            api: CartApiConfig::new("https://shop.example").unwrap(),
            storage: StorageConfig {
                dir: ".basket".into(),
                key: "cart-storage".to_string(),
            },
            sentry_dsn: None,
            sentry_environment: None,
        };

        assert!(init(&config).is_none());
        // A second install is tolerated
        assert!(init(&config).is_none());
    }
}
