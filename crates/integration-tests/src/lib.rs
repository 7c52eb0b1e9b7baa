//! Integration tests for the basket cart merge.
//!
//! [`MockCartServer`] is an in-process Cart REST API on an ephemeral port.
//! Tests point a [`basket_storefront::state::Session`] (or a bare
//! [`basket_storefront::cart::CartStore`]) at it and drive logins through
//! the real HTTP client, file storage and merger.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p basket-integration-tests
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use basket_core::{CartLineItem, CurrencyCode, Price, ProductId, Quantity, UserId, VariantId};
use basket_storefront::api::{ServerCart, ServerCartLine};
use basket_storefront::config::{BasketConfig, CartApiConfig, StorageConfig};

/// How the next `PUT /cart` answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutBehavior {
    /// Store the lines (clamped to stock) and echo them back.
    Accept,
    /// `409` with the cart the server already holds.
    ConflictWithCart,
    /// `409` with no body.
    ConflictEmpty,
}

#[derive(Debug)]
struct MockState {
    owner_id: String,
    lines: Vec<ServerCartLine>,
    stock: HashMap<String, u32>,
    required_token: Option<String>,
    failures_left: usize,
    next_put: PutBehavior,
    fetches: usize,
    puts: usize,
    idempotency_keys: Vec<String>,
}

impl MockState {
    fn server_cart(&self) -> ServerCart {
        ServerCart {
            owner_id: UserId::new(self.owner_id.clone()),
            items: self.lines.clone(),
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.required_token else {
            return true;
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected)
    }

    fn take_failure(&mut self) -> bool {
        if self.failures_left == 0 {
            return false;
        }
        self.failures_left -= 1;
        true
    }
}

type Shared = Arc<Mutex<MockState>>;

fn lock(state: &Shared) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Deserialize)]
struct ReplaceBody {
    items: Vec<CartLineItem>,
}

async fn fetch_cart(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let mut state = lock(&state);
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.fetches += 1;
    if state.take_failure() {
        return (StatusCode::SERVICE_UNAVAILABLE, "try again later").into_response();
    }
    Json(state.server_cart()).into_response()
}

async fn replace_cart(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<ReplaceBody>,
) -> Response {
    let mut state = lock(&state);
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.puts += 1;
    if let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|value| value.to_str().ok())
    {
        state.idempotency_keys.push(key.to_string());
    }
    if state.take_failure() {
        return (StatusCode::SERVICE_UNAVAILABLE, "try again later").into_response();
    }

    match std::mem::replace(&mut state.next_put, PutBehavior::Accept) {
        PutBehavior::Accept => {}
        PutBehavior::ConflictWithCart => {
            return (StatusCode::CONFLICT, Json(state.server_cart())).into_response();
        }
        PutBehavior::ConflictEmpty => return StatusCode::CONFLICT.into_response(),
    }

    let lines = body
        .items
        .into_iter()
        .map(|mut item| {
            let max_stock = state.stock.get(&item.key().to_string()).copied();
            if let Some(max) = max_stock {
                item.quantity = item.quantity.clamp_to(max);
            }
            ServerCartLine { item, max_stock }
        })
        .collect();
    state.lines = lines;
    Json(state.server_cart()).into_response()
}

/// In-process Cart REST API serving `GET` and `PUT` on `/api/cart`.
///
/// The server task is aborted on drop.
pub struct MockCartServer {
    addr: SocketAddr,
    state: Shared,
    task: JoinHandle<()>,
}

impl MockCartServer {
    /// Start a server holding an empty cart for `owner_id`.
    ///
    /// # Panics
    ///
    /// Panics if no local port can be bound.
    pub async fn start(owner_id: &str) -> Self {
        let state = Arc::new(Mutex::new(MockState {
            owner_id: owner_id.to_string(),
            lines: Vec::new(),
            stock: HashMap::new(),
            required_token: None,
            failures_left: 0,
            next_put: PutBehavior::Accept,
            fetches: 0,
            puts: 0,
            idempotency_keys: Vec::new(),
        }));

        let router = Router::new()
            .route("/api/cart", get(fetch_cart).put(replace_cart))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock cart server");
        let addr = listener.local_addr().expect("mock cart server address");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Self { addr, state, task }
    }

    /// Base URL to configure the client with.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}/api/", self.addr)
    }

    /// Replace the server cart. Lines with `max_stock` also set the stock
    /// limit used when clamping later `PUT`s.
    pub fn seed(&self, lines: Vec<ServerCartLine>) {
        let mut state = lock(&self.state);
        for line in &lines {
            if let Some(max) = line.max_stock {
                state.stock.insert(line.item.key().to_string(), max);
            }
        }
        state.lines = lines;
    }

    /// Switch the account the server answers for, starting it with `lines`.
    pub fn switch_owner(&self, owner_id: &str, lines: Vec<ServerCartLine>) {
        {
            let mut state = lock(&self.state);
            owner_id.clone_into(&mut state.owner_id);
            state.stock.clear();
        }
        self.seed(lines);
    }

    /// Current server lines.
    #[must_use]
    pub fn lines(&self) -> Vec<ServerCartLine> {
        lock(&self.state).lines.clone()
    }

    /// Reject requests without `Authorization: Bearer <token>`.
    pub fn require_token(&self, token: &str) {
        lock(&self.state).required_token = Some(token.to_string());
    }

    /// Answer the next `n` requests with `503`.
    pub fn fail_next(&self, n: usize) {
        lock(&self.state).failures_left = n;
    }

    /// Set how the next `PUT` answers.
    pub fn next_put(&self, behavior: PutBehavior) {
        lock(&self.state).next_put = behavior;
    }

    /// Number of `GET /cart` requests that passed the auth check.
    #[must_use]
    pub fn fetches(&self) -> usize {
        lock(&self.state).fetches
    }

    /// Number of `PUT /cart` requests that passed the auth check.
    #[must_use]
    pub fn puts(&self) -> usize {
        lock(&self.state).puts
    }

    /// `Idempotency-Key` headers received, in order.
    #[must_use]
    pub fn idempotency_keys(&self) -> Vec<String> {
        lock(&self.state).idempotency_keys.clone()
    }
}

impl Drop for MockCartServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Configuration pointing at `base_url` with storage under `dir`.
///
/// # Panics
///
/// Panics if `base_url` is not a valid URL.
#[must_use]
pub fn config(base_url: &str, dir: &Path) -> BasketConfig {
    let mut api = CartApiConfig::new(base_url).expect("valid mock base URL");
    api.timeout = Duration::from_secs(5);
    BasketConfig {
        api,
        storage: StorageConfig {
            dir: dir.to_path_buf(),
            key: "cart-storage".to_string(),
        },
        sentry_dsn: None,
        sentry_environment: None,
    }
}

/// An unsigned JWT-shaped credential token for `sub`.
#[must_use]
pub fn token_for(sub: &str) -> SecretString {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::json!({ "sub": sub }).to_string());
    SecretString::from(format!("{header}.{payload}.sig"))
}

/// A USD line for `product` at `cents` each.
///
/// # Panics
///
/// Panics if `quantity` is zero.
#[must_use]
pub fn line(product: &str, variant: Option<&str>, quantity: u32, cents: i64) -> CartLineItem {
    CartLineItem {
        product_id: ProductId::new(product),
        variant_id: variant.map(VariantId::new),
        quantity: Quantity::new(quantity).expect("non-zero quantity"),
        unit_price: Price::from_cents(cents, CurrencyCode::USD),
        added_at: DateTime::<Utc>::UNIX_EPOCH,
    }
}

/// A server line with an optional stock limit.
#[must_use]
pub fn server_line(product: &str, quantity: u32, max_stock: Option<u32>) -> ServerCartLine {
    ServerCartLine {
        item: line(product, None, quantity, 1_000),
        max_stock,
    }
}

/// Line keys and quantities, in cart order.
#[must_use]
pub fn quantities(items: &[CartLineItem]) -> Vec<(String, u32)> {
    items
        .iter()
        .map(|item| (item.key().to_string(), item.quantity.get()))
        .collect()
}
