//! The persisted, single-writer cart store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use basket_core::{Cart, CartLineItem, LineKey, Price, ProductId, Quantity, UserId, VariantId};

use super::merge::reconcile;
use crate::api::{ApiError, CartApi};
use crate::error::{CartError, Result, add_breadcrumb};
use crate::merger::GuestCartMerge;
use crate::storage::{CartStorage, read_cart, write_cart};

/// Result of [`CartStore::merge_guest_cart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The cart was already authenticated; nothing was sent.
    AlreadyMerged,
    /// The server accepted the merged cart.
    Merged {
        /// Lines in the authoritative cart.
        lines: usize,
    },
    /// The server answered with a conflict and the cart it kept instead.
    Conflict {
        /// Lines in the authoritative cart.
        lines: usize,
    },
    /// The session reset to guest while the merge was in flight; the
    /// server's response was dropped.
    Discarded,
}

/// The single writer of the current tab's cart.
///
/// Cheap to clone; clones share state. Readers call [`snapshot`](Self::snapshot)
/// or [`subscribe`](Self::subscribe); only store methods mutate. Every local
/// mutation is persisted before it is published, so a storage failure leaves
/// both the published and the stored cart unchanged.
pub struct CartStore<S, A> {
    inner: Arc<CartStoreInner<S, A>>,
}

struct CartStoreInner<S, A> {
    storage: S,
    storage_key: String,
    api: A,
    state: watch::Sender<Cart>,
    /// Bumped on every reset to guest; merges started under an older epoch are dropped.
    epoch: AtomicU64,
    writes: Mutex<()>,
    merges: tokio::sync::Mutex<()>,
}

impl<S, A> Clone for CartStore<S, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: CartStorage, A: CartApi> CartStore<S, A> {
    /// Open the store, restoring the cart persisted under `storage_key`.
    pub fn open(storage: S, storage_key: impl Into<String>, api: A) -> Self {
        let storage_key = storage_key.into();
        let cart = read_cart(&storage, &storage_key);
        debug!(
            key = %storage_key,
            lines = cart.items().len(),
            owner_kind = ?cart.owner_kind,
            "Cart store opened"
        );
        let (state, _) = watch::channel(cart);

        Self {
            inner: Arc::new(CartStoreInner {
                storage,
                storage_key,
                api,
                state,
                epoch: AtomicU64::new(0),
                writes: Mutex::new(()),
                merges: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// The current cart.
    #[must_use]
    pub fn snapshot(&self) -> Cart {
        self.inner.state.borrow().clone()
    }

    /// Observe every published cart.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Cart> {
        self.inner.state.subscribe()
    }

    /// The Cart API the store merges against.
    #[must_use]
    pub fn api(&self) -> &A {
        &self.inner.api
    }

    /// Add units of a product, summing with an existing line of the same key.
    ///
    /// Returns the line's resulting quantity.
    ///
    /// # Errors
    ///
    /// `InvalidQuantity` if `quantity` is zero; `Storage` if persisting fails.
    #[instrument(skip(self, unit_price), fields(product_id = %product_id))]
    pub fn add_item(
        &self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        quantity: u32,
        unit_price: Price,
    ) -> Result<Quantity> {
        let quantity = Quantity::new(quantity)?;
        let item = CartLineItem {
            product_id,
            variant_id,
            quantity,
            unit_price,
            added_at: Utc::now(),
        };
        self.mutate(|cart| Ok(cart.absorb(item)))
    }

    /// Remove a line. Removing an absent line is a no-op.
    ///
    /// Returns whether a line was removed.
    ///
    /// # Errors
    ///
    /// `Storage` if persisting fails.
    #[instrument(skip(self), fields(product_id = %product_id))]
    pub fn remove_item(
        &self,
        product_id: &ProductId,
        variant_id: Option<&VariantId>,
    ) -> Result<bool> {
        let key = LineKey::new(product_id.clone(), variant_id.cloned());
        self.mutate(|cart| Ok(cart.remove(&key)))
    }

    /// Overwrite a line's quantity. Use [`remove_item`](Self::remove_item) to
    /// drop a line.
    ///
    /// # Errors
    ///
    /// `InvalidQuantity` if `quantity` is zero, `ItemNotFound` if no line has
    /// the key, `Storage` if persisting fails.
    #[instrument(skip(self), fields(key = %key))]
    pub fn set_quantity(&self, key: &LineKey, quantity: u32) -> Result<()> {
        let quantity = Quantity::new(quantity)?;
        self.mutate(|cart| {
            if cart.set_quantity(key, quantity) {
                Ok(())
            } else {
                Err(CartError::ItemNotFound(key.clone()))
            }
        })
    }

    /// Remove every line, keeping ownership.
    ///
    /// # Errors
    ///
    /// `Storage` if persisting fails.
    pub fn clear(&self) -> Result<()> {
        self.mutate(|cart| {
            cart.clear();
            Ok(())
        })
    }

    /// Replace the cart with a fresh guest cart.
    ///
    /// Any merge still in flight will discard its response.
    ///
    /// # Errors
    ///
    /// `Storage` if persisting fails. The session epoch is bumped regardless.
    #[instrument(skip(self))]
    pub fn reset_to_guest(&self) -> Result<()> {
        let _writes = self.lock_writes();
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.persist_and_publish(Cart::guest())?;
        debug!("Cart reset to guest");
        Ok(())
    }

    /// Fold the guest cart into the shopper's server cart.
    ///
    /// A no-op when the cart is already authenticated, so repeated or racing
    /// calls never double-count. On any failure the local cart is untouched.
    /// Use [`merge_guest_cart_as`](Self::merge_guest_cart_as) when the
    /// logged-in user is known.
    ///
    /// # Errors
    ///
    /// `MergeNetworkFailure` if the Cart API is unreachable or rejects a
    /// request, `MergeConflict` if the server refuses the merged cart without
    /// returning one, `Storage` if the authoritative cart (already applied in
    /// memory) could not be persisted.
    pub async fn merge_guest_cart(&self) -> Result<MergeOutcome> {
        self.merge_for(None).await
    }

    /// [`merge_guest_cart`](Self::merge_guest_cart) on behalf of `user_id`.
    ///
    /// Only a cart owned by `user_id` counts as already merged. A cart left
    /// authenticated by another account is reset to guest first, so its
    /// lines never reach this user's server cart.
    ///
    /// # Errors
    ///
    /// As for [`merge_guest_cart`](Self::merge_guest_cart).
    pub async fn merge_guest_cart_as(&self, user_id: &UserId) -> Result<MergeOutcome> {
        self.merge_for(Some(user_id)).await
    }

    #[instrument(skip_all, fields(user_id = user_id.map(tracing::field::display)))]
    async fn merge_for(&self, user_id: Option<&UserId>) -> Result<MergeOutcome> {
        let _merging = self.inner.merges.lock().await;

        let (mut local, mut epoch) = self.snapshot_with_epoch();
        if local.is_authenticated() {
            match user_id {
                Some(user_id) if !local.is_owned_by(user_id) => {
                    info!(
                        previous_owner = ?local.owner_id,
                        "Cart belongs to another account, starting from a guest cart"
                    );
                    self.reset_to_guest()?;
                    (local, epoch) = self.snapshot_with_epoch();
                }
                _ => {
                    debug!("Cart already authenticated, skipping merge");
                    return Ok(MergeOutcome::AlreadyMerged);
                }
            }
        }

        let server = self
            .inner
            .api
            .fetch_cart()
            .await
            .map_err(CartError::MergeNetworkFailure)?;

        let merged = reconcile(local.items(), &server.items);

        let (authoritative, conflicted) = match self.inner.api.replace_cart(&merged).await {
            Ok(cart) => (cart, false),
            Err(ApiError::Conflict(Some(kept))) => (kept, true),
            Err(ApiError::Conflict(None)) => {
                return Err(CartError::MergeConflict(
                    "server rejected the merged cart".to_string(),
                ));
            }
            Err(e) => return Err(CartError::MergeNetworkFailure(e)),
        };

        let cart = authoritative.into_cart();
        let lines = cart.items().len();
        if !self.apply_merged(epoch, cart)? {
            warn!("Session reset during merge, discarding server cart");
            return Ok(MergeOutcome::Discarded);
        }

        let guest_lines = local.items().len().to_string();
        add_breadcrumb(
            "cart",
            "Guest cart merged",
            Some(&[("guest_lines", guest_lines.as_str())]),
        );
        info!(guest_lines = local.items().len(), lines, conflicted, "Guest cart merged");

        Ok(if conflicted {
            MergeOutcome::Conflict { lines }
        } else {
            MergeOutcome::Merged { lines }
        })
    }

    fn snapshot_with_epoch(&self) -> (Cart, u64) {
        let _writes = self.lock_writes();
        (self.snapshot(), self.inner.epoch.load(Ordering::SeqCst))
    }

    /// Publish the authoritative cart unless the session reset since `epoch`.
    ///
    /// The cart is published even when persisting fails, since the server
    /// already holds it; the storage error is still returned.
    fn apply_merged(&self, epoch: u64, cart: Cart) -> Result<bool> {
        let _writes = self.lock_writes();
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            return Ok(false);
        }
        let persisted = write_cart(&self.inner.storage, &self.inner.storage_key, &cart);
        self.inner.state.send_replace(cart);
        persisted?;
        Ok(true)
    }

    /// Apply `f` to a copy of the cart, then persist and publish it if it changed.
    fn mutate<T>(&self, f: impl FnOnce(&mut Cart) -> Result<T>) -> Result<T> {
        let _writes = self.lock_writes();
        let mut cart = self.snapshot();
        let value = f(&mut cart)?;
        if *self.inner.state.borrow() != cart {
            self.persist_and_publish(cart)?;
        }
        Ok(value)
    }

    fn persist_and_publish(&self, cart: Cart) -> Result<()> {
        write_cart(&self.inner.storage, &self.inner.storage_key, &cart)?;
        self.inner.state.send_replace(cart);
        Ok(())
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.inner
            .writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: CartStorage, A: CartApi> GuestCartMerge for CartStore<S, A> {
    async fn merge_guest_cart(&self, user_id: Option<&UserId>) -> Result<MergeOutcome> {
        self.merge_for(user_id).await
    }

    fn reset_to_guest(&self) -> Result<()> {
        Self::reset_to_guest(self)
    }

    fn holds_authenticated_cart(&self) -> bool {
        self.inner.state.borrow().is_authenticated()
    }
}
