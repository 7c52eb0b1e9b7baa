//! Login-triggered guest cart merge.
//!
//! [`CartMerger`] turns auth-status change events into at most one
//! [`GuestCartMerge::merge_guest_cart`] call per login. The latch is an
//! explicit [`MergerState`]:
//!
//! ```text
//!   Idle ──logged in──▶ Merging ──ok──▶ Merged
//!    ▲                    │                │
//!    └──── merge failed ──┘                │
//!    └──────────── logged out ◀────────────┘ (from any state)
//! ```
//!
//! While the status is loading nothing fires. The transition into `Merging`
//! happens under a lock before the merge future is first polled, so events
//! racing in while a merge is outstanding are skipped.
//!
//! A failed merge returns to `Idle`, so the next auth-status event for the
//! same login retries it. Logging out resets the store to a fresh guest cart,
//! and so does a login by a different user than the one the latch was set
//! for. [`CartMerger::run`] applies a logout immediately, even while a merge
//! is still in flight; the store then drops that merge's response.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, instrument};

use basket_core::UserId;

use crate::auth::AuthStatus;
use crate::cart::MergeOutcome;
use crate::error::{self, Result};

/// The store-side operations the merger drives.
pub trait GuestCartMerge: Send + Sync {
    /// Merge the guest cart into the authenticated cart of `user_id`.
    ///
    /// Only a cart already owned by `user_id` (or any authenticated cart,
    /// when `user_id` is unknown) counts as merged.
    fn merge_guest_cart(
        &self,
        user_id: Option<&UserId>,
    ) -> impl Future<Output = Result<MergeOutcome>> + Send;

    /// Replace the cart with a fresh guest cart.
    ///
    /// # Errors
    ///
    /// Returns an error if the fresh cart cannot be persisted.
    fn reset_to_guest(&self) -> Result<()>;

    /// Whether the current cart belongs to an authenticated user.
    fn holds_authenticated_cart(&self) -> bool;
}

/// Where the merger is in the login lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergerState {
    /// Guest session, or a login whose merge failed.
    Idle,
    /// A merge is in flight.
    Merging,
    /// The merge for the current login completed.
    Merged,
}

/// What [`CartMerger::handle`] did with a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergerAction {
    /// Nothing to do for this status.
    Skipped,
    /// A merge ran to completion.
    Merged(MergeOutcome),
    /// A logout cleared the latch.
    Reset,
}

#[derive(Debug)]
struct Latch {
    state: MergerState,
    /// User the latch was set for.
    user_id: Option<UserId>,
    /// Bumped on logout so merges from an earlier login cannot settle the latch.
    generation: u64,
}

/// Controller that merges the guest cart once per login.
#[derive(Debug)]
pub struct CartMerger<M> {
    target: M,
    latch: Mutex<Latch>,
}

impl<M: GuestCartMerge> CartMerger<M> {
    /// New merger in the `Idle` state.
    pub const fn new(target: M) -> Self {
        Self {
            target,
            latch: Mutex::new(Latch {
                state: MergerState::Idle,
                user_id: None,
                generation: 0,
            }),
        }
    }

    /// Current latch state.
    #[must_use]
    pub fn state(&self) -> MergerState {
        self.lock().state
    }

    /// The merge target.
    #[must_use]
    pub const fn target(&self) -> &M {
        &self.target
    }

    /// React to one auth-status event.
    ///
    /// # Errors
    ///
    /// Returns the merge error after clearing the latch, or a storage error
    /// from resetting the cart on logout or account switch.
    #[instrument(skip(self, status), fields(
        is_authenticated = status.is_authenticated,
        is_loading = status.is_loading,
    ))]
    pub async fn handle(&self, status: &AuthStatus) -> Result<MergerAction> {
        if status.is_loading {
            return Ok(MergerAction::Skipped);
        }
        if !status.is_authenticated {
            return self.on_logged_out();
        }

        let (generation, switched) = {
            let mut latch = self.lock();
            let switched = match latch.state {
                MergerState::Idle => false,
                _ if latch.user_id == status.user_id => return Ok(MergerAction::Skipped),
                _ => true,
            };
            if switched {
                latch.generation += 1;
            }
            latch.state = MergerState::Merging;
            latch.user_id.clone_from(&status.user_id);
            (latch.generation, switched)
        };

        if switched {
            info!("Different user logged in, resetting cart");
            error::clear_sentry_user();
            if let Err(e) = self.target.reset_to_guest() {
                self.settle(generation, MergerState::Idle);
                return Err(e);
            }
        }
        if let Some(user_id) = &status.user_id {
            error::set_sentry_user(user_id);
        }
        debug!("Login observed, merging guest cart");

        match self.target.merge_guest_cart(status.user_id.as_ref()).await {
            Ok(outcome) => {
                self.settle(generation, MergerState::Merged);
                Ok(MergerAction::Merged(outcome))
            }
            Err(e) => {
                self.settle(generation, MergerState::Idle);
                Err(e)
            }
        }
    }

    /// Drive [`handle`](Self::handle) from a status channel until its sender
    /// is dropped. The status current at call time is handled first.
    ///
    /// A logout arriving while a merge is in flight is applied at once, so
    /// the late server response is discarded instead of briefly restoring
    /// the authenticated cart. Other statuses seen meanwhile are handled
    /// when the merge finishes, latest first.
    ///
    /// Errors are logged and captured, never returned: a failed merge simply
    /// waits for the next status event.
    pub async fn run(self: Arc<Self>, mut statuses: watch::Receiver<AuthStatus>) {
        let mut status = statuses.borrow_and_update().clone();
        loop {
            let mut pending = false;
            let mut closed = false;
            {
                let handled = self.handle(&status);
                tokio::pin!(handled);
                loop {
                    tokio::select! {
                        // Poll the merge first so its latch is set before a newer status is read
                        biased;

                        result = &mut handled => {
                            report(&result);
                            break;
                        }
                        changed = statuses.changed(), if !closed => {
                            if changed.is_err() {
                                closed = true;
                                continue;
                            }
                            pending = true;
                            if statuses.borrow_and_update().is_logged_out() {
                                report(&self.on_logged_out());
                            }
                        }
                    }
                }
            }

            if !pending && (closed || statuses.changed().await.is_err()) {
                debug!("Auth status channel closed, merger stopping");
                return;
            }
            status = statuses.borrow_and_update().clone();
        }
    }

    fn on_logged_out(&self) -> Result<MergerAction> {
        let was_active = {
            let mut latch = self.lock();
            let was_active = latch.state != MergerState::Idle;
            latch.state = MergerState::Idle;
            latch.user_id = None;
            if was_active {
                latch.generation += 1;
            }
            was_active
        };

        // A cart restored from storage may still belong to a previous login
        if !was_active && !self.target.holds_authenticated_cart() {
            return Ok(MergerAction::Skipped);
        }

        error::clear_sentry_user();
        self.target.reset_to_guest()?;
        Ok(MergerAction::Reset)
    }

    /// Move the latch to `state` unless a logout or account switch
    /// superseded the merge started under `generation`.
    fn settle(&self, generation: u64, state: MergerState) {
        let mut latch = self.lock();
        if latch.generation == generation {
            latch.state = state;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Latch> {
        self.latch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn report(result: &Result<MergerAction>) {
    match result {
        Ok(MergerAction::Merged(outcome)) => info!(?outcome, "Guest cart merge finished"),
        Ok(MergerAction::Reset) => debug!("Merge latch reset"),
        Ok(MergerAction::Skipped) => {}
        Err(e) if e.is_retryable() => {
            error::capture(e, "Guest cart merge failed, will retry on next auth event");
        }
        Err(e) => error::capture(e, "Guest cart merge failed"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use basket_core::{CartLineItem, CurrencyCode, Price, ProductId};
    use tokio::sync::Notify;

    use super::*;
    use crate::api::{ApiError, CartApi, ServerCart};
    use crate::cart::CartStore;
    use crate::error::CartError;
    use crate::storage::{MemoryStorage, read_cart};

    /// Counts calls and mimics the store's authenticated flag.
    #[derive(Default)]
    struct FakeTarget {
        merges: AtomicUsize,
        resets: AtomicUsize,
        authenticated: AtomicBool,
        fail_next: AtomicBool,
        gate: Option<Arc<Notify>>,
        merged_for: Mutex<Vec<Option<UserId>>>,
    }

    impl GuestCartMerge for FakeTarget {
        async fn merge_guest_cart(&self, user_id: Option<&UserId>) -> Result<MergeOutcome> {
            self.merges.fetch_add(1, Ordering::SeqCst);
            self.merged_for.lock().unwrap().push(user_id.cloned());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(CartError::MergeNetworkFailure(ApiError::Unauthorized));
            }
            if self.authenticated.swap(true, Ordering::SeqCst) {
                return Ok(MergeOutcome::AlreadyMerged);
            }
            Ok(MergeOutcome::Merged { lines: 1 })
        }

        fn reset_to_guest(&self) -> Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            self.authenticated.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn holds_authenticated_cart(&self) -> bool {
            self.authenticated.load(Ordering::SeqCst)
        }
    }

    /// Cart API whose `PUT` waits for a gate.
    #[derive(Default)]
    struct GatedApi {
        gate: Notify,
        replaces: AtomicUsize,
    }

    impl CartApi for GatedApi {
        async fn fetch_cart(&self) -> std::result::Result<ServerCart, ApiError> {
            Ok(ServerCart {
                owner_id: UserId::new("alice"),
                items: Vec::new(),
            })
        }

        async fn replace_cart(
            &self,
            items: &[CartLineItem],
        ) -> std::result::Result<ServerCart, ApiError> {
            self.replaces.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(ServerCart {
                owner_id: UserId::new("alice"),
                items: items
                    .iter()
                    .cloned()
                    .map(|item| crate::api::ServerCartLine {
                        item,
                        max_stock: None,
                    })
                    .collect(),
            })
        }
    }

    fn merger(target: FakeTarget) -> CartMerger<FakeTarget> {
        CartMerger::new(target)
    }

    fn merges(merger: &CartMerger<FakeTarget>) -> usize {
        merger.target().merges.load(Ordering::SeqCst)
    }

    fn resets(merger: &CartMerger<FakeTarget>) -> usize {
        merger.target().resets.load(Ordering::SeqCst)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        while !done() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_login_triggers_one_merge() {
        let merger = merger(FakeTarget::default());

        let action = merger.handle(&AuthStatus::authenticated("u")).await.unwrap();
        assert_eq!(action, MergerAction::Merged(MergeOutcome::Merged { lines: 1 }));
        assert_eq!(merger.state(), MergerState::Merged);

        // Re-renders with the same status do nothing
        for _ in 0..3 {
            let action = merger.handle(&AuthStatus::authenticated("u")).await.unwrap();
            assert_eq!(action, MergerAction::Skipped);
        }
        assert_eq!(merges(&merger), 1);
    }

    #[tokio::test]
    async fn test_merge_is_requested_for_logged_in_user() {
        let merger = merger(FakeTarget::default());
        merger.handle(&AuthStatus::authenticated("alice")).await.unwrap();

        assert_eq!(
            *merger.target().merged_for.lock().unwrap(),
            [Some(UserId::new("alice"))]
        );
    }

    #[tokio::test]
    async fn test_login_logout_login_merges_twice() {
        let merger = merger(FakeTarget::default());

        merger.handle(&AuthStatus::authenticated("u")).await.unwrap();
        let action = merger.handle(&AuthStatus::anonymous()).await.unwrap();
        assert_eq!(action, MergerAction::Reset);
        assert_eq!(merger.state(), MergerState::Idle);
        merger.handle(&AuthStatus::authenticated("u")).await.unwrap();

        assert_eq!(merges(&merger), 2);
        assert_eq!(resets(&merger), 1);
    }

    #[tokio::test]
    async fn test_switching_user_resets_and_merges_again() {
        let merger = merger(FakeTarget::default());
        merger.handle(&AuthStatus::authenticated("alice")).await.unwrap();

        // No logged-out status in between
        merger.handle(&AuthStatus::loading()).await.unwrap();
        let action = merger.handle(&AuthStatus::authenticated("bob")).await.unwrap();

        assert_eq!(action, MergerAction::Merged(MergeOutcome::Merged { lines: 1 }));
        assert_eq!(resets(&merger), 1);
        assert_eq!(merges(&merger), 2);
        assert_eq!(merger.state(), MergerState::Merged);
        assert_eq!(
            merger.target().merged_for.lock().unwrap().last(),
            Some(&Some(UserId::new("bob")))
        );
    }

    #[tokio::test]
    async fn test_switching_user_through_store_replaces_owner() {
        let storage = MemoryStorage::new();
        let api = GatedApi::default();
        api.gate.notify_one();
        let store = CartStore::open(storage.clone(), "cart", api);
        let merger = CartMerger::new(store.clone());
        merger.handle(&AuthStatus::authenticated("alice")).await.unwrap();
        assert!(store.snapshot().is_owned_by(&UserId::new("alice")));

        store.api().gate.notify_one();
        merger.handle(&AuthStatus::authenticated("bob")).await.unwrap();

        // The fake server still answers as alice, but the local cart was
        // reset and merged again rather than kept
        assert_eq!(store.api().replaces.load(Ordering::SeqCst), 2);
        assert_eq!(read_cart(&storage, "cart"), store.snapshot());
    }

    #[tokio::test]
    async fn test_no_merge_while_loading() {
        let merger = merger(FakeTarget::default());
        let loading_but_authenticated = AuthStatus {
            is_authenticated: true,
            is_loading: true,
            user_id: Some(UserId::new("u")),
        };

        let action = merger.handle(&loading_but_authenticated).await.unwrap();
        assert_eq!(action, MergerAction::Skipped);
        assert_eq!(merges(&merger), 0);

        merger.handle(&AuthStatus::authenticated("u")).await.unwrap();
        assert_eq!(merges(&merger), 1);
    }

    #[tokio::test]
    async fn test_failed_merge_is_retried() {
        let target = FakeTarget::default();
        target.fail_next.store(true, Ordering::SeqCst);
        let merger = merger(target);

        let err = merger.handle(&AuthStatus::authenticated("u")).await.unwrap_err();
        assert!(matches!(err, CartError::MergeNetworkFailure(_)));
        assert_eq!(merger.state(), MergerState::Idle);

        merger.handle(&AuthStatus::authenticated("u")).await.unwrap();
        assert_eq!(merger.state(), MergerState::Merged);
        assert_eq!(merges(&merger), 2);
    }

    #[tokio::test]
    async fn test_guest_logout_without_login_is_skipped() {
        let merger = merger(FakeTarget::default());
        let action = merger.handle(&AuthStatus::anonymous()).await.unwrap();

        assert_eq!(action, MergerAction::Skipped);
        assert_eq!(resets(&merger), 0);
    }

    #[tokio::test]
    async fn test_stale_authenticated_cart_is_reset_when_logged_out() {
        let target = FakeTarget::default();
        target.authenticated.store(true, Ordering::SeqCst);
        let merger = merger(target);

        let action = merger.handle(&AuthStatus::anonymous()).await.unwrap();
        assert_eq!(action, MergerAction::Reset);
        assert_eq!(resets(&merger), 1);
    }

    #[tokio::test]
    async fn test_events_during_merge_are_skipped() {
        let gate = Arc::new(Notify::new());
        let merger = Arc::new(merger(FakeTarget {
            gate: Some(Arc::clone(&gate)),
            ..FakeTarget::default()
        }));

        let running = {
            let merger = Arc::clone(&merger);
            tokio::spawn(async move { merger.handle(&AuthStatus::authenticated("u")).await })
        };
        wait_until(|| merger.state() == MergerState::Merging).await;

        let action = merger.handle(&AuthStatus::authenticated("u")).await.unwrap();
        assert_eq!(action, MergerAction::Skipped);

        gate.notify_one();
        running.await.unwrap().unwrap();
        assert_eq!(merges(&merger), 1);
        assert_eq!(merger.state(), MergerState::Merged);
    }

    #[tokio::test]
    async fn test_logout_during_merge_keeps_latch_clear() {
        let gate = Arc::new(Notify::new());
        let merger = Arc::new(merger(FakeTarget {
            gate: Some(Arc::clone(&gate)),
            ..FakeTarget::default()
        }));

        let running = {
            let merger = Arc::clone(&merger);
            tokio::spawn(async move { merger.handle(&AuthStatus::authenticated("u")).await })
        };
        wait_until(|| merger.state() == MergerState::Merging).await;

        merger.handle(&AuthStatus::anonymous()).await.unwrap();
        gate.notify_one();
        running.await.unwrap().unwrap();

        // The late completion must not mark the logged-out session as merged
        assert_eq!(merger.state(), MergerState::Idle);
    }

    #[tokio::test]
    async fn test_run_login_logout_login_merges_twice() {
        let (tx, rx) = watch::channel(AuthStatus::loading());
        let merger = Arc::new(merger(FakeTarget::default()));
        let task = tokio::spawn(Arc::clone(&merger).run(rx));

        tx.send(AuthStatus::authenticated("u")).unwrap();
        wait_until(|| merger.state() == MergerState::Merged).await;

        tx.send(AuthStatus::anonymous()).unwrap();
        wait_until(|| resets(&merger) == 1).await;
        assert_eq!(merger.state(), MergerState::Idle);

        tx.send(AuthStatus::authenticated("u")).unwrap();
        wait_until(|| merges(&merger) == 2 && merger.state() == MergerState::Merged).await;

        drop(tx);
        task.await.unwrap();
        assert_eq!(merges(&merger), 2);
        assert_eq!(resets(&merger), 1);
    }

    #[tokio::test]
    async fn test_run_logout_during_merge_discards_response() {
        let storage = MemoryStorage::new();
        let store = CartStore::open(storage.clone(), "cart", GatedApi::default());
        store
            .add_item(
                ProductId::new("A"),
                None,
                2,
                Price::from_cents(500, CurrencyCode::USD),
            )
            .unwrap();
        let merger = Arc::new(CartMerger::new(store.clone()));

        let (tx, rx) = watch::channel(AuthStatus::authenticated("alice"));
        let task = tokio::spawn(Arc::clone(&merger).run(rx));
        wait_until(|| store.api().replaces.load(Ordering::SeqCst) == 1).await;

        // Logged out while the server still holds the reply
        tx.send(AuthStatus::anonymous()).unwrap();
        wait_until(|| merger.state() == MergerState::Idle).await;
        assert!(!store.snapshot().is_authenticated());

        store.api().gate.notify_one();
        drop(tx);
        task.await.unwrap();

        assert!(!store.snapshot().is_authenticated());
        assert!(store.snapshot().is_empty());
        assert!(!read_cart(&storage, "cart").is_authenticated());
    }
}
