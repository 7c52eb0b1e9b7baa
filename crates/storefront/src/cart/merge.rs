//! Guest-into-server line reconciliation.

use basket_core::{Cart, CartLineItem};

use crate::api::ServerCartLine;

/// Combine the server's lines with the guest's lines.
///
/// Server lines keep their order and come first; guest lines with a new key
/// are appended in guest order. When both sides hold a key the quantities are
/// summed and clamped to the server's `max_stock`, if it declared one. The
/// server line's price and `added_at` win for shared keys.
#[must_use]
pub fn reconcile(guest: &[CartLineItem], server: &[ServerCartLine]) -> Vec<CartLineItem> {
    let mut merged = Cart::guest();
    for line in server {
        merged.absorb(line.item.clone());
    }

    for item in guest {
        let key = item.key();
        let limit = server
            .iter()
            .find(|line| line.item.matches(&key))
            .and_then(|line| line.max_stock);

        let total = merged.absorb(item.clone());
        if let Some(max) = limit
            && total.get() > max
        {
            merged.set_quantity(&key, total.clamp_to(max));
        }
    }

    merged.items().to_vec()
}
