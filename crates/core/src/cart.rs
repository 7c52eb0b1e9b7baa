//! The cart aggregate.
//!
//! A [`Cart`] holds at most one [`CartLineItem`] per [`LineKey`]. Every
//! operation that can introduce a duplicate key coalesces by summing
//! quantities instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CurrencyCode, Price, ProductId, Quantity, UserId, VariantId};

/// Identity of a cart line: product plus optional variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineKey {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
}

impl LineKey {
    /// Create a key.
    #[must_use]
    pub const fn new(product_id: ProductId, variant_id: Option<VariantId>) -> Self {
        Self {
            product_id,
            variant_id,
        }
    }
}

impl core::fmt::Display for LineKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.variant_id {
            Some(variant) => write!(f, "{}/{variant}", self.product_id),
            None => write!(f, "{}", self.product_id),
        }
    }
}

/// A single line in a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLineItem {
    pub product_id: ProductId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<VariantId>,
    pub quantity: Quantity,
    pub unit_price: Price,
    pub added_at: DateTime<Utc>,
}

impl CartLineItem {
    /// The line's identity.
    #[must_use]
    pub fn key(&self) -> LineKey {
        LineKey::new(self.product_id.clone(), self.variant_id.clone())
    }

    /// Whether this line has the given identity.
    #[must_use]
    pub fn matches(&self, key: &LineKey) -> bool {
        self.product_id == key.product_id && self.variant_id == key.variant_id
    }

    /// `unit_price × quantity`.
    #[must_use]
    pub fn line_total(&self) -> Price {
        self.unit_price.times(self.quantity)
    }
}

/// Who a cart belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    /// Anonymous session; the cart only exists in local storage.
    #[default]
    Guest,
    /// Logged-in user; the server cart is the source of truth.
    Authenticated,
}

/// A shopping cart for either a guest or an authenticated user.
///
/// Deserialized carts are coalesced, so a hand-edited or stale payload with
/// duplicate keys still upholds the one-line-per-key invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "CartRepr")]
pub struct Cart {
    pub owner_kind: OwnerKind,
    pub owner_id: Option<UserId>,
    items: Vec<CartLineItem>,
}

#[derive(Deserialize)]
struct CartRepr {
    #[serde(default)]
    owner_kind: OwnerKind,
    #[serde(default)]
    owner_id: Option<UserId>,
    #[serde(default)]
    items: Vec<CartLineItem>,
}

impl From<CartRepr> for Cart {
    fn from(repr: CartRepr) -> Self {
        let mut cart = Self {
            owner_kind: repr.owner_kind,
            owner_id: repr.owner_id,
            items: Vec::with_capacity(repr.items.len()),
        };
        for item in repr.items {
            cart.absorb(item);
        }
        cart
    }
}

impl Cart {
    /// An empty guest cart.
    #[must_use]
    pub fn guest() -> Self {
        Self::default()
    }

    /// An authenticated cart built from arbitrary lines.
    ///
    /// Lines sharing a key are coalesced, keeping the position and
    /// `added_at` of the first occurrence.
    #[must_use]
    pub fn authenticated(
        owner_id: impl Into<UserId>,
        items: impl IntoIterator<Item = CartLineItem>,
    ) -> Self {
        let mut cart = Self {
            owner_kind: OwnerKind::Authenticated,
            owner_id: Some(owner_id.into()),
            items: Vec::new(),
        };
        for item in items {
            cart.absorb(item);
        }
        cart
    }

    /// Lines in display order.
    #[must_use]
    pub fn items(&self) -> &[CartLineItem] {
        &self.items
    }

    /// Whether the cart has no lines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the cart belongs to a logged-in user.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.owner_kind == OwnerKind::Authenticated
    }

    /// Whether the cart is the authenticated cart of `user_id`.
    #[must_use]
    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        self.is_authenticated() && self.owner_id.as_ref() == Some(user_id)
    }

    /// Find the line with the given key.
    #[must_use]
    pub fn find(&self, key: &LineKey) -> Option<&CartLineItem> {
        self.items.iter().find(|item| item.matches(key))
    }

    /// Total number of units across all lines.
    #[must_use]
    pub fn total_quantity(&self) -> u64 {
        self.items
            .iter()
            .map(|item| u64::from(item.quantity.get()))
            .sum()
    }

    /// Sum of all line totals.
    ///
    /// Uses the currency of the first line; an empty cart is zero USD.
    #[must_use]
    pub fn subtotal(&self) -> Price {
        let currency = self
            .items
            .first()
            .map_or(CurrencyCode::default(), |item| item.unit_price.currency_code);
        let amount = self.items.iter().map(|item| item.line_total().amount).sum();
        Price::new(amount, currency)
    }

    /// Insert a line, or add its quantity to the existing line with the same key.
    ///
    /// Returns the resulting quantity for that key.
    pub fn absorb(&mut self, item: CartLineItem) -> Quantity {
        let key = item.key();
        if let Some(existing) = self.items.iter_mut().find(|line| line.matches(&key)) {
            existing.quantity = existing.quantity.saturating_add(item.quantity);
            return existing.quantity;
        }
        let quantity = item.quantity;
        self.items.push(item);
        quantity
    }

    /// Remove the line with the given key. Returns whether a line was removed.
    pub fn remove(&mut self, key: &LineKey) -> bool {
        let before = self.items.len();
        self.items.retain(|item| !item.matches(key));
        self.items.len() != before
    }

    /// Overwrite the quantity of an existing line.
    ///
    /// Returns `false` if no line has the key.
    pub fn set_quantity(&mut self, key: &LineKey, quantity: Quantity) -> bool {
        match self.items.iter_mut().find(|item| item.matches(key)) {
            Some(item) => {
                item.quantity = quantity;
                true
            }
            None => false,
        }
    }

    /// Drop every line, keeping ownership.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}
