//! Basket Core - Shared cart types.
//!
//! This crate provides the types shared by every Basket component:
//! - `storefront` - Cart store, guest-cart merge, and Cart API client
//! - `integration-tests` - End-to-end tests against a mock Cart API
//!
//! # Architecture
//!
//! The core crate contains only types and pure cart operations - no I/O, no
//! storage, no HTTP clients. This keeps it lightweight and allows it to be
//! used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Newtype wrappers for type-safe IDs, prices, and quantities
//! - [`cart`] - The cart aggregate and its line items

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod cart;
pub mod types;

pub use cart::{Cart, CartLineItem, LineKey, OwnerKind};
pub use types::*;
