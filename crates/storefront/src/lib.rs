//! Basket Storefront library.
//!
//! Client-side cart state for the storefront: a persisted, single-writer
//! [`cart::CartStore`], the [`merger::CartMerger`] that folds a guest cart
//! into the shopper's account cart exactly once per login, and the
//! collaborators both depend on (auth status, Cart REST API, durable storage).
//!
//! [`state::Session`] wires everything together from [`config::BasketConfig`].

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod api;
pub mod auth;
pub mod cart;
pub mod config;
pub mod error;
pub mod merger;
pub mod state;
pub mod storage;
pub mod telemetry;
