//! Cart state for the current tab.
//!
//! - [`CartStore`] owns the single reactive [`basket_core::Cart`], persists
//!   it on every mutation, and performs the guest-cart merge
//! - [`merge::reconcile`] is the pure line-merging step of that merge

pub mod merge;
mod store;

pub use store::{CartStore, MergeOutcome};
