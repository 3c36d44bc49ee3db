//! Core types and rule evaluation for the clinic record engine.
//!
//! This crate is deliberately free of async runtime and storage
//! dependencies. It holds the record model, the declarative form rules, date
//! derivation, and the traits describing the external collaborators (record
//! store, sequence generator, notification sink).

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod dates;
pub mod error;
pub mod forms;
pub mod record;
pub mod renewal;
pub mod rules;
pub mod store;
pub mod uniqueness;

pub use error::{Error, Result};
