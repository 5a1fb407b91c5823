//! fleet-state — embedded state store for the fleet controller.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for node groups, managed nodes, rebalance opportunities, plans,
//! execution checkpoints, leader leases, and the event log.
//!
//! # Concurrency
//!
//! Every record carries a `version`. Creating a record that already exists
//! fails with [`StateError::AlreadyExists`]; updating a record whose stored
//! version differs from the caller's copy fails with
//! [`StateError::Conflict`]. Writers re-read and retry instead of
//! overwriting blindly.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod events;
pub mod store;
pub mod tables;
pub mod types;
pub mod validate;

pub use error::{StateError, StateResult};
pub use events::{Event, EventKind, EventReason};
pub use store::StateStore;
pub use types::*;
pub use validate::{EffectiveBounds, ValidationError, effective_bounds, validate_group_spec};

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
