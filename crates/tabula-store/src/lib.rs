//! tabula-store: key-value storage for one table replica.
//!
//! Backed by [redb](https://docs.rs/redb). A [`Multistore`] owns the table's
//! database and hands out [`StoreSubview`]s, each restricted to one key
//! region. Every execution works through its own subview, so it can only
//! read or change the keys of the region it was created for.
//!
//! # Architecture
//!
//! ```text
//! Multistore (Arc<Database>)
//!   ├── StoreSubview [a, m)   ← primary execution
//!   ├── StoreSubview [m, t)   ← secondary execution
//!   └── StoreSubview [t, +inf) ← erase execution
//! ```
//!
//! Subviews never lock against each other, and nothing stops two of them
//! from covering the same keys. That happens briefly when a region changes
//! role: the new execution's subview is created while the old one is still
//! waiting to be destroyed.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StoreError, StoreResult};
pub use store::{Multistore, StoreSubview};
