//! tabula-metrics: observability for Tabula executions.
//!
//! Counters live in a tree of named [`MetricsCollection`]s. A component
//! creates its own collection, joins it under a parent, and holds the
//! returned [`Membership`]; dropping the membership detaches the subtree.
//! That way every execution gets an isolated namespace and never has to
//! worry about colliding with a sibling's counter names.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollection "table"
//!   ├── counter passes
//!   ├── MetricsCollection "primary-0"   ← held by a Membership
//!   │     └── counter acks_published
//!   └── MetricsCollection "erase-1"
//!         └── counter keys_erased
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod collection;
pub mod prometheus;

pub use collection::{Counter, Membership, MetricsCollection, MetricsError, MetricsResult};
pub use prometheus::render_prometheus;
