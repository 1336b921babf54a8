//! Metrics collections: named counter namespaces arranged in a tree.
//!
//! Counters are lock-free atomics. The maps holding counters and children
//! sit behind `std::sync::RwLock`s; they are only written when a counter or
//! child is first registered or removed, never on the increment path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use thiserror::Error;
use tracing::debug;

/// Errors from registering collections.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricsError {
    #[error("metrics collection already has a child named {0}")]
    DuplicateName(String),
}

pub type MetricsResult<T> = Result<T, MetricsError>;

/// A monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn incr(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A named group of counters and child collections.
#[derive(Debug)]
pub struct MetricsCollection {
    name: String,
    counters: RwLock<BTreeMap<String, Counter>>,
    children: RwLock<BTreeMap<String, Arc<MetricsCollection>>>,
}

impl MetricsCollection {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            counters: RwLock::new(BTreeMap::new()),
            children: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get or create the counter called `name`.
    pub fn counter(&self, name: &str) -> Counter {
        if let Some(c) = self.counters.read().expect("counters lock").get(name) {
            return c.clone();
        }
        self.counters
            .write()
            .expect("counters lock")
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Attach `child` under this collection.
    ///
    /// The child stays attached until the returned [`Membership`] is dropped.
    pub fn join(self: &Arc<Self>, child: Arc<MetricsCollection>) -> MetricsResult<Membership> {
        let mut children = self.children.write().expect("children lock");
        if children.contains_key(child.name()) {
            return Err(MetricsError::DuplicateName(child.name().to_string()));
        }
        let name = child.name().to_string();
        children.insert(name.clone(), Arc::clone(&child));
        debug!(parent = %self.name, child = %name, "metrics collection joined");
        Ok(Membership {
            parent: Arc::downgrade(self),
            child,
        })
    }

    pub fn child(&self, name: &str) -> Option<Arc<MetricsCollection>> {
        self.children.read().expect("children lock").get(name).cloned()
    }

    pub fn child_names(&self) -> Vec<String> {
        self.children
            .read()
            .expect("children lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Every counter in this subtree as `(collection path, counter name, value)`.
    ///
    /// Paths are `/`-joined collection names starting with this collection.
    pub fn snapshot(&self) -> Vec<(String, String, u64)> {
        let mut out = Vec::new();
        self.collect_into(&self.name, &mut out);
        out
    }

    fn collect_into(&self, path: &str, out: &mut Vec<(String, String, u64)>) {
        for (name, counter) in self.counters.read().expect("counters lock").iter() {
            out.push((path.to_string(), name.clone(), counter.get()));
        }
        for (name, child) in self.children.read().expect("children lock").iter() {
            child.collect_into(&format!("{path}/{name}"), out);
        }
    }

    fn remove_child(&self, name: &str) {
        self.children.write().expect("children lock").remove(name);
    }
}

/// Keeps a child collection attached to its parent.
#[derive(Debug)]
pub struct Membership {
    parent: Weak<MetricsCollection>,
    child: Arc<MetricsCollection>,
}

impl Membership {
    pub fn collection(&self) -> &Arc<MetricsCollection> {
        &self.child
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.remove_child(self.child.name());
            debug!(parent = %parent.name, child = %self.child.name, "metrics collection left");
        }
    }
}
