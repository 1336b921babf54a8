//! Ack and card relays: the executor's exported live maps.
//!
//! Executions report progress by writing acks and publishing connection
//! cards. Both are written concurrently from execution tasks while the
//! update task owns the table, so each map is its own lock with a version
//! counter that subscribers can watch.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use tabula_core::{BranchId, ContractAck, ContractId, ExecutionBcard, ServerId, TableQueryBcard};

use crate::key::ExecutionKey;

/// Acks are keyed by the reporting server and the contract they answer.
pub type AckKey = (ServerId, ContractId);

/// Execution cards are keyed by the primary's server and branch.
pub type BcardKey = (ServerId, BranchId);

/// A concurrently writable map whose changes can be awaited.
///
/// Every write that changes the map bumps a version number published on a
/// watch channel. Writes are last-writer-wins per key and visible to readers
/// as soon as the call returns.
#[derive(Debug)]
pub struct WatchableMap<K, V> {
    entries: RwLock<BTreeMap<K, V>>,
    version: watch::Sender<u64>,
}

impl<K: Ord + Clone, V: Clone + PartialEq> WatchableMap<K, V> {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            entries: RwLock::new(BTreeMap::new()),
            version,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.read().expect("map lock").get(key).cloned()
    }

    /// Insert or overwrite. Writing the value already stored is a no-op and
    /// does not wake subscribers.
    pub fn set(&self, key: K, value: V) {
        {
            let mut entries = self.entries.write().expect("map lock");
            if entries.get(&key) == Some(&value) {
                return;
            }
            entries.insert(key, value);
        }
        self.bump();
    }

    /// Remove `key` only while it still maps to `expected`.
    pub fn remove_if_eq(&self, key: &K, expected: &V) -> bool {
        {
            let mut entries = self.entries.write().expect("map lock");
            if entries.get(key) != Some(expected) {
                return false;
            }
            entries.remove(key);
        }
        self.bump();
        true
    }

    pub fn snapshot(&self) -> BTreeMap<K, V> {
        self.entries.read().expect("map lock").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("map lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to change notifications. The value is the map version.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

impl<K: Ord + Clone, V: Clone + PartialEq> Default for WatchableMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// The three maps one executor exports.
#[derive(Debug)]
pub struct ContractRelay {
    server_id: ServerId,
    acks: WatchableMap<AckKey, ContractAck>,
    execution_bcards: WatchableMap<BcardKey, ExecutionBcard>,
    query_bcards: WatchableMap<Uuid, TableQueryBcard>,
}

impl ContractRelay {
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            acks: WatchableMap::new(),
            execution_bcards: WatchableMap::new(),
            query_bcards: WatchableMap::new(),
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Record `ack` as this server's answer to `contract_id`.
    ///
    /// Repeating an ack is idempotent. Acks outlive the execution that
    /// wrote them.
    pub fn publish_ack(&self, key: &ExecutionKey, contract_id: ContractId, ack: ContractAck) {
        debug!(%key, contract = %contract_id, state = ?ack.state, "ack published");
        self.acks.set((self.server_id, contract_id), ack);
    }

    pub fn acks(&self) -> &WatchableMap<AckKey, ContractAck> {
        &self.acks
    }

    pub fn execution_bcards(&self) -> &WatchableMap<BcardKey, ExecutionBcard> {
        &self.execution_bcards
    }

    pub fn query_bcards(&self) -> &WatchableMap<Uuid, TableQueryBcard> {
        &self.query_bcards
    }
}

#[derive(Debug, Default)]
struct Registered {
    execution: Vec<(BcardKey, ExecutionBcard)>,
    query: Vec<(Uuid, TableQueryBcard)>,
}

/// Cards published on behalf of one execution slot.
///
/// Everything registered here is withdrawn together when the slot is
/// destroyed. A card another slot has since overwritten is left alone.
#[derive(Debug)]
pub struct CardRegistrar {
    relay: Arc<ContractRelay>,
    registered: Mutex<Registered>,
}

impl CardRegistrar {
    pub fn new(relay: Arc<ContractRelay>) -> Self {
        Self {
            relay,
            registered: Mutex::new(Registered::default()),
        }
    }

    pub fn register_execution_bcard(&self, card: ExecutionBcard) {
        let key = (card.server, card.branch);
        self.relay.execution_bcards.set(key, card.clone());
        self.registered
            .lock()
            .expect("cards lock")
            .execution
            .push((key, card));
        debug!(server = %key.0, branch = %key.1, "execution card registered");
    }

    /// Publish a query card under a fresh id and return the id.
    pub fn register_query_bcard(&self, card: TableQueryBcard) -> Uuid {
        let id = Uuid::new_v4();
        self.relay.query_bcards.set(id, card.clone());
        self.registered
            .lock()
            .expect("cards lock")
            .query
            .push((id, card));
        debug!(%id, "query card registered");
        id
    }

    /// Withdraw every card this registrar published. Returns how many were
    /// still present.
    pub fn withdraw_all(&self) -> usize {
        let registered = std::mem::take(&mut *self.registered.lock().expect("cards lock"));
        let mut withdrawn = 0;
        for (key, card) in &registered.execution {
            if self.relay.execution_bcards.remove_if_eq(key, card) {
                withdrawn += 1;
            }
        }
        for (id, card) in &registered.query {
            if self.relay.query_bcards.remove_if_eq(id, card) {
                withdrawn += 1;
            }
        }
        if withdrawn > 0 {
            debug!(withdrawn, "cards withdrawn");
        }
        withdrawn
    }
}
