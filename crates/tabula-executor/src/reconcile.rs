//! Reconciliation: diffing a Raft snapshot against the execution table.
//!
//! Reconciliation is two-phase. [`plan`] is pure: it derives the keys of
//! every contract in the snapshot, one per stretch of the contract's region
//! with its own authoritative branch, and sorts them into creates, updates,
//! and deletes. [`Reconciler::reconcile`] then applies the creates and
//! updates immediately, since neither can block, and hands the delete set
//! back to the update task, which destroys those slots one at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use tabula_core::{Contract, ContractId, ExecutionBcard, ExecutorConfig, TableRaftState};
use tabula_metrics::{Counter, MetricsCollection};
use tabula_store::Multistore;

use crate::execution::{ExecutionContext, ExecutionFactory};
use crate::key::{ExecutionKey, KeyDeriver};
use crate::relay::{BcardKey, CardRegistrar, ContractRelay, WatchableMap};
use crate::slot::{ExecutionSlot, filtered_ack_callback};
use crate::table::ExecutionTable;

/// What a snapshot asks of the table.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Keys with no slot yet, and the contract each is for.
    pub creates: Vec<(ExecutionKey, ContractId)>,
    /// Existing keys whose contract changed.
    pub updates: Vec<(ExecutionKey, ContractId)>,
    /// Existing keys whose contract did not change. They are still handed
    /// the new snapshot.
    pub retained: Vec<(ExecutionKey, ContractId)>,
    /// Existing keys the snapshot no longer derives.
    pub deletes: BTreeSet<ExecutionKey>,
}

/// Sort the snapshot's contracts against `table`.
///
/// Panics if two contracts derive the same key; contract regions never
/// overlap, so that is a corrupt snapshot.
pub fn plan(deriver: &KeyDeriver, state: &TableRaftState, table: &ExecutionTable) -> ReconcilePlan {
    let mut wanted: BTreeMap<ExecutionKey, ContractId> = BTreeMap::new();
    for (contract_id, (region, contract)) in &state.contracts {
        for key in deriver.derive_all(region, contract, &state.current_branches) {
            if let Some(other) = wanted.insert(key.clone(), *contract_id) {
                panic!("contracts {other} and {contract_id} both derive execution key {key}");
            }
        }
    }

    let mut plan = ReconcilePlan::default();
    for (key, contract_id) in &wanted {
        match table.get(key) {
            None => plan.creates.push((key.clone(), *contract_id)),
            Some(slot) => {
                let (_, contract) = &state.contracts[contract_id];
                if slot.contract_id() != *contract_id || slot.contract() != contract {
                    plan.updates.push((key.clone(), *contract_id));
                } else {
                    plan.retained.push((key.clone(), *contract_id));
                }
            }
        }
    }
    plan.deletes = table
        .keys()
        .filter(|key| !wanted.contains_key(*key))
        .cloned()
        .collect();
    plan
}

/// Result of one reconciliation.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub created: usize,
    pub updated: usize,
    /// Slots the caller must shut down and remove.
    pub to_delete: BTreeSet<ExecutionKey>,
}

/// Applies snapshots to an execution table.
pub struct Reconciler {
    deriver: KeyDeriver,
    store: Multistore,
    relay: Arc<ContractRelay>,
    factory: Arc<dyn ExecutionFactory>,
    metrics: Arc<MetricsCollection>,
    remote_bcards: Arc<WatchableMap<BcardKey, ExecutionBcard>>,
    interruptor: watch::Receiver<bool>,
    advertise_addr: String,
    erase_chunk_size: usize,
    next_slot_id: u64,
    created: Counter,
    updated: Counter,
}

impl Reconciler {
    pub fn new(
        config: &ExecutorConfig,
        deriver: KeyDeriver,
        store: Multistore,
        relay: Arc<ContractRelay>,
        factory: Arc<dyn ExecutionFactory>,
    ) -> Self {
        let metrics = MetricsCollection::new("table");
        Self {
            deriver,
            store,
            relay,
            factory,
            created: metrics.counter("created"),
            updated: metrics.counter("updated"),
            metrics,
            remote_bcards: Arc::new(WatchableMap::new()),
            interruptor: watch::channel(false).1,
            advertise_addr: config.advertise_addr.clone(),
            erase_chunk_size: config.erase_chunk_size,
            next_slot_id: 0,
        }
    }

    /// Register slot namespaces under `metrics` instead of a private root.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollection>) -> Self {
        self.created = metrics.counter("created");
        self.updated = metrics.counter("updated");
        self.metrics = metrics;
        self
    }

    pub fn with_remote_bcards(
        mut self,
        remote_bcards: Arc<WatchableMap<BcardKey, ExecutionBcard>>,
    ) -> Self {
        self.remote_bcards = remote_bcards;
        self
    }

    /// The signal handed to executions as their interruptor.
    pub fn with_interruptor(mut self, interruptor: watch::Receiver<bool>) -> Self {
        self.interruptor = interruptor;
        self
    }

    pub fn deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    /// Bring `table` in line with `state`, except for deletions.
    ///
    /// Creates and updates are applied before returning. The returned
    /// `to_delete` keys are still in the table.
    pub fn reconcile(
        &mut self,
        state: &Arc<TableRaftState>,
        table: &mut ExecutionTable,
    ) -> ReconcileOutcome {
        let plan = plan(&self.deriver, state, table);
        debug!(
            log_index = state.log_index,
            creates = plan.creates.len(),
            updates = plan.updates.len(),
            retained = plan.retained.len(),
            deletes = plan.deletes.len(),
            "reconcile planned"
        );

        for (key, contract_id) in &plan.updates {
            let (_, contract) = &state.contracts[contract_id];
            let Some(slot) = table.get_mut(key) else {
                unreachable!("planned update for {key} has no slot");
            };
            let previous = slot.contract_id();
            slot.update(*contract_id, contract, state);
            self.updated.incr();
            info!(%key, slot_id = slot.slot_id(), from = %previous, to = %contract_id, "execution updated");
        }

        for (key, contract_id) in &plan.retained {
            let (_, contract) = &state.contracts[contract_id];
            let Some(slot) = table.get_mut(key) else {
                unreachable!("retained key {key} has no slot");
            };
            slot.update(*contract_id, contract, state);
        }

        for (key, contract_id) in &plan.creates {
            let (_, contract) = &state.contracts[contract_id];
            let slot = self.create_slot(key, *contract_id, contract, state);
            info!(%key, slot_id = slot.slot_id(), contract = %contract_id, "execution created");
            table.insert(key.clone(), slot);
            self.created.incr();
        }

        ReconcileOutcome {
            created: plan.creates.len(),
            updated: plan.updates.len(),
            to_delete: plan.deletes,
        }
    }

    fn create_slot(
        &mut self,
        key: &ExecutionKey,
        contract_id: ContractId,
        contract: &Contract,
        state: &Arc<TableRaftState>,
    ) -> ExecutionSlot {
        let slot_id = self.next_slot_id;
        self.next_slot_id += 1;

        let namespace = MetricsCollection::new(format!("{}-{slot_id}", key.role.name()));
        let membership = match self.metrics.join(namespace) {
            Ok(m) => m,
            Err(e) => panic!("fresh slot namespace collided: {e}"),
        };
        let store = Arc::new(self.store.subview(key.region.clone()));
        let cards = Arc::new(CardRegistrar::new(Arc::clone(&self.relay)));
        let (contract_id_tx, contract_ids) = watch::channel(contract_id);

        let ctx = ExecutionContext {
            server_id: self.deriver.server_id(),
            key: key.clone(),
            contract_id,
            contract: contract.clone(),
            raft_state: Arc::clone(state),
            send_ack: filtered_ack_callback(
                Arc::clone(&self.relay),
                key.clone(),
                contract_ids.clone(),
            ),
            contract_ids,
            store: Arc::clone(&store),
            metrics: Arc::clone(membership.collection()),
            cards: Arc::clone(&cards),
            remote_bcards: Arc::clone(&self.remote_bcards),
            interruptor: self.interruptor.clone(),
            advertise_addr: self.advertise_addr.clone(),
            erase_chunk_size: self.erase_chunk_size,
        };
        let execution = self.factory.create(ctx);

        ExecutionSlot::new(
            slot_id,
            contract_id_tx,
            contract.clone(),
            execution,
            cards,
            store,
            membership,
        )
    }
}
