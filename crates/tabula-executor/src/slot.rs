//! Execution slots: everything owned on behalf of one execution key.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use tabula_core::{Contract, ContractId, TableRaftState};
use tabula_metrics::{MetricsCollection, Membership};
use tabula_store::StoreSubview;

use crate::execution::{AckCallback, Execution};
use crate::interrupt::Interrupted;
use crate::key::{ExecutionKey, Role};
use crate::relay::{CardRegistrar, ContractRelay};

/// One live execution and the resources held for it.
///
/// Dropping a slot drops the execution first, then withdraws its cards,
/// then releases the store view and the metrics namespace.
pub struct ExecutionSlot {
    slot_id: u64,
    contract_id: watch::Sender<ContractId>,
    contract: Contract,
    execution: Option<Box<dyn Execution>>,
    cards: Arc<CardRegistrar>,
    store: Arc<StoreSubview>,
    membership: Membership,
}

impl ExecutionSlot {
    pub fn new(
        slot_id: u64,
        contract_id: watch::Sender<ContractId>,
        contract: Contract,
        execution: Box<dyn Execution>,
        cards: Arc<CardRegistrar>,
        store: Arc<StoreSubview>,
        membership: Membership,
    ) -> Self {
        Self {
            slot_id,
            contract_id,
            contract,
            execution: Some(execution),
            cards,
            store,
            membership,
        }
    }

    /// Monotonic id, unique within one executor.
    pub fn slot_id(&self) -> u64 {
        self.slot_id
    }

    pub fn contract_id(&self) -> ContractId {
        *self.contract_id.borrow()
    }

    pub fn contract(&self) -> &Contract {
        &self.contract
    }

    pub fn role(&self) -> Option<Role> {
        self.execution.as_ref().map(|e| e.role())
    }

    pub fn store(&self) -> &Arc<StoreSubview> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MetricsCollection> {
        self.membership.collection()
    }

    /// Hand the slot the contract serving its key in a newly applied
    /// snapshot.
    ///
    /// If the contract id moved, acks for the previous one are dropped from
    /// here on.
    pub fn update(&mut self, contract_id: ContractId, contract: &Contract, state: &TableRaftState) {
        self.contract_id.send_if_modified(|current| {
            let moved = *current != contract_id;
            *current = contract_id;
            moved
        });
        self.contract = contract.clone();
        if let Some(execution) = self.execution.as_mut() {
            execution.update(contract_id, contract, state);
        }
    }

    /// Ask the execution to stop and wait for it.
    pub async fn shutdown(&mut self, interruptor: watch::Receiver<bool>) -> Result<(), Interrupted> {
        match self.execution.as_mut() {
            Some(execution) => execution.shutdown(interruptor).await,
            None => Ok(()),
        }
    }
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        drop(self.execution.take());
        self.cards.withdraw_all();
        debug!(slot_id = self.slot_id, "execution slot released");
    }
}

/// The ack callback handed to a slot's execution.
///
/// Acks are written to the relay only while `contract_id` matches the
/// slot's current contract id.
pub fn filtered_ack_callback(
    relay: Arc<ContractRelay>,
    key: ExecutionKey,
    current: watch::Receiver<ContractId>,
) -> AckCallback {
    Arc::new(move |contract_id, ack| {
        let live = *current.borrow();
        if contract_id != live {
            debug!(%key, contract = %contract_id, current = %live, "dropping stale ack");
            return;
        }
        relay.publish_ack(&key, contract_id, ack);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::BoxFuture;
    use crate::execution::testing::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tabula_core::{AckState, ContractAck, ExecutionBcard, Region};
    use tabula_store::Multistore;

    struct CountingExecution {
        drops: Arc<AtomicUsize>,
        updates: Arc<AtomicUsize>,
    }

    impl Execution for CountingExecution {
        fn role(&self) -> Role {
            Role::Primary
        }

        fn update(&mut self, _: ContractId, _: &Contract, _: &TableRaftState) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }

        fn shutdown(&mut self, _: watch::Receiver<bool>) -> BoxFuture<'_, Result<(), Interrupted>> {
            Box::pin(async { Ok(()) })
        }
    }

    impl Drop for CountingExecution {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn key() -> ExecutionKey {
        ExecutionKey {
            region: Region::bounded("a", "m"),
            role: Role::Primary,
            primary: Some(server(1)),
            branch: Some(branch(5)),
        }
    }

    #[test]
    fn stale_acks_are_dropped() {
        let relay = Arc::new(crate::relay::ContractRelay::new(server(1)));
        let (tx, rx) = watch::channel(contract_id(1));
        let send = filtered_ack_callback(Arc::clone(&relay), key(), rx);

        send(contract_id(1), ContractAck::new(AckState::PrimaryReady));
        tx.send_replace(contract_id(2));
        send(contract_id(1), ContractAck::new(AckState::PrimaryNeedBranch));

        assert_eq!(relay.acks().len(), 1);
        assert_eq!(
            relay.acks().get(&(server(1), contract_id(1))).map(|a| a.state),
            Some(AckState::PrimaryReady)
        );
    }

    #[tokio::test]
    async fn drop_releases_execution_then_cards() {
        let relay = Arc::new(crate::relay::ContractRelay::new(server(1)));
        let cards = Arc::new(CardRegistrar::new(Arc::clone(&relay)));
        cards.register_execution_bcard(ExecutionBcard {
            server: server(1),
            branch: branch(5),
            region: Region::bounded("a", "m"),
            address: "h:1".to_string(),
        });
        let root = MetricsCollection::new("table");
        let membership = root.join(MetricsCollection::new("primary-0")).unwrap();
        let drops = Arc::new(AtomicUsize::new(0));
        let updates = Arc::new(AtomicUsize::new(0));
        let store = Multistore::open_in_memory().unwrap();

        let mut slot = ExecutionSlot::new(
            0,
            watch::channel(contract_id(1)).0,
            Contract::new(branch(5)).with_primary(server(1)),
            Box::new(CountingExecution {
                drops: Arc::clone(&drops),
                updates: Arc::clone(&updates),
            }),
            cards,
            Arc::new(store.subview(Region::bounded("a", "m"))),
            membership,
        );

        slot.update(
            contract_id(2),
            &Contract::new(branch(5)).with_primary(server(1)),
            &TableRaftState::empty(2),
        );
        assert_eq!(slot.contract_id(), contract_id(2));
        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert_eq!(slot.shutdown(watch::channel(false).1).await, Ok(()));

        drop(slot);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(relay.execution_bcards().is_empty());
        assert!(root.child_names().is_empty());
    }
}
