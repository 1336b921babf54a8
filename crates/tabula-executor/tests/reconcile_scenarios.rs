//! Executor-level reconciliation scenarios.
//!
//! Drives a whole `ContractExecutor` from a watch channel of snapshots,
//! using executions whose shutdown blocks until a test opens a gate.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use tabula_core::{
    BranchId, Contract, ContractId, ExecutorConfig, Region, ServerId, TableRaftState,
};
use tabula_executor::execution::BoxFuture;
use tabula_executor::{
    ContractExecutor, Execution, ExecutionContext, ExecutionFactory, ExecutorStatus, Interrupted,
    PumpState, Role, interruptible,
};
use tabula_store::Multistore;

const ME: u128 = 1;
const WAIT: Duration = Duration::from_secs(5);

fn server(n: u128) -> ServerId {
    ServerId(Uuid::from_u128(n))
}

fn branch(n: u128) -> BranchId {
    BranchId(Uuid::from_u128(n))
}

fn cid(n: u128) -> ContractId {
    ContractId(Uuid::from_u128(n))
}

// ── Gated executions ────────────────────────────────────────────────

struct GatedExecution {
    role: Role,
    gate: watch::Receiver<bool>,
    live: Arc<AtomicUsize>,
}

impl Execution for GatedExecution {
    fn role(&self) -> Role {
        self.role
    }

    fn update(&mut self, _: ContractId, _: &Contract, _: &TableRaftState) {}

    fn shutdown(
        &mut self,
        mut interruptor: watch::Receiver<bool>,
    ) -> BoxFuture<'_, Result<(), Interrupted>> {
        Box::pin(async move {
            let _ = interruptible(self.gate.wait_for(|open| *open), &mut interruptor).await?;
            Ok(())
        })
    }
}

impl Drop for GatedExecution {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct GatedFactory {
    gate: watch::Receiver<bool>,
    live: Arc<AtomicUsize>,
    created: Arc<AtomicUsize>,
}

impl ExecutionFactory for GatedFactory {
    fn create(&self, ctx: ExecutionContext) -> Box<dyn Execution> {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(GatedExecution {
            role: ctx.key.role,
            gate: self.gate.clone(),
            live: Arc::clone(&self.live),
        })
    }
}

struct Fixture {
    snapshots: watch::Sender<Arc<TableRaftState>>,
    gate: watch::Sender<bool>,
    live: Arc<AtomicUsize>,
    created: Arc<AtomicUsize>,
    executor: ContractExecutor,
}

impl Fixture {
    fn start(gate_open: bool) -> Self {
        let (snapshots, rx) = watch::channel(Arc::new(TableRaftState::empty(0)));
        let (gate, gate_rx) = watch::channel(gate_open);
        let live = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));
        let factory = GatedFactory {
            gate: gate_rx,
            live: Arc::clone(&live),
            created: Arc::clone(&created),
        };
        let executor = ContractExecutor::builder(
            ExecutorConfig::new(server(ME)),
            rx,
            Multistore::open_in_memory().unwrap(),
        )
        .with_factory(Arc::new(factory))
        .start();
        Self {
            snapshots,
            gate,
            live,
            created,
            executor,
        }
    }

    fn publish(&self, state: TableRaftState) {
        self.snapshots.send_replace(Arc::new(state));
    }

    async fn apply(&self, state: TableRaftState) -> ExecutorStatus {
        let index = state.log_index;
        self.publish(state);
        tokio::time::timeout(WAIT, self.executor.wait_for_applied(index))
            .await
            .expect("snapshot not applied in time")
            .unwrap()
    }

    fn roles(status: &ExecutorStatus) -> Vec<(Region, Role)> {
        status
            .executions
            .iter()
            .map(|s| (s.key.region.clone(), s.key.role))
            .collect()
    }
}

// ── Snapshots ───────────────────────────────────────────────────────

fn primary_on(b: u128) -> Contract {
    Contract::new(branch(b)).with_primary(server(ME))
}

fn secondary_under(primary: u128, b: u128) -> Contract {
    Contract::new(branch(b))
        .with_primary(server(primary))
        .with_replicas([server(ME)])
}

fn snapshot(index: u64, contracts: Vec<(u128, Region, Contract)>) -> TableRaftState {
    let branches = contracts
        .iter()
        .map(|(_, region, contract)| (region.clone(), contract.branch))
        .collect();
    TableRaftState::new(
        index,
        contracts.into_iter().map(|(id, region, c)| (cid(id), region, c)),
        branches,
    )
}

fn am() -> Region {
    Region::bounded("a", "m")
}

fn mz() -> Region {
    Region::bounded("m", "z")
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn table_matches_each_applied_snapshot() {
    let f = Fixture::start(true);

    let status = f
        .apply(snapshot(
            1,
            vec![
                (0x11, am(), primary_on(5)),
                (0x12, mz(), secondary_under(2, 6)),
            ],
        ))
        .await;
    assert_eq!(
        Fixture::roles(&status),
        vec![(am(), Role::Primary), (mz(), Role::Secondary)]
    );
    assert_eq!(f.live.load(Ordering::SeqCst), 2);

    let status = f.apply(snapshot(2, vec![(0x21, mz(), secondary_under(2, 6))])).await;
    assert_eq!(Fixture::roles(&status), vec![(mz(), Role::Secondary)]);
    assert_eq!(f.live.load(Ordering::SeqCst), 1);

    let status = f.apply(TableRaftState::empty(3)).await;
    assert!(status.executions.is_empty());
    assert_eq!(f.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn contract_id_change_keeps_the_same_slot() {
    let f = Fixture::start(true);
    let before = f.apply(snapshot(1, vec![(0x11, am(), primary_on(5))])).await;
    let after = f.apply(snapshot(2, vec![(0x22, am(), primary_on(5))])).await;

    assert_eq!(before.executions.len(), 1);
    assert_eq!(after.executions.len(), 1);
    assert_eq!(before.executions[0].slot_id, after.executions[0].slot_id);
    assert_eq!(after.executions[0].contract_id, cid(0x22));
    assert_eq!(f.created.load(Ordering::SeqCst), 1);
    assert_eq!(f.executor.metrics().counter("updated").get(), 1);
}

#[tokio::test]
async fn role_change_is_one_delete_and_one_create() {
    let f = Fixture::start(true);
    let before = f.apply(snapshot(1, vec![(0x11, am(), primary_on(5))])).await;
    let after = f.apply(snapshot(2, vec![(0x11, am(), secondary_under(3, 5))])).await;

    assert_eq!(Fixture::roles(&after), vec![(am(), Role::Secondary)]);
    assert_ne!(before.executions[0].slot_id, after.executions[0].slot_id);
    assert_eq!(f.created.load(Ordering::SeqCst), 2);
    assert_eq!(f.live.load(Ordering::SeqCst), 1);
    assert_eq!(f.executor.metrics().counter("deleted").get(), 1);
}

#[tokio::test]
async fn branch_move_recreates_the_execution() {
    let f = Fixture::start(true);
    let before = f.apply(snapshot(1, vec![(0x11, am(), primary_on(5))])).await;
    let after = f.apply(snapshot(2, vec![(0x12, am(), primary_on(6))])).await;

    assert_eq!(after.executions.len(), 1);
    assert_ne!(before.executions[0].slot_id, after.executions[0].slot_id);
    assert_eq!(after.executions[0].key.branch, Some(branch(6)));
}

#[tokio::test]
async fn blocked_deletion_coalesces_later_snapshots() {
    let f = Fixture::start(false);
    f.apply(snapshot(1, vec![(0x11, am(), primary_on(5))])).await;

    // Pass 2 blocks destroying the [a,m) primary.
    f.publish(TableRaftState::empty(2));
    tokio::time::sleep(Duration::from_millis(100)).await;
    f.publish(snapshot(3, vec![(0x31, mz(), primary_on(7))]));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(f.executor.status().applied_index, Some(1));
    assert_eq!(f.executor.pump_state(), PumpState::RunningWithRetrigger);
    assert_eq!(f.live.load(Ordering::SeqCst), 1);
    assert_eq!(f.created.load(Ordering::SeqCst), 1);

    f.gate.send_replace(true);
    let status = tokio::time::timeout(WAIT, f.executor.wait_for_applied(3))
        .await
        .expect("newest snapshot never applied")
        .unwrap();
    assert_eq!(Fixture::roles(&status), vec![(mz(), Role::Primary)]);
    assert_eq!(f.live.load(Ordering::SeqCst), 1);

    tokio::time::timeout(WAIT, async {
        while f.executor.pump_state() != PumpState::Idle {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pump never went idle");
}

#[tokio::test]
async fn shutdown_interrupts_blocked_deletion() {
    let f = Fixture::start(false);
    f.apply(snapshot(
        1,
        vec![
            (0x11, am(), primary_on(5)),
            (0x12, mz(), secondary_under(2, 6)),
        ],
    ))
    .await;
    f.publish(TableRaftState::empty(2));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let Fixture {
        live,
        executor,
        gate: _gate,
        ..
    } = f;
    tokio::time::timeout(WAIT, executor.shutdown())
        .await
        .expect("shutdown hung on a blocked deletion");
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn shard_status_follows_applied_table() {
    let f = Fixture::start(true);
    f.apply(snapshot(
        1,
        vec![
            (0x11, am(), primary_on(5)),
            (0x12, mz(), secondary_under(2, 6)),
        ],
    ))
    .await;

    let status = f.executor.shard_status();
    let primary = status.get(&am()).unwrap();
    let secondary = status.get(&mz()).unwrap();
    assert!(primary.primary && !primary.secondary);
    assert!(secondary.secondary && !secondary.primary);
    assert_eq!(status.get(&Region::from_key("z")).map(|s| s.primary), Some(false));
}

#[tokio::test]
async fn slot_namespaces_are_registered_and_released() {
    let f = Fixture::start(true);
    f.apply(snapshot(1, vec![(0x11, am(), primary_on(5))])).await;
    assert_eq!(f.executor.metrics().child_names(), vec!["primary-0".to_string()]);

    f.apply(snapshot(2, vec![(0x11, am(), secondary_under(3, 5))])).await;
    assert_eq!(
        f.executor.metrics().child_names(),
        vec!["secondary-1".to_string()]
    );
    assert!(f.executor.metrics().counter("passes").get() >= 2);
}

#[tokio::test]
async fn status_channel_closes_on_shutdown() {
    let f = Fixture::start(true);
    f.apply(snapshot(1, vec![(0x11, am(), primary_on(5))])).await;
    let mut status = f.executor.subscribe_status();

    let Fixture { executor, live, .. } = f;
    executor.shutdown().await;
    assert_eq!(live.load(Ordering::SeqCst), 0);
    assert!(status.wait_for(|s| s.applied_index == Some(99)).await.is_err());
}
