//! The contract executor: one per table replica.
//!
//! Two background tasks:
//!
//! - a subscriber that turns Raft state changes into pump notifications
//! - the update task, which owns the [`ExecutionTable`] and runs passes
//!
//! Each pass reconciles the newest snapshot, then destroys stale slots one
//! at a time. Snapshots arriving mid-pass are coalesced into one more pass,
//! so intermediate snapshots may never be applied but the newest always is.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tabula_core::{ExecutionBcard, ExecutorConfig, RegionMap, ServerId, TableRaftState};
use tabula_metrics::{Counter, MetricsCollection};
use tabula_store::Multistore;

use crate::error::{ExecutorError, ExecutorResult};
use crate::execution::{DefaultExecutionFactory, ExecutionFactory};
use crate::interrupt::{Interrupted, interrupted};
use crate::key::{ExecutionKey, KeyDeriver, ReplicaPolicy};
use crate::pump::{PumpState, UpdatePump};
use crate::reconcile::Reconciler;
use crate::relay::{BcardKey, ContractRelay, WatchableMap};
use crate::table::{ExecutionTable, ShardStatus, SlotSummary, shard_status};

/// Published after every completed pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutorStatus {
    /// Log index of the last snapshot fully applied, deletions included.
    pub applied_index: Option<u64>,
    /// Live slots, in key order.
    pub executions: Vec<SlotSummary>,
}

/// Configures and starts a [`ContractExecutor`].
pub struct ExecutorBuilder {
    config: ExecutorConfig,
    raft_state: watch::Receiver<Arc<TableRaftState>>,
    store: Multistore,
    factory: Arc<dyn ExecutionFactory>,
    policy: Option<Arc<dyn ReplicaPolicy>>,
    metrics: Option<Arc<MetricsCollection>>,
    remote_bcards: Option<Arc<WatchableMap<BcardKey, ExecutionBcard>>>,
}

impl ExecutorBuilder {
    /// Use custom executions instead of the built-in ones.
    pub fn with_factory(mut self, factory: Arc<dyn ExecutionFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Override the wanted-secondary policy named in the config.
    pub fn with_replica_policy(mut self, policy: Arc<dyn ReplicaPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollection>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Peers' execution cards, followed by secondaries.
    pub fn with_remote_bcards(
        mut self,
        remote_bcards: Arc<WatchableMap<BcardKey, ExecutionBcard>>,
    ) -> Self {
        self.remote_bcards = Some(remote_bcards);
        self
    }

    /// Spawn the executor's tasks. Must be called within a Tokio runtime.
    pub fn start(self) -> ContractExecutor {
        let server_id = self.config.server_id;
        let relay = Arc::new(ContractRelay::new(server_id));
        let metrics = self
            .metrics
            .unwrap_or_else(|| MetricsCollection::new("table"));
        let deriver = match self.policy {
            Some(policy) => KeyDeriver::new(server_id, policy),
            None => KeyDeriver::with_policy_kind(server_id, self.config.replica_policy),
        };
        let (interrupt, interruptor) = watch::channel(false);

        let mut reconciler = Reconciler::new(
            &self.config,
            deriver,
            self.store,
            Arc::clone(&relay),
            self.factory,
        )
        .with_metrics(Arc::clone(&metrics))
        .with_interruptor(interruptor.clone());
        if let Some(remote) = self.remote_bcards {
            reconciler = reconciler.with_remote_bcards(remote);
        }

        let pump = Arc::new(UpdatePump::new());
        let (status_tx, status) = watch::channel(ExecutorStatus::default());

        let subscriber = tokio::spawn(forward_changes(
            self.raft_state.clone(),
            Arc::clone(&pump),
            interruptor.clone(),
        ));
        let task = UpdateTask {
            raft_state: self.raft_state,
            pump: Arc::clone(&pump),
            reconciler,
            table: ExecutionTable::new(),
            status: status_tx,
            interruptor,
            passes: metrics.counter("passes"),
            deleted: metrics.counter("deleted"),
        };
        pump.notify();
        let worker = tokio::spawn(task.run());

        info!(%server_id, "contract executor started");
        ContractExecutor {
            server_id,
            relay,
            pump,
            metrics,
            status,
            interrupt,
            worker: Some(worker),
            subscriber: Some(subscriber),
        }
    }
}

/// Keeps this server's executions in line with a table's contracts.
pub struct ContractExecutor {
    server_id: ServerId,
    relay: Arc<ContractRelay>,
    pump: Arc<UpdatePump>,
    metrics: Arc<MetricsCollection>,
    status: watch::Receiver<ExecutorStatus>,
    interrupt: watch::Sender<bool>,
    worker: Option<JoinHandle<ExecutionTable>>,
    subscriber: Option<JoinHandle<()>>,
}

impl ContractExecutor {
    pub fn builder(
        config: ExecutorConfig,
        raft_state: watch::Receiver<Arc<TableRaftState>>,
        store: Multistore,
    ) -> ExecutorBuilder {
        ExecutorBuilder {
            config,
            raft_state,
            store,
            factory: Arc::new(DefaultExecutionFactory),
            policy: None,
            metrics: None,
            remote_bcards: None,
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// The exported ack, execution card, and query card maps.
    pub fn relay(&self) -> &Arc<ContractRelay> {
        &self.relay
    }

    pub fn metrics(&self) -> &Arc<MetricsCollection> {
        &self.metrics
    }

    pub fn pump_state(&self) -> PumpState {
        self.pump.state()
    }

    pub fn status(&self) -> ExecutorStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ExecutorStatus> {
        self.status.clone()
    }

    /// Wait until a snapshot at `log_index` or later has been fully applied.
    pub async fn wait_for_applied(&self, log_index: u64) -> ExecutorResult<ExecutorStatus> {
        let mut status = self.status.clone();
        let reached = status
            .wait_for(|s| s.applied_index.is_some_and(|i| i >= log_index))
            .await
            .map_err(|_| ExecutorError::Stopped)?;
        Ok(reached.clone())
    }

    /// Roles held per stretch of the key space as of the last completed pass.
    pub fn shard_status(&self) -> RegionMap<ShardStatus> {
        let status = self.status.borrow();
        shard_status(status.executions.iter().map(|s| &s.key))
    }

    /// Interrupt any in-flight deletion, wait for the update task to unwind,
    /// then destroy every remaining slot.
    pub async fn shutdown(mut self) {
        self.interrupt.send_replace(true);
        if let Some(subscriber) = self.subscriber.take() {
            subscriber.abort();
        }
        let Some(worker) = self.worker.take() else {
            return;
        };
        match worker.await {
            Ok(table) => {
                let remaining = table.len();
                drop(table);
                info!(server_id = %self.server_id, remaining, "contract executor stopped");
            }
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => warn!(error = %e, "update task cancelled"),
        }
    }
}

impl Drop for ContractExecutor {
    fn drop(&mut self) {
        self.interrupt.send_replace(true);
        if let Some(subscriber) = self.subscriber.take() {
            subscriber.abort();
        }
    }
}

/// Notify the pump whenever a new snapshot is committed.
async fn forward_changes(
    mut raft_state: watch::Receiver<Arc<TableRaftState>>,
    pump: Arc<UpdatePump>,
    mut interruptor: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = interrupted(&mut interruptor) => break,
            res = raft_state.changed() => {
                if res.is_err() {
                    debug!("raft state source closed");
                    break;
                }
                pump.notify();
            }
        }
    }
}

struct UpdateTask {
    raft_state: watch::Receiver<Arc<TableRaftState>>,
    pump: Arc<UpdatePump>,
    reconciler: Reconciler,
    table: ExecutionTable,
    status: watch::Sender<ExecutorStatus>,
    interruptor: watch::Receiver<bool>,
    passes: Counter,
    deleted: Counter,
}

impl UpdateTask {
    async fn run(mut self) -> ExecutionTable {
        'idle: loop {
            tokio::select! {
                biased;
                _ = interrupted(&mut self.interruptor) => break 'idle,
                _ = self.pump.wait_for_work() => {}
            }
            loop {
                if *self.interruptor.borrow() {
                    break 'idle;
                }
                if self.pass().await.is_err() {
                    warn!("update pass interrupted");
                    break 'idle;
                }
                if !self.pump.finish_pass() {
                    break;
                }
            }
        }
        self.table
    }

    async fn pass(&mut self) -> Result<(), Interrupted> {
        let state = Arc::clone(&self.raft_state.borrow_and_update());
        self.passes.incr();
        debug!(log_index = state.log_index, "update pass started");

        let outcome = self.reconciler.reconcile(&state, &mut self.table);
        for key in &outcome.to_delete {
            self.destroy(key).await?;
        }

        self.status.send_replace(ExecutorStatus {
            applied_index: Some(state.log_index),
            executions: self.table.summaries(),
        });
        debug!(
            log_index = state.log_index,
            created = outcome.created,
            updated = outcome.updated,
            deleted = outcome.to_delete.len(),
            live = self.table.len(),
            "update pass finished"
        );
        Ok(())
    }

    /// Shut down one slot and drop it. The slot stays in the table if the
    /// shutdown is interrupted.
    async fn destroy(&mut self, key: &ExecutionKey) -> Result<(), Interrupted> {
        let Some(slot) = self.table.get_mut(key) else {
            unreachable!("delete of {key} has no slot");
        };
        slot.shutdown(self.interruptor.clone()).await?;
        drop(self.table.remove(key));
        self.deleted.incr();
        info!(%key, "execution destroyed");
        Ok(())
    }
}
