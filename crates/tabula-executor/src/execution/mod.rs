//! Executions: the work a server does for one execution key.
//!
//! An execution is created from an [`ExecutionContext`] by an
//! [`ExecutionFactory`], handed every later snapshot through
//! [`Execution::update`], and torn down with an interruptible
//! [`Execution::shutdown`] before its slot is dropped.
//!
//! The built-in variants cover the three roles:
//!
//! - [`PrimaryExecution`]: publishes cards and acks readiness
//! - [`SecondaryExecution`]: follows the primary's execution card
//! - [`EraseExecution`]: deletes the region's data in chunks

mod erase;
mod primary;
mod secondary;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;

use tabula_core::{
    Contract, ContractAck, ContractId, ExecutionBcard, ServerId, TableRaftState,
};
use tabula_metrics::MetricsCollection;
use tabula_store::StoreSubview;

use crate::interrupt::Interrupted;
use crate::key::{ExecutionKey, Role};
use crate::relay::{BcardKey, CardRegistrar, WatchableMap};

pub use erase::EraseExecution;
pub use primary::PrimaryExecution;
pub use secondary::SecondaryExecution;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Publishes an ack for a contract.
///
/// The callback handed to an execution drops acks for any contract other
/// than the one its slot currently serves.
pub type AckCallback = Arc<dyn Fn(ContractId, ContractAck) + Send + Sync>;

/// Everything an execution is constructed with.
pub struct ExecutionContext {
    pub server_id: ServerId,
    pub key: ExecutionKey,
    pub contract_id: ContractId,
    pub contract: Contract,
    /// The snapshot the execution was created from.
    pub raft_state: Arc<TableRaftState>,
    /// Follows the slot's current contract id.
    pub contract_ids: watch::Receiver<ContractId>,
    /// Storage narrowed to `key.region`.
    pub store: Arc<StoreSubview>,
    /// The slot's own metrics namespace.
    pub metrics: Arc<MetricsCollection>,
    pub send_ack: AckCallback,
    /// Cards registered here are withdrawn when the slot is destroyed.
    pub cards: Arc<CardRegistrar>,
    /// Execution cards published by peers.
    pub remote_bcards: Arc<WatchableMap<BcardKey, ExecutionBcard>>,
    /// Set when the executor is being torn down.
    pub interruptor: watch::Receiver<bool>,
    pub advertise_addr: String,
    pub erase_chunk_size: usize,
}

/// A running execution.
pub trait Execution: Send {
    fn role(&self) -> Role;

    /// Called on every pass that keeps this execution's key, with the
    /// contract now serving it and the snapshot being applied. Either may
    /// be unchanged since the previous call.
    fn update(
        &mut self,
        contract_id: ContractId,
        contract: &Contract,
        state: &TableRaftState,
    );

    /// Stop all work. Returns once the execution has quiesced, or with
    /// [`Interrupted`] if `interruptor` fires first.
    fn shutdown(
        &mut self,
        interruptor: watch::Receiver<bool>,
    ) -> BoxFuture<'_, Result<(), Interrupted>>;
}

/// Builds the execution for a new slot.
pub trait ExecutionFactory: Send + Sync {
    fn create(&self, ctx: ExecutionContext) -> Box<dyn Execution>;
}

/// Creates the built-in execution for the key's role.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultExecutionFactory;

impl ExecutionFactory for DefaultExecutionFactory {
    fn create(&self, ctx: ExecutionContext) -> Box<dyn Execution> {
        match ctx.key.role {
            Role::Primary => Box::new(PrimaryExecution::start(ctx)),
            Role::Secondary => Box::new(SecondaryExecution::start(ctx)),
            Role::Erase => Box::new(EraseExecution::start(ctx)),
        }
    }
}
