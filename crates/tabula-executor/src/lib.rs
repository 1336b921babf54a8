//! tabula-executor: per-table contract execution.
//!
//! Each server runs one [`ContractExecutor`] per table it replicates. The
//! executor watches the table's committed Raft state, works out which role
//! this server plays for every region (primary, secondary, or erase), and
//! keeps one live execution per role assignment. It also relays the acks
//! and cards those executions produce.
//!
//! - Derives a stable [`ExecutionKey`] per (region, contract, branch)
//! - Creates and updates executions without blocking
//! - Destroys stale executions one at a time, interruptibly
//! - Exports acks, execution cards and query cards as watchable maps
//!
//! # Architecture
//!
//! ```text
//! ContractExecutor
//!   ├── UpdatePump (idle / running / running + retrigger)
//!   ├── update task (sole owner of the ExecutionTable)
//!   │     ├── Reconciler → creates, updates, delete set
//!   │     └── blocking deletes, one slot at a time
//!   ├── ExecutionTable: ExecutionKey → ExecutionSlot
//!   │     └── ExecutionSlot
//!   │           ├── StoreSubview (the key's region)
//!   │           ├── Membership (metrics namespace "{role}-{n}")
//!   │           ├── CardRegistrar (cards to withdraw on destroy)
//!   │           └── Box<dyn Execution>
//!   └── ContractRelay
//!         ├── acks: (server, contract) → ContractAck
//!         ├── execution_bcards: (server, branch) → ExecutionBcard
//!         └── query_bcards: uuid → TableQueryBcard
//! ```

pub mod error;
pub mod execution;
pub mod executor;
pub mod interrupt;
pub mod key;
pub mod pump;
pub mod reconcile;
pub mod relay;
pub mod slot;
pub mod table;

pub use error::{ExecutorError, ExecutorResult};
pub use execution::{
    AckCallback, DefaultExecutionFactory, Execution, ExecutionContext, ExecutionFactory,
};
pub use executor::{ContractExecutor, ExecutorBuilder, ExecutorStatus};
pub use interrupt::{Interrupted, interruptible};
pub use key::{ExecutionKey, KeyDeriver, ReplicaMembership, ReplicaPolicy, Role, VotingReplicas};
pub use pump::{PumpState, UpdatePump};
pub use reconcile::{ReconcileOutcome, ReconcilePlan, Reconciler};
pub use relay::{AckKey, BcardKey, CardRegistrar, ContractRelay, WatchableMap};
pub use slot::ExecutionSlot;
pub use table::{ExecutionTable, ShardStatus, SlotSummary};
