//! tabula-core: shared types for the Tabula table contract layer.
//!
//! Everything here is plain data: identifiers, key-space regions, the
//! contracts published by the table's Raft state, the acks executions send
//! back, and the executor's TOML configuration.
//!
//! # Architecture
//!
//! ```text
//! TableRaftState (one committed snapshot)
//!   ├── contracts: ContractId → (Region, Contract)
//!   └── current_branches: RegionMap<BranchId>
//! ```

pub mod config;
pub mod contract;
pub mod ids;
pub mod region;

pub use config::{ExecutorConfig, ReplicaPolicyKind};
pub use contract::{
    AckState, Contract, ContractAck, ExecutionBcard, PrimaryAssignment, TableQueryBcard,
    TableRaftState,
};
pub use ids::{BranchId, ContractId, ServerId};
pub use region::{Region, RegionMap, RightBound, StoreKey};
