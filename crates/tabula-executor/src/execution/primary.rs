//! Primary execution.
//!
//! A primary on the authoritative branch is ready at once. A primary whose
//! contract still names another branch proposes a new one and waits for the
//! coordinator to register it; the registration changes the key, so the
//! ready primary is a different execution.

use tokio::sync::watch;
use tracing::info;

use tabula_core::{
    AckState, BranchId, Contract, ContractAck, ContractId, ExecutionBcard, TableQueryBcard,
    TableRaftState,
};
use tabula_metrics::Counter;

use super::{AckCallback, BoxFuture, Execution, ExecutionContext};
use crate::interrupt::Interrupted;
use crate::key::{ExecutionKey, Role};

pub struct PrimaryExecution {
    key: ExecutionKey,
    /// Branch offered to the coordinator when the contract's branch is not
    /// authoritative. Stable for the life of the execution.
    proposed_branch: BranchId,
    send_ack: AckCallback,
    /// Last ack sent, so unchanged snapshots do not resend it.
    acked: Option<(ContractId, ContractAck)>,
    acks_published: Counter,
}

impl PrimaryExecution {
    pub fn start(ctx: ExecutionContext) -> Self {
        let proposed_branch = BranchId::new_random();
        let serving = ctx.key.branch.unwrap_or(proposed_branch);

        ctx.cards.register_execution_bcard(ExecutionBcard {
            server: ctx.server_id,
            branch: serving,
            region: ctx.key.region.clone(),
            address: ctx.advertise_addr.clone(),
        });
        ctx.cards.register_query_bcard(TableQueryBcard {
            server: ctx.server_id,
            region: ctx.key.region.clone(),
            address: ctx.advertise_addr.clone(),
        });
        info!(key = %ctx.key, branch = %serving, "primary started");

        let mut this = Self {
            key: ctx.key,
            proposed_branch,
            send_ack: ctx.send_ack,
            acked: None,
            acks_published: ctx.metrics.counter("acks_published"),
        };
        this.ack(ctx.contract_id, &ctx.contract);
        this
    }

    fn ack(&mut self, contract_id: ContractId, contract: &Contract) {
        let ack = match self.key.branch {
            Some(current) if current == contract.branch => {
                ContractAck::new(AckState::PrimaryReady).with_branch(current)
            }
            _ => ContractAck::new(AckState::PrimaryNeedBranch).with_branch(self.proposed_branch),
        };
        if self.acked.as_ref().is_some_and(|(c, a)| *c == contract_id && *a == ack) {
            return;
        }
        (self.send_ack)(contract_id, ack.clone());
        self.acks_published.incr();
        self.acked = Some((contract_id, ack));
    }
}

impl Execution for PrimaryExecution {
    fn role(&self) -> Role {
        Role::Primary
    }

    fn update(&mut self, contract_id: ContractId, contract: &Contract, _: &TableRaftState) {
        self.ack(contract_id, contract);
    }

    fn shutdown(
        &mut self,
        _interruptor: watch::Receiver<bool>,
    ) -> BoxFuture<'_, Result<(), Interrupted>> {
        info!(key = %self.key, "primary stopped");
        Box::pin(async { Ok(()) })
    }
}
