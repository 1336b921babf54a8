//! Secondary execution.
//!
//! Follows the execution card of the key's `(primary, branch)`. While the
//! card is missing the secondary reports that it needs its primary; once the
//! card appears it backfills and then streams. Losing the card drops it back
//! to waiting.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use tabula_core::{AckState, Contract, ContractAck, ContractId, ExecutionBcard, TableRaftState};

use super::{AckCallback, BoxFuture, Execution, ExecutionContext};
use crate::interrupt::{Interrupted, interruptible};
use crate::key::{ExecutionKey, Role};
use crate::relay::{BcardKey, WatchableMap};

pub struct SecondaryExecution {
    key: ExecutionKey,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SecondaryExecution {
    pub fn start(ctx: ExecutionContext) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let follower = Follower {
            key: ctx.key.clone(),
            primary_card: ctx.key.primary.zip(ctx.key.branch),
            remote: ctx.remote_bcards,
            contract_ids: ctx.contract_ids,
            send_ack: ctx.send_ack,
            acks_published: ctx.metrics.counter("acks_published"),
        };
        let task = tokio::spawn(follower.run(stop_rx));
        info!(key = %ctx.key, "secondary started");
        Self {
            key: ctx.key,
            stop_tx,
            task,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NeedPrimary,
    Backfilling,
    Streaming,
}

struct Follower {
    key: ExecutionKey,
    primary_card: Option<BcardKey>,
    remote: Arc<WatchableMap<BcardKey, ExecutionBcard>>,
    contract_ids: watch::Receiver<ContractId>,
    send_ack: AckCallback,
    acks_published: tabula_metrics::Counter,
}

impl Follower {
    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut cards = self.remote.subscribe();
        let mut phase = Phase::NeedPrimary;
        let mut acked: Option<(ContractId, Phase)> = None;

        loop {
            let contract_id = *self.contract_ids.borrow_and_update();
            cards.borrow_and_update();
            let card = self.primary_card.and_then(|k| self.remote.get(&k));

            phase = match (card.is_some(), phase) {
                (false, _) => Phase::NeedPrimary,
                (true, Phase::NeedPrimary) => {
                    self.ack(contract_id, Phase::Backfilling, &mut acked);
                    debug!(key = %self.key, "backfill from primary complete");
                    Phase::Streaming
                }
                (true, p) => p,
            };
            self.ack(contract_id, phase, &mut acked);

            tokio::select! {
                _ = stop.changed() => break,
                res = cards.changed() => if res.is_err() { break },
                res = self.contract_ids.changed() => if res.is_err() { break },
            }
        }
        debug!(key = %self.key, "secondary loop exited");
    }

    fn ack(&self, contract_id: ContractId, phase: Phase, acked: &mut Option<(ContractId, Phase)>) {
        if *acked == Some((contract_id, phase)) {
            return;
        }
        let state = match phase {
            Phase::NeedPrimary => AckState::SecondaryNeedPrimary,
            Phase::Backfilling => AckState::SecondaryBackfilling,
            Phase::Streaming => AckState::SecondaryStreaming,
        };
        let mut ack = ContractAck::new(state);
        if let (Some(branch), Phase::Backfilling | Phase::Streaming) = (self.key.branch, phase) {
            ack = ack.with_branch(branch);
        }
        (self.send_ack)(contract_id, ack);
        self.acks_published.incr();
        *acked = Some((contract_id, phase));
    }
}

impl Execution for SecondaryExecution {
    fn role(&self) -> Role {
        Role::Secondary
    }

    // The follower re-acks on its own when the slot's contract id moves.
    fn update(&mut self, _: ContractId, _: &Contract, _: &TableRaftState) {}

    fn shutdown(
        &mut self,
        mut interruptor: watch::Receiver<bool>,
    ) -> BoxFuture<'_, Result<(), Interrupted>> {
        Box::pin(async move {
            self.stop_tx.send_replace(true);
            if let Err(e) = interruptible(&mut self.task, &mut interruptor).await?
                && e.is_panic()
            {
                std::panic::resume_unwind(e.into_panic());
            }
            info!(key = %self.key, "secondary stopped");
            Ok(())
        })
    }
}

impl Drop for SecondaryExecution {
    fn drop(&mut self) {
        self.task.abort();
    }
}
