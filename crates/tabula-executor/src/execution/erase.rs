//! Erase execution.
//!
//! Deletes every row in the key's region, one chunk per blocking call, and
//! acks `Nothing` when the region is empty. Store errors are logged and the
//! chunk is retried after a pause.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tabula_core::{AckState, Contract, ContractAck, ContractId, TableRaftState};
use tabula_metrics::Counter;
use tabula_store::StoreSubview;

use super::{AckCallback, BoxFuture, Execution, ExecutionContext};
use crate::interrupt::{Interrupted, interruptible};
use crate::key::{ExecutionKey, Role};

const RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct EraseExecution {
    key: ExecutionKey,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EraseExecution {
    pub fn start(ctx: ExecutionContext) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let eraser = Eraser {
            key: ctx.key.clone(),
            store: ctx.store,
            chunk_size: ctx.erase_chunk_size.max(1),
            contract_ids: ctx.contract_ids,
            send_ack: ctx.send_ack,
            keys_erased: ctx.metrics.counter("keys_erased"),
            acks_published: ctx.metrics.counter("acks_published"),
        };
        let task = tokio::spawn(eraser.run(stop_rx));
        info!(key = %ctx.key, "erase started");
        Self {
            key: ctx.key,
            stop_tx,
            task,
        }
    }
}

struct Eraser {
    key: ExecutionKey,
    store: Arc<StoreSubview>,
    chunk_size: usize,
    contract_ids: watch::Receiver<ContractId>,
    send_ack: AckCallback,
    keys_erased: Counter,
    acks_published: Counter,
}

impl Eraser {
    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut total = 0usize;
        loop {
            if *stop.borrow() {
                debug!(key = %self.key, total, "erase stopped early");
                return;
            }
            let store = Arc::clone(&self.store);
            let chunk_size = self.chunk_size;
            match tokio::task::spawn_blocking(move || store.erase_chunk(chunk_size)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    total += n;
                    self.keys_erased.add(n as u64);
                }
                Ok(Err(e)) => {
                    warn!(key = %self.key, error = %e, "erase chunk failed; retrying");
                    if interruptible(tokio::time::sleep(RETRY_DELAY), &mut stop)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "erase chunk task failed");
                    return;
                }
            }
        }

        info!(key = %self.key, total, "region erased");
        let mut acked = None;
        loop {
            let contract_id = *self.contract_ids.borrow_and_update();
            if acked != Some(contract_id) {
                (self.send_ack)(contract_id, ContractAck::new(AckState::Nothing));
                self.acks_published.incr();
                acked = Some(contract_id);
            }
            tokio::select! {
                _ = stop.changed() => return,
                res = self.contract_ids.changed() => if res.is_err() { return },
            }
        }
    }
}

impl Execution for EraseExecution {
    fn role(&self) -> Role {
        Role::Erase
    }

    // The eraser acks each new contract id itself.
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
            info!(key = %self.key, "erase stopped");
            Ok(())
        })
    }
}

impl Drop for EraseExecution {
    fn drop(&mut self) {
        self.task.abort();
    }
}
