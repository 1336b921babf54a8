//! Cooperative interruption.
//!
//! Interruption is signalled through a `watch::Receiver<bool>` flipping to
//! `true`, the same shutdown signal the rest of the daemon uses. Code that
//! can block wraps its wait in [`interruptible`] and unwinds with
//! [`Interrupted`].

use std::future::Future;

use thiserror::Error;
use tokio::sync::watch;

/// The awaited operation was abandoned because interruption was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interrupted")]
pub struct Interrupted;

/// Run `fut` unless `interruptor` fires first.
///
/// Already-set interruption wins without polling `fut`. A dropped sender
/// never interrupts.
pub async fn interruptible<F: Future>(
    fut: F,
    interruptor: &mut watch::Receiver<bool>,
) -> Result<F::Output, Interrupted> {
    if *interruptor.borrow() {
        return Err(Interrupted);
    }
    tokio::select! {
        biased;
        _ = interrupted(interruptor) => Err(Interrupted),
        out = fut => Ok(out),
    }
}

/// Resolves once `interruptor` is set.
pub async fn interrupted(interruptor: &mut watch::Receiver<bool>) {
    if interruptor.wait_for(|set| *set).await.is_err() {
        std::future::pending::<()>().await;
    }
}
