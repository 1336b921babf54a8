//! Executor error types.

use thiserror::Error;

/// Errors surfaced by the executor's public API.
///
/// Interruption is not an error; see [`crate::Interrupted`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutorError {
    /// The update task has exited, so the awaited state will never arrive.
    #[error("executor stopped")]
    Stopped,
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
