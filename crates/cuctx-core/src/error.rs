use std::time::Duration;

use crate::driver::DriverError;

/// Errors surfaced by an [`Executor`](crate::Executor).
///
/// Failures of the submitted closures themselves are not represented here:
/// a closure's return value reaches the caller untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("context creation failed: {0}")]
    Create(#[source] DriverError),

    #[error("context activation failed: {0}")]
    Activate(#[source] DriverError),

    #[error("context destruction failed: {0}")]
    Destroy(#[source] DriverError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("executor closed")]
    Closed,

    #[error("executor run loop already started")]
    AlreadyStarted,

    #[error("close called from the executor's own thread")]
    CloseOnWorker,

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    #[error("timed out after {0:?} waiting for task result")]
    Timeout(Duration),

    #[error("failed to spawn executor thread: {0}")]
    Spawn(String),

    #[error("invalid executor config: {0}")]
    InvalidConfig(String),
}

impl ExecutorError {
    pub fn is_closed(&self) -> bool {
        matches!(self, ExecutorError::Closed)
    }
}

/// Errors loading an [`ExecutorConfig`](crate::ExecutorConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown context flag '{0}'")]
    Flag(String),
}
