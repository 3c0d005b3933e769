use std::fmt;
use std::thread::ThreadId;

use crate::error::ExecutorError;

/// Lifecycle of an [`Executor`](super::Executor).
///
/// ```text
/// Unstarted ──run()──▶ Activating ──ok──▶ Running ──close()──▶ Closed
///     │                    │
///     └──close()──▶ Closed └──activation error──▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorState {
    /// Context created (or adopted); no thread serves it yet.
    Unstarted,
    /// The run loop is making the context current on its thread.
    Activating,
    /// The run loop is serving tasks.
    Running,
    /// Terminal. The context has been released.
    Closed,
}

impl ExecutorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorState::Unstarted => "unstarted",
            ExecutorState::Activating => "activating",
            ExecutorState::Running => "running",
            ExecutorState::Closed => "closed",
        }
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether closing an executor destroys its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HandleOwnership {
    /// The executor destroys the context when it closes.
    #[default]
    Owned,
    /// The context outlives the executor; its creator destroys it.
    Borrowed,
}

/// The OS thread a run loop was started on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerThread {
    pub id: ThreadId,
    pub name: Option<String>,
}

pub(crate) struct Lifecycle {
    pub(crate) state: ExecutorState,
    /// Set once the handle has been destroyed (or handed back, if borrowed).
    pub(crate) released: bool,
    pub(crate) worker: Option<WorkerThread>,
    pub(crate) last_error: Option<ExecutorError>,
    /// Destroy failure waiting to be returned by `close`.
    pub(crate) close_error: Option<ExecutorError>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: ExecutorState::Unstarted,
            released: false,
            worker: None,
            last_error: None,
            close_error: None,
        }
    }

    pub(crate) fn record(&mut self, error: ExecutorError) {
        self.last_error = Some(error);
    }
}
