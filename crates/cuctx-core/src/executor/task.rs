//! Queued work and the view of the context tasks run against.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::reply::{Ack, Reply};
use crate::device::{ContextFlags, Device};
use crate::driver::{ContextHandle, Driver, DriverError, MemInfo};
use crate::error::ExecutorError;

/// The executor's context, as seen from inside a task.
///
/// Only exists on the dedicated thread while the context is current there,
/// and cannot leave it.
pub struct CurrentContext<'a> {
    handle: ContextHandle,
    device: Device,
    flags: ContextFlags,
    driver: &'a dyn Driver,
    _thread_bound: PhantomData<*const ()>,
}

impl<'a> CurrentContext<'a> {
    pub(crate) fn new(
        handle: ContextHandle,
        device: Device,
        flags: ContextFlags,
        driver: &'a dyn Driver,
    ) -> Self {
        Self {
            handle,
            device,
            flags,
            driver,
            _thread_bound: PhantomData,
        }
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn flags(&self) -> ContextFlags {
        self.flags
    }

    /// The driver, for calls that act on the current context.
    pub fn driver(&self) -> &'a dyn Driver {
        self.driver
    }

    pub fn synchronize(&self) -> Result<(), DriverError> {
        self.driver.synchronize()
    }

    pub fn mem_info(&self) -> Result<MemInfo, DriverError> {
        self.driver.mem_get_info()
    }
}

impl std::fmt::Debug for CurrentContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CurrentContext")
            .field("handle", &self.handle)
            .field("device", &self.device)
            .field("flags", &self.flags)
            .finish()
    }
}

pub(crate) enum Message {
    Task(Box<dyn Runnable>),
    Shutdown(Ack),
}

pub(crate) trait Runnable: Send {
    /// Run the task and answer its caller. An executor-level failure is
    /// passed to `record` before the caller is woken.
    fn run(self: Box<Self>, cx: &CurrentContext<'_>, record: &dyn Fn(ExecutorError));
}

/// A submitted closure plus the slot its caller waits on.
///
/// A job dropped without running answers `Closed`, so a caller is never left
/// waiting on a queue nobody will drain.
pub(crate) struct Job<F, R> {
    task: Option<F>,
    reply: Arc<Reply<Result<R, ExecutorError>>>,
}

impl<F, R> Job<F, R>
where
    F: FnOnce(&CurrentContext<'_>) -> R + Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn new(task: F) -> (Box<Self>, Arc<Reply<Result<R, ExecutorError>>>) {
        let reply = Reply::new();
        let job = Box::new(Self {
            task: Some(task),
            reply: Arc::clone(&reply),
        });
        (job, reply)
    }
}

impl<F, R> Runnable for Job<F, R>
where
    F: FnOnce(&CurrentContext<'_>) -> R + Send + 'static,
    R: Send + 'static,
{
    fn run(mut self: Box<Self>, cx: &CurrentContext<'_>, record: &dyn Fn(ExecutorError)) {
        let Some(task) = self.task.take() else {
            return;
        };
        let outcome = invoke(task, cx);
        if let Err(failure) = &outcome {
            record(failure.clone());
        }
        self.reply.send(outcome);
    }
}

impl<F, R> Drop for Job<F, R> {
    fn drop(&mut self) {
        if self.task.take().is_some() {
            self.reply.send(Err(ExecutorError::Closed));
        }
    }
}

/// Run a task, turning a panic into `TaskPanicked` so the loop survives it.
pub(crate) fn invoke<F, R>(task: F, cx: &CurrentContext<'_>) -> Result<R, ExecutorError>
where
    F: FnOnce(&CurrentContext<'_>) -> R,
{
    panic::catch_unwind(AssertUnwindSafe(|| task(cx)))
        .map_err(|payload| ExecutorError::TaskPanicked(panic_message(payload.as_ref())))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
