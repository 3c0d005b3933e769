//! Thread-confined execution of work against one driver context.
//!
//! The CUDA driver ties a context to the thread it is current on. An
//! [`Executor`] owns one context and one dedicated OS thread with that
//! context current, and funnels every operation on the context through a
//! FIFO queue served by that thread:
//!
//! ```text
//!  caller A ──submit──┐                      ┌──────────────────────────┐
//!  caller B ──submit──┼──▶ [task][task]… ──▶ │ dedicated thread         │
//!  caller C ──submit──┘        queue         │ ctx current, one at once │
//!       ▲                                    └────────────┬─────────────┘
//!       └───────────────── per-task reply ◀───────────────┘
//! ```
//!
//! Callers block in [`Executor::submit`] until their own task has run, so
//! concurrent callers are serialized in arrival order and no two tasks ever
//! run at the same time.

mod reply;
mod state;
mod task;

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use self::reply::Ack;
use self::state::Lifecycle;
use self::task::{invoke, Job, Message};
use crate::config::{default_thread_name, ExecutorConfig};
use crate::device::{ContextFlags, Device};
use crate::driver::{ContextHandle, Driver, MemInfo};
use crate::error::ExecutorError;

pub use self::state::{ExecutorState, HandleOwnership, WorkerThread};
pub use self::task::CurrentContext;

/// Sending half of the channel [`Executor::run`] reports activation on.
///
/// Receives `Ok(())` once the context is current on the run loop's thread,
/// or the activation error.
pub type ReadySender = Sender<Result<(), ExecutorError>>;

/// State shared between the executor handle and its run loop.
struct Shared {
    driver: Arc<dyn Driver>,
    handle: ContextHandle,
    device: Device,
    flags: ContextFlags,
    ownership: HandleOwnership,
    lifecycle: Mutex<Lifecycle>,
    /// Present until close. Submitters hold the read side for the whole
    /// enqueue-and-wait; close takes the write side.
    sender: RwLock<Option<Sender<Message>>>,
    /// Handed to the run loop when it starts.
    receiver: Mutex<Option<Receiver<Message>>>,
}

impl Shared {
    /// True when called from inside a task on this executor's own thread.
    fn on_worker_thread(&self) -> bool {
        let lifecycle = self.lifecycle.lock();
        lifecycle.state == ExecutorState::Running
            && lifecycle
                .worker
                .as_ref()
                .is_some_and(|worker| worker.id == thread::current().id())
    }

    fn current_context(&self) -> CurrentContext<'_> {
        CurrentContext::new(self.handle, self.device, self.flags, &*self.driver)
    }

    /// Claim the run loop: `Unstarted → Activating`, recording this thread.
    fn begin_activation(&self) -> Result<Receiver<Message>, ExecutorError> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            ExecutorState::Unstarted => {}
            ExecutorState::Closed => return Err(ExecutorError::Closed),
            ExecutorState::Activating | ExecutorState::Running => {
                return Err(ExecutorError::AlreadyStarted)
            }
        }
        let receiver = self.receiver.lock().take().ok_or(ExecutorError::Closed)?;
        let current = thread::current();
        lifecycle.state = ExecutorState::Activating;
        lifecycle.worker = Some(WorkerThread {
            id: current.id(),
            name: current.name().map(str::to_string),
        });
        Ok(receiver)
    }

    fn run(&self, ready: Option<ReadySender>) -> Result<(), ExecutorError> {
        let receiver = match self.begin_activation() {
            Ok(receiver) => receiver,
            Err(e) => return report_ready(ready, e),
        };

        if let Err(e) = self.driver.set_current(Some(self.handle)) {
            let err = ExecutorError::Activate(e);
            tracing::error!("{}: {}", self.device, err);
            self.finish(Some(err.clone()));
            // Anything queued before activation answers `Closed`.
            drop(receiver);
            return report_ready(ready, err);
        }

        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == ExecutorState::Activating {
                lifecycle.state = ExecutorState::Running;
            }
        }
        tracing::info!(
            "executor for {} running on thread {}",
            self.device,
            thread::current().name().unwrap_or("<unnamed>")
        );
        if let Some(ready) = ready {
            let _ = ready.send(Ok(()));
        }

        let cx = self.current_context();
        let mut shutdown = None;
        while let Ok(message) = receiver.recv() {
            match message {
                Message::Task(job) => {
                    tracing::trace!("{}: running task", self.device);
                    job.run(&cx, &|failure| self.record_task_failure(failure));
                }
                Message::Shutdown(ack) => {
                    shutdown = Some(ack);
                    break;
                }
            }
        }
        drop(cx);

        if let Err(e) = self.driver.set_current(None) {
            tracing::warn!("{}: failed to unbind context on exit: {}", self.device, e);
        }
        self.finish(None);
        drop(receiver);
        tracing::info!("executor for {} stopped", self.device);
        // The closer is released only after the context is gone.
        drop(shutdown);
        Ok(())
    }

    fn record_task_failure(&self, failure: ExecutorError) {
        tracing::warn!("{}: {}", self.device, failure);
        self.lifecycle.lock().record(failure);
    }

    /// Release the handle and enter `Closed`.
    fn finish(&self, error: Option<ExecutorError>) {
        let released = self.release_handle();
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = ExecutorState::Closed;
        if let Some(error) = error {
            lifecycle.record(error);
        }
        if let Err(error) = released {
            lifecycle.record(error.clone());
            lifecycle.close_error = Some(error);
        }
    }

    /// Destroy the context if owned. Runs at most once.
    fn release_handle(&self) -> Result<(), ExecutorError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.released {
                return Ok(());
            }
            lifecycle.released = true;
        }
        match self.ownership {
            HandleOwnership::Borrowed => {
                tracing::debug!("{}: leaving borrowed context {:?} to its owner", self.device, self.handle);
                Ok(())
            }
            HandleOwnership::Owned => {
                self.driver
                    .destroy_context(self.handle)
                    .map_err(ExecutorError::Destroy)?;
                tracing::debug!("{}: destroyed context {:?}", self.device, self.handle);
                Ok(())
            }
        }
    }
}

fn report_ready(ready: Option<ReadySender>, error: ExecutorError) -> Result<(), ExecutorError> {
    if let Some(ready) = ready {
        let _ = ready.send(Err(error.clone()));
    }
    Err(error)
}

/// Settings that shape the dedicated thread and default deadlines.
struct Options {
    thread_name: String,
    stack_size: Option<usize>,
    submit_timeout: Option<Duration>,
}

impl Options {
    fn for_device(device: Device) -> Self {
        Self {
            thread_name: default_thread_name(device),
            stack_size: None,
            submit_timeout: None,
        }
    }
}

/// A driver context confined to one dedicated thread.
///
/// All work against the context goes through [`submit`](Self::submit) (or the
/// helpers built on it). The executor is `Send + Sync`; share it with an
/// `Arc` to submit from many threads.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use cuctx_core::{ContextFlags, CudaDriver, Device, Executor};
///
/// let driver = Arc::new(CudaDriver::load()?);
/// let ctx = Executor::new(driver, Device(0), ContextFlags::SCHED_AUTO)?;
/// let info = ctx.submit(|cx| cx.mem_info())??;
/// println!("{} MiB free", info.free >> 20);
/// ctx.close()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Executor {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Serializes concurrent `close` calls.
    close_lock: Mutex<()>,
    options: Options,
}

impl Executor {
    /// Create a context on `device` and serve it from a new dedicated thread.
    ///
    /// Returns once the context is current on that thread. Creation and
    /// activation failures are returned; in either case no thread is left
    /// running and the context is not leaked.
    pub fn new(driver: Arc<dyn Driver>, device: Device, flags: ContextFlags) -> Result<Self, ExecutorError> {
        let executor = Self::new_manual(driver, device, flags)?;
        executor.start_or_close()?;
        Ok(executor)
    }

    /// Create a context without starting a thread.
    ///
    /// The caller drives [`run`](Self::run) on the thread it wants bound,
    /// e.g. the process's main thread.
    pub fn new_manual(
        driver: Arc<dyn Driver>,
        device: Device,
        flags: ContextFlags,
    ) -> Result<Self, ExecutorError> {
        Self::create(driver, device, flags, Options::for_device(device))
    }

    /// Wrap an existing context without creating one.
    ///
    /// The executor starts `Unstarted`; call [`start`](Self::start) or
    /// [`run`](Self::run). `ownership` decides whether closing destroys it.
    pub fn adopt(
        driver: Arc<dyn Driver>,
        device: Device,
        handle: ContextHandle,
        flags: ContextFlags,
        ownership: HandleOwnership,
    ) -> Self {
        tracing::debug!("{}: adopting context {:?} ({:?})", device, handle, ownership);
        Self::from_parts(driver, device, handle, flags, ownership, Options::for_device(device))
    }

    /// Create an executor as described by `config`.
    pub fn with_config(driver: Arc<dyn Driver>, config: &ExecutorConfig) -> Result<Self, ExecutorError> {
        let flags = config
            .context_flags()
            .map_err(|e| ExecutorError::InvalidConfig(e.to_string()))?;
        let options = Options {
            thread_name: config.thread_name(),
            stack_size: config.stack_size,
            submit_timeout: config.submit_timeout(),
        };
        let executor = Self::create(driver, config.device(), flags, options)?;
        if config.auto_run {
            executor.start_or_close()?;
        }
        Ok(executor)
    }

    fn create(
        driver: Arc<dyn Driver>,
        device: Device,
        flags: ContextFlags,
        options: Options,
    ) -> Result<Self, ExecutorError> {
        let handle = driver.create_context(device, flags).map_err(|e| {
            tracing::error!("{}: context creation failed: {}", device, e);
            ExecutorError::Create(e)
        })?;
        tracing::debug!("{}: created context {:?} with flags {}", device, handle, flags);
        Ok(Self::from_parts(driver, device, handle, flags, HandleOwnership::Owned, options))
    }

    fn from_parts(
        driver: Arc<dyn Driver>,
        device: Device,
        handle: ContextHandle,
        flags: ContextFlags,
        ownership: HandleOwnership,
        options: Options,
    ) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            shared: Arc::new(Shared {
                driver,
                handle,
                device,
                flags,
                ownership,
                lifecycle: Mutex::new(Lifecycle::new()),
                sender: RwLock::new(Some(sender)),
                receiver: Mutex::new(Some(receiver)),
            }),
            worker: Mutex::new(None),
            close_lock: Mutex::new(()),
            options,
        }
    }

    fn start_or_close(&self) -> Result<(), ExecutorError> {
        if let Err(e) = self.start() {
            // Releases the context if the thread never got to it.
            let _ = self.close();
            return Err(e);
        }
        Ok(())
    }

    /// Spawn the dedicated thread for an `Unstarted` executor and wait until
    /// the context is current on it.
    pub fn start(&self) -> Result<(), ExecutorError> {
        match self.state() {
            ExecutorState::Unstarted => {}
            ExecutorState::Closed => return Err(ExecutorError::Closed),
            ExecutorState::Activating | ExecutorState::Running => {
                return Err(ExecutorError::AlreadyStarted)
            }
        }

        let (ready_tx, ready_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let mut builder = thread::Builder::new().name(self.options.thread_name.clone());
        if let Some(size) = self.options.stack_size {
            builder = builder.stack_size(size);
        }
        let handle = builder
            .spawn(move || {
                let _ = shared.run(Some(ready_tx));
            })
            .map_err(|e| ExecutorError::Spawn(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(ExecutorError::Spawn("executor thread exited before activation".into()))
            }
        }
    }

    /// Run the serving loop on the calling thread until the executor closes.
    ///
    /// Makes the context current here, reports readiness through `ready` (if
    /// given), then executes submitted tasks one at a time in arrival order.
    /// An activation failure is sent through `ready` as well as returned, and
    /// closes the executor.
    ///
    /// Must not be called from inside an async runtime's worker thread; it
    /// blocks for the executor's whole lifetime.
    pub fn run(&self, ready: Option<ReadySender>) -> Result<(), ExecutorError> {
        self.shared.run(ready)
    }

    /// Run `task` on the dedicated thread and return its result.
    ///
    /// Blocks until the task has run. Tasks from all callers run one at a
    /// time in arrival order. The task's return value is passed back
    /// unchanged, so a task returning `Result<T, E>` yields
    /// `Ok(Result<T, E>)`.
    ///
    /// Fails with [`ExecutorError::Closed`] once the executor is closed, and
    /// [`ExecutorError::TaskPanicked`] if the task panicked. Called from
    /// inside one of this executor's tasks, `task` runs inline.
    pub fn submit<F, R>(&self, task: F) -> Result<R, ExecutorError>
    where
        F: FnOnce(&CurrentContext<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.dispatch(task, None)
    }

    /// Like [`submit`](Self::submit), but stop waiting after `timeout`.
    ///
    /// A timed-out task is not cancelled; it still runs, and its result is
    /// discarded. Tasks that may take long should check their own deadline.
    pub fn submit_timeout<F, R>(&self, task: F, timeout: Duration) -> Result<R, ExecutorError>
    where
        F: FnOnce(&CurrentContext<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.dispatch(task, Some(timeout))
    }

    /// [`submit`](Self::submit) with the configured default deadline, if any.
    pub fn submit_default<F, R>(&self, task: F) -> Result<R, ExecutorError>
    where
        F: FnOnce(&CurrentContext<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.dispatch(task, self.options.submit_timeout)
    }

    fn dispatch<F, R>(&self, task: F, timeout: Option<Duration>) -> Result<R, ExecutorError>
    where
        F: FnOnce(&CurrentContext<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.shared.on_worker_thread() {
            // Queueing would wait on the task that is doing the waiting.
            let outcome = invoke(task, &self.shared.current_context());
            if let Err(failure) = &outcome {
                self.shared.record_task_failure(failure.clone());
            }
            return outcome;
        }

        let sender = self.shared.sender.read();
        let sender = sender.as_ref().ok_or(ExecutorError::Closed)?;
        let (job, reply) = Job::new(task);
        sender
            .send(Message::Task(job))
            .map_err(|_| ExecutorError::Closed)?;

        match timeout {
            None => reply.wait(),
            Some(timeout) => reply
                .wait_for(timeout)
                .unwrap_or(Err(ExecutorError::Timeout(timeout))),
        }
    }

    /// Stop the run loop and release the context.
    ///
    /// Waits for submissions already in flight to finish, then for the loop
    /// to exit and the context to be destroyed. Idempotent: closing a closed
    /// executor returns `Ok(())`. A destroy failure is returned (and kept as
    /// [`last_error`](Self::last_error)), but the executor is closed anyway.
    ///
    /// Cannot be called from inside one of the executor's own tasks.
    pub fn close(&self) -> Result<(), ExecutorError> {
        if self.shared.on_worker_thread() {
            return Err(ExecutorError::CloseOnWorker);
        }
        let _closing = self.close_lock.lock();

        let unstarted_receiver = {
            let mut lifecycle = self.shared.lifecycle.lock();
            match lifecycle.state {
                ExecutorState::Closed => return Ok(()),
                ExecutorState::Unstarted => {
                    lifecycle.state = ExecutorState::Closed;
                    Some(self.shared.receiver.lock().take())
                }
                ExecutorState::Activating | ExecutorState::Running => None,
            }
        };
        tracing::debug!("{}: closing executor", self.shared.device);

        match unstarted_receiver {
            Some(receiver) => {
                // No loop will ever drain this queue; fail what is in it.
                drop(receiver);
                self.shared.sender.write().take();
                if let Err(e) = self.shared.release_handle() {
                    self.shared.lifecycle.lock().record(e.clone());
                    return Err(e);
                }
                Ok(())
            }
            None => {
                let sender = self.shared.sender.write().take();
                if let Some(sender) = sender {
                    let (ack, done) = Ack::new();
                    // If the loop already dropped its queue, the returned
                    // message drops here and fires the ack itself.
                    let _ = sender.send(Message::Shutdown(ack));
                    drop(sender);
                    done.wait();
                }
                if let Some(handle) = self.worker.lock().take() {
                    let _ = handle.join();
                }
                match self.shared.lifecycle.lock().close_error.take() {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }

    /// Reset all persisting lines in the L2 cache to normal.
    pub fn reset_l2_cache(&self) -> Result<(), ExecutorError> {
        Ok(self.submit(|cx| cx.driver().reset_persisting_l2_cache())??)
    }

    /// Block until all work queued on the context has completed.
    pub fn synchronize(&self) -> Result<(), ExecutorError> {
        Ok(self.submit(|cx| cx.synchronize())??)
    }

    /// Free and total memory of the context's device.
    pub fn mem_info(&self) -> Result<MemInfo, ExecutorError> {
        Ok(self.submit(|cx| cx.mem_info())??)
    }

    pub fn state(&self) -> ExecutorState {
        self.shared.lifecycle.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ExecutorState::Closed
    }

    /// Most recent executor-level error (activation, destroy, panic).
    pub fn last_error(&self) -> Option<ExecutorError> {
        self.shared.lifecycle.lock().last_error.clone()
    }

    pub fn device(&self) -> Device {
        self.shared.device
    }

    pub fn flags(&self) -> ContextFlags {
        self.shared.flags
    }

    pub fn handle(&self) -> ContextHandle {
        self.shared.handle
    }

    pub fn ownership(&self) -> HandleOwnership {
        self.shared.ownership
    }

    /// The thread the run loop was started on, once it has started.
    pub fn worker_thread(&self) -> Option<WorkerThread> {
        self.shared.lifecycle.lock().worker.clone()
    }

    /// Name given to the dedicated thread by [`start`](Self::start).
    pub fn thread_name(&self) -> &str {
        &self.options.thread_name
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.options.submit_timeout
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("device", &self.shared.device)
            .field("flags", &self.shared.flags)
            .field("handle", &self.shared.handle)
            .field("ownership", &self.shared.ownership)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if self.shared.on_worker_thread() {
            // Dropped by one of its own tasks. Disconnect the queue so the
            // loop exits, and releases the context, after this task.
            if let Some(mut sender) = self.shared.sender.try_write() {
                sender.take();
            }
            tracing::warn!(
                "{}: executor dropped on its own thread; context released when the loop exits",
                self.shared.device
            );
            return;
        }
        tracing::debug!("{}: finalizing executor that was never closed", self.shared.device);
        if let Err(e) = self.close() {
            tracing::warn!("{}: close during drop failed: {}", self.shared.device, e);
        }
    }
}
