//! A recording in-process stand-in for the CUDA driver.
//!
//! Mirrors the driver's per-thread rule: context-scoped calls fail with
//! CUDA_ERROR_INVALID_CONTEXT unless a live context is current on the calling
//! thread.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, ThreadId};

use cuctx_core::{ContextFlags, ContextHandle, Device, Driver, DriverError, MemInfo};
use parking_lot::Mutex;

pub const INVALID_CONTEXT: i32 = 201;
pub const INVALID_DEVICE: i32 = 101;

#[derive(Default)]
pub struct FakeDriver {
    next_id: AtomicUsize,
    live: Mutex<HashSet<usize>>,
    current: Mutex<HashMap<ThreadId, ContextHandle>>,
    destroyed: Mutex<Vec<ContextHandle>>,
    creates: AtomicUsize,
    double_destroys: AtomicUsize,
    activation_gate: Mutex<Option<mpsc::Receiver<()>>>,
    pub fail_create: AtomicBool,
    pub fail_activate: AtomicBool,
    pub fail_destroy: AtomicBool,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_create() -> Arc<Self> {
        let driver = Self::default();
        driver.fail_create.store(true, Ordering::SeqCst);
        Arc::new(driver)
    }

    pub fn failing_activate() -> Arc<Self> {
        let driver = Self::default();
        driver.fail_activate.store(true, Ordering::SeqCst);
        Arc::new(driver)
    }

    /// Make the next `set_current(Some(..))` block until the returned sender
    /// fires (or is dropped).
    pub fn gate_activation(&self) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        *self.activation_gate.lock() = Some(rx);
        tx
    }

    /// Number of threads that currently have a context bound.
    pub fn bound_threads(&self) -> usize {
        self.current.lock().len()
    }

    pub fn current_on_this_thread(&self) -> Option<ContextHandle> {
        self.current.lock().get(&thread::current().id()).copied()
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn double_destroys(&self) -> usize {
        self.double_destroys.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> Vec<ContextHandle> {
        self.destroyed.lock().clone()
    }

    pub fn is_live(&self, ctx: ContextHandle) -> bool {
        self.live.lock().contains(&(ctx.as_raw() as usize))
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    fn error(code: i32, name: &str, call: &str) -> DriverError {
        DriverError::Call {
            code,
            name: name.to_string(),
            call: call.to_string(),
        }
    }

    fn require_current(&self, call: &str) -> Result<ContextHandle, DriverError> {
        let ctx = self
            .current_on_this_thread()
            .ok_or_else(|| Self::error(INVALID_CONTEXT, "CUDA_ERROR_INVALID_CONTEXT", call))?;
        if !self.is_live(ctx) {
            return Err(Self::error(INVALID_CONTEXT, "CUDA_ERROR_INVALID_CONTEXT", call));
        }
        Ok(ctx)
    }
}

impl Driver for FakeDriver {
    fn create_context(&self, device: Device, _flags: ContextFlags) -> Result<ContextHandle, DriverError> {
        if self.fail_create.load(Ordering::SeqCst) || !(0..=1).contains(&device.ordinal()) {
            return Err(Self::error(INVALID_DEVICE, "CUDA_ERROR_INVALID_DEVICE", "cuCtxCreate"));
        }
        let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1) * 0x1000;
        self.live.lock().insert(id);
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(ContextHandle::from_raw(id as *mut c_void))
    }

    fn set_current(&self, ctx: Option<ContextHandle>) -> Result<(), DriverError> {
        let me = thread::current().id();
        match ctx {
            Some(ctx) => {
                let gate = self.activation_gate.lock().take();
                if let Some(gate) = gate {
                    let _ = gate.recv();
                }
                if self.fail_activate.load(Ordering::SeqCst) || !self.is_live(ctx) {
                    return Err(Self::error(INVALID_CONTEXT, "CUDA_ERROR_INVALID_CONTEXT", "cuCtxSetCurrent"));
                }
                self.current.lock().insert(me, ctx);
            }
            None => {
                self.current.lock().remove(&me);
            }
        }
        Ok(())
    }

    fn destroy_context(&self, ctx: ContextHandle) -> Result<(), DriverError> {
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(Self::error(INVALID_CONTEXT, "CUDA_ERROR_INVALID_CONTEXT", "cuCtxDestroy"));
        }
        if !self.live.lock().remove(&(ctx.as_raw() as usize)) {
            self.double_destroys.fetch_add(1, Ordering::SeqCst);
            return Err(Self::error(INVALID_CONTEXT, "CUDA_ERROR_INVALID_CONTEXT", "cuCtxDestroy"));
        }
        self.destroyed.lock().push(ctx);
        Ok(())
    }

    fn synchronize(&self) -> Result<(), DriverError> {
        self.require_current("cuCtxSynchronize").map(|_| ())
    }

    fn reset_persisting_l2_cache(&self) -> Result<(), DriverError> {
        self.require_current("cuCtxResetPersistingL2Cache").map(|_| ())
    }

    fn mem_get_info(&self) -> Result<MemInfo, DriverError> {
        self.require_current("cuMemGetInfo")?;
        Ok(MemInfo { free: 6 << 30, total: 8 << 30 })
    }

    fn device_count(&self) -> Result<usize, DriverError> {
        Ok(2)
    }

    fn device_name(&self, device: Device) -> Result<String, DriverError> {
        match device.ordinal() {
            0 | 1 => Ok(format!("Fake GPU {}", device.ordinal())),
            other => Err(DriverError::InvalidDevice(other)),
        }
    }
}
