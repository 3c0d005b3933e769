//! The driver capability set an [`Executor`](crate::Executor) is built on.
//!
//! The executor never calls into CUDA directly. Context creation, binding,
//! destruction and the context-scoped calls the helpers use all go through
//! the [`Driver`] trait, so the confinement logic does not depend on how (or
//! whether) `libcuda` was loaded.

use std::ffi::c_void;
use std::fmt;

use crate::device::{ContextFlags, Device};

/// Opaque handle to a created driver context (`CUcontext`).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(*mut c_void);

// A CUcontext is an opaque token; the driver itself decides which thread may
// use it. Moving the token between threads is always allowed.
unsafe impl Send for ContextHandle {}
unsafe impl Sync for ContextHandle {}

impl ContextHandle {
    /// Wrap a raw `CUcontext`.
    pub fn from_raw(raw: *mut c_void) -> Self {
        Self(raw)
    }

    /// The raw `CUcontext`.
    pub fn as_raw(&self) -> *mut c_void {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextHandle({:p})", self.0)
    }
}

/// Free and total memory of the device backing the current context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub free: usize,
    pub total: usize,
}

impl MemInfo {
    pub fn used(&self) -> usize {
        self.total.saturating_sub(self.free)
    }
}

/// Driver operations used by the executor.
///
/// Context-scoped calls (`synchronize`, `reset_persisting_l2_cache`,
/// `mem_get_info`) act on whatever context is current on the calling thread;
/// the executor only issues them from its dedicated thread.
pub trait Driver: Send + Sync + 'static {
    /// Create a context on `device`. The driver may leave it current on the
    /// calling thread; the executor makes it current on its own thread anyway.
    fn create_context(&self, device: Device, flags: ContextFlags) -> Result<ContextHandle, DriverError>;

    /// Bind `ctx` to the calling thread, or unbind with `None`.
    fn set_current(&self, ctx: Option<ContextHandle>) -> Result<(), DriverError>;

    fn destroy_context(&self, ctx: ContextHandle) -> Result<(), DriverError>;

    fn synchronize(&self) -> Result<(), DriverError>;

    fn reset_persisting_l2_cache(&self) -> Result<(), DriverError>;

    fn mem_get_info(&self) -> Result<MemInfo, DriverError>;

    fn device_count(&self) -> Result<usize, DriverError>;

    fn device_name(&self, device: Device) -> Result<String, DriverError>;
}

/// Errors reported by a [`Driver`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("CUDA driver not available: {0}")]
    NotAvailable(String),

    #[error("CUDA driver symbol '{name}' not found")]
    Symbol { name: String },

    #[error("CUDA error {code} ({name}) in {call}")]
    Call { code: i32, name: String, call: String },

    #[error("invalid device ordinal {0}")]
    InvalidDevice(i32),
}

impl DriverError {
    /// The native result code, if this error came from a driver call.
    pub fn code(&self) -> Option<i32> {
        match self {
            DriverError::Call { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_roundtrip() {
        let raw = 0x1000usize as *mut c_void;
        let handle = ContextHandle::from_raw(raw);
        assert_eq!(handle.as_raw(), raw);
        assert!(!handle.is_null());
        assert!(ContextHandle::from_raw(std::ptr::null_mut()).is_null());
    }

    #[test]
    fn test_mem_info_used() {
        let info = MemInfo { free: 3, total: 8 };
        assert_eq!(info.used(), 5);
    }

    #[test]
    fn test_error_display() {
        let err = DriverError::Call {
            code: 201,
            name: "CUDA_ERROR_INVALID_CONTEXT".into(),
            call: "cuCtxSetCurrent".into(),
        };
        assert_eq!(
            err.to_string(),
            "CUDA error 201 (CUDA_ERROR_INVALID_CONTEXT) in cuCtxSetCurrent"
        );
        assert_eq!(err.code(), Some(201));
        assert_eq!(DriverError::InvalidDevice(7).code(), None);
    }
}
