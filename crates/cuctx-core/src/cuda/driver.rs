use std::ffi::{c_char, CStr};

use super::ffi::{self, check, CudaApi, CuContext, CuDevice};
use crate::device::{ContextFlags, Device};
use crate::driver::{ContextHandle, Driver, DriverError, MemInfo};

/// [`Driver`] backed by the system CUDA driver library.
#[derive(Clone, Copy)]
pub struct CudaDriver {
    api: &'static CudaApi,
}

impl CudaDriver {
    /// Load and initialize the driver library.
    pub fn load() -> Result<Self, DriverError> {
        Ok(Self { api: ffi::cuda_api()? })
    }

    /// Raw function pointers, for operations the [`Driver`] trait doesn't cover.
    pub fn api(&self) -> &'static CudaApi {
        self.api
    }

    fn check(&self, code: ffi::CuResult, call: &str) -> Result<(), DriverError> {
        check(code, Some(self.api), call)
    }

    fn cu_device(&self, device: Device) -> Result<CuDevice, DriverError> {
        let count = self.device_count()?;
        if device.ordinal() < 0 || device.ordinal() as usize >= count {
            return Err(DriverError::InvalidDevice(device.ordinal()));
        }
        let mut dev: CuDevice = 0;
        self.check(
            unsafe { (self.api.cu_device_get)(&mut dev, device.ordinal()) },
            "cuDeviceGet",
        )?;
        Ok(dev)
    }
}

impl std::fmt::Debug for CudaDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaDriver").finish_non_exhaustive()
    }
}

impl Driver for CudaDriver {
    fn create_context(&self, device: Device, flags: ContextFlags) -> Result<ContextHandle, DriverError> {
        let dev = self.cu_device(device)?;
        let mut ctx: CuContext = std::ptr::null_mut();
        self.check(
            unsafe { (self.api.cu_ctx_create)(&mut ctx, flags.bits(), dev) },
            &format!("cuCtxCreate({}, {})", device, flags),
        )?;
        // cuCtxCreate pushes the new context onto the creating thread. The
        // executor binds it to its own thread, so leave this one clean.
        self.check(
            unsafe { (self.api.cu_ctx_set_current)(std::ptr::null_mut()) },
            "cuCtxSetCurrent(NULL)",
        )?;
        Ok(ContextHandle::from_raw(ctx))
    }

    fn set_current(&self, ctx: Option<ContextHandle>) -> Result<(), DriverError> {
        let raw = ctx.map_or(std::ptr::null_mut(), |c| c.as_raw());
        self.check(unsafe { (self.api.cu_ctx_set_current)(raw) }, "cuCtxSetCurrent")
    }

    fn destroy_context(&self, ctx: ContextHandle) -> Result<(), DriverError> {
        self.check(unsafe { (self.api.cu_ctx_destroy)(ctx.as_raw()) }, "cuCtxDestroy")
    }

    fn synchronize(&self) -> Result<(), DriverError> {
        self.check(unsafe { (self.api.cu_ctx_synchronize)() }, "cuCtxSynchronize")
    }

    fn reset_persisting_l2_cache(&self) -> Result<(), DriverError> {
        self.check(
            unsafe { (self.api.cu_ctx_reset_persisting_l2_cache)() },
            "cuCtxResetPersistingL2Cache",
        )
    }

    fn mem_get_info(&self) -> Result<MemInfo, DriverError> {
        let mut free = 0usize;
        let mut total = 0usize;
        self.check(
            unsafe { (self.api.cu_mem_get_info)(&mut free, &mut total) },
            "cuMemGetInfo",
        )?;
        Ok(MemInfo { free, total })
    }

    fn device_count(&self) -> Result<usize, DriverError> {
        let mut count = 0;
        self.check(
            unsafe { (self.api.cu_device_get_count)(&mut count) },
            "cuDeviceGetCount",
        )?;
        Ok(count.max(0) as usize)
    }

    fn device_name(&self, device: Device) -> Result<String, DriverError> {
        let dev = self.cu_device(device)?;
        let mut buf = [0 as c_char; 256];
        self.check(
            unsafe { (self.api.cu_device_get_name)(buf.as_mut_ptr(), buf.len() as i32, dev) },
            "cuDeviceGetName",
        )?;
        let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
        Ok(name.to_string_lossy().into_owned())
    }
}

/// Check if the CUDA driver is loadable and reports at least one device.
pub fn is_cuda_available() -> bool {
    CudaDriver::load()
        .and_then(|driver| driver.device_count())
        .map(|count| count > 0)
        .unwrap_or(false)
}
