//! Runtime-loaded CUDA driver API function pointers via dlopen.
//!
//! Nothing links against `libcuda` at build time; the driver library is
//! opened on first use, so machines without an NVIDIA driver can still build
//! and run everything that doesn't touch a real GPU.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::sync::OnceLock;

use libloading::Library;

use crate::driver::DriverError;

// ---------------------------------------------------------------------------
// Driver types and status codes
// ---------------------------------------------------------------------------

pub type CuResult = c_int;
pub type CuDevice = c_int;
pub type CuContext = *mut c_void;

pub const CUDA_SUCCESS: CuResult = 0;
pub const CUDA_ERROR_INVALID_VALUE: CuResult = 1;
pub const CUDA_ERROR_NOT_INITIALIZED: CuResult = 3;
pub const CUDA_ERROR_DEINITIALIZED: CuResult = 4;
pub const CUDA_ERROR_NO_DEVICE: CuResult = 100;
pub const CUDA_ERROR_INVALID_DEVICE: CuResult = 101;
pub const CUDA_ERROR_INVALID_CONTEXT: CuResult = 201;
pub const CUDA_ERROR_CONTEXT_ALREADY_CURRENT: CuResult = 202;
pub const CUDA_ERROR_NOT_SUPPORTED: CuResult = 801;

#[cfg(windows)]
const LIBRARY_NAMES: &[&str] = &["nvcuda.dll"];
#[cfg(not(windows))]
const LIBRARY_NAMES: &[&str] = &["libcuda.so.1", "libcuda.so"];

// ---------------------------------------------------------------------------
// Driver API function signatures
// ---------------------------------------------------------------------------

type FnCuInit = unsafe extern "C" fn(c_uint) -> CuResult;
type FnCuDeviceGetCount = unsafe extern "C" fn(*mut c_int) -> CuResult;
type FnCuDeviceGet = unsafe extern "C" fn(*mut CuDevice, c_int) -> CuResult;
type FnCuDeviceGetName = unsafe extern "C" fn(*mut c_char, c_int, CuDevice) -> CuResult;
type FnCuCtxCreate = unsafe extern "C" fn(*mut CuContext, c_uint, CuDevice) -> CuResult;
type FnCuCtxDestroy = unsafe extern "C" fn(CuContext) -> CuResult;
type FnCuCtxSetCurrent = unsafe extern "C" fn(CuContext) -> CuResult;
type FnCuCtxSynchronize = unsafe extern "C" fn() -> CuResult;
type FnCuCtxResetPersistingL2Cache = unsafe extern "C" fn() -> CuResult;
type FnCuMemGetInfo = unsafe extern "C" fn(*mut usize, *mut usize) -> CuResult;
type FnCuGetErrorName = unsafe extern "C" fn(CuResult, *mut *const c_char) -> CuResult;

// ---------------------------------------------------------------------------
// Loaded API struct
// ---------------------------------------------------------------------------

pub struct CudaApi {
    _lib: Library,
    pub cu_init: FnCuInit,
    pub cu_device_get_count: FnCuDeviceGetCount,
    pub cu_device_get: FnCuDeviceGet,
    pub cu_device_get_name: FnCuDeviceGetName,
    pub cu_ctx_create: FnCuCtxCreate,
    pub cu_ctx_destroy: FnCuCtxDestroy,
    pub cu_ctx_set_current: FnCuCtxSetCurrent,
    pub cu_ctx_synchronize: FnCuCtxSynchronize,
    pub cu_ctx_reset_persisting_l2_cache: FnCuCtxResetPersistingL2Cache,
    pub cu_mem_get_info: FnCuMemGetInfo,
    pub cu_get_error_name: FnCuGetErrorName,
}

// Safety: the function pointers are process-global; the driver synchronizes
// internally and enforces its own per-thread context rules.
unsafe impl Send for CudaApi {}
unsafe impl Sync for CudaApi {}

/// Resolve one symbol, mapping a miss to `DriverError::Symbol`.
///
/// # Safety
/// `T` must be the exact function pointer type of the exported symbol.
unsafe fn symbol<T: Copy>(lib: &Library, name: &str) -> Result<T, DriverError> {
    let mut cname = name.as_bytes().to_vec();
    cname.push(0);
    lib.get::<T>(&cname)
        .map(|sym| *sym)
        .map_err(|_| DriverError::Symbol { name: name.to_string() })
}

impl CudaApi {
    fn try_load() -> Result<Self, DriverError> {
        let mut last_err = String::from("no candidate library names");
        let lib = LIBRARY_NAMES
            .iter()
            .find_map(|name| match unsafe { Library::new(name) } {
                Ok(lib) => Some(lib),
                Err(e) => {
                    last_err = format!("{}: {}", name, e);
                    None
                }
            })
            .ok_or_else(|| DriverError::NotAvailable(last_err))?;

        // Versioned entry points (`_v2`) are the ones cuda.h maps the plain
        // names to since CUDA 4.0.
        unsafe {
            Ok(CudaApi {
                cu_init: symbol(&lib, "cuInit")?,
                cu_device_get_count: symbol(&lib, "cuDeviceGetCount")?,
                cu_device_get: symbol(&lib, "cuDeviceGet")?,
                cu_device_get_name: symbol(&lib, "cuDeviceGetName")?,
                cu_ctx_create: symbol(&lib, "cuCtxCreate_v2")?,
                cu_ctx_destroy: symbol(&lib, "cuCtxDestroy_v2")?,
                cu_ctx_set_current: symbol(&lib, "cuCtxSetCurrent")?,
                cu_ctx_synchronize: symbol(&lib, "cuCtxSynchronize")?,
                cu_ctx_reset_persisting_l2_cache: symbol(&lib, "cuCtxResetPersistingL2Cache")?,
                cu_mem_get_info: symbol(&lib, "cuMemGetInfo_v2")?,
                cu_get_error_name: symbol(&lib, "cuGetErrorName")?,
                _lib: lib,
            })
        }
    }
}

static CUDA_API: OnceLock<Result<CudaApi, DriverError>> = OnceLock::new();

/// Get the runtime-loaded driver API, initializing the driver on first use.
pub fn cuda_api() -> Result<&'static CudaApi, DriverError> {
    CUDA_API
        .get_or_init(|| {
            let api = CudaApi::try_load()?;
            check(unsafe { (api.cu_init)(0) }, Some(&api), "cuInit")?;
            tracing::debug!("loaded CUDA driver API");
            Ok(api)
        })
        .as_ref()
        .map_err(Clone::clone)
}

// ---------------------------------------------------------------------------
// Error checking helpers
// ---------------------------------------------------------------------------

/// Symbolic name for a result code, asking the driver when it is loaded.
pub fn error_name(code: CuResult, api: Option<&CudaApi>) -> String {
    if let Some(api) = api {
        let mut ptr: *const c_char = std::ptr::null();
        if unsafe { (api.cu_get_error_name)(code, &mut ptr) } == CUDA_SUCCESS && !ptr.is_null() {
            return unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
        }
    }
    fallback_error_name(code).to_string()
}

fn fallback_error_name(code: CuResult) -> &'static str {
    match code {
        CUDA_SUCCESS => "CUDA_SUCCESS",
        CUDA_ERROR_INVALID_VALUE => "CUDA_ERROR_INVALID_VALUE",
        CUDA_ERROR_NOT_INITIALIZED => "CUDA_ERROR_NOT_INITIALIZED",
        CUDA_ERROR_DEINITIALIZED => "CUDA_ERROR_DEINITIALIZED",
        CUDA_ERROR_NO_DEVICE => "CUDA_ERROR_NO_DEVICE",
        CUDA_ERROR_INVALID_DEVICE => "CUDA_ERROR_INVALID_DEVICE",
        CUDA_ERROR_INVALID_CONTEXT => "CUDA_ERROR_INVALID_CONTEXT",
        CUDA_ERROR_CONTEXT_ALREADY_CURRENT => "CUDA_ERROR_CONTEXT_ALREADY_CURRENT",
        CUDA_ERROR_NOT_SUPPORTED => "CUDA_ERROR_NOT_SUPPORTED",
        _ => "CUDA_ERROR_UNKNOWN",
    }
}

/// Check a driver API return code.
pub fn check(code: CuResult, api: Option<&CudaApi>, call: &str) -> Result<(), DriverError> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(DriverError::Call {
            code,
            name: error_name(code, api),
            call: call.to_string(),
        })
    }
}
