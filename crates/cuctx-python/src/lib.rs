//! # cuctx-python
//!
//! PyO3 bindings for cuctx → `import cuctx` in Python.
//!
//! Provides:
//! - `cuctx.Context`: wraps `cuctx_core::Executor` over the system driver
//! - `cuctx.device_count()` / `cuctx.device_name(i)`
//! - `cuctx.CudaError` / `cuctx.ExecutorClosedError`
//! - `CTX_*` context flag constants
//!
//! Blocking calls release the GIL while they wait, and tasks re-acquire it
//! on the executor's thread.

use std::sync::Arc;
use std::time::Duration;

use pyo3::create_exception;
use pyo3::exceptions::{PyRuntimeError, PyTimeoutError, PyValueError};
use pyo3::prelude::*;

use cuctx_core::{
    ContextFlags, CudaDriver, CurrentContext, Device, Driver, DriverError, Executor, ExecutorError,
};

create_exception!(cuctx, CudaError, PyRuntimeError, "A CUDA driver call failed.");
create_exception!(cuctx, ExecutorClosedError, PyRuntimeError, "The context has been closed.");

fn executor_err(err: ExecutorError) -> PyErr {
    match &err {
        ExecutorError::Closed => ExecutorClosedError::new_err(err.to_string()),
        ExecutorError::Timeout(_) => PyTimeoutError::new_err(err.to_string()),
        ExecutorError::InvalidConfig(_) => PyValueError::new_err(err.to_string()),
        _ => CudaError::new_err(err.to_string()),
    }
}

fn driver_err(err: DriverError) -> PyErr {
    match err {
        DriverError::InvalidDevice(_) => PyValueError::new_err(err.to_string()),
        _ => CudaError::new_err(err.to_string()),
    }
}

fn load_driver() -> PyResult<Arc<CudaDriver>> {
    CudaDriver::load().map(Arc::new).map_err(driver_err)
}

fn context_flags(bits: u32) -> PyResult<ContextFlags> {
    ContextFlags::from_bits(bits)
        .ok_or_else(|| PyValueError::new_err(format!("unknown context flag bits: {:#x}", bits)))
}

// ============================================================================
// Context
// ============================================================================

/// A CUDA context confined to one dedicated thread.
///
/// ```python
/// with cuctx.Context(0) as ctx:
///     ctx.call(launch_kernel)
///     ctx.synchronize()
/// ```
#[pyclass(name = "Context", frozen)]
struct PyContext {
    inner: Arc<Executor>,
}

#[pymethods]
impl PyContext {
    /// Create a context on `device` and start its thread.
    #[new]
    #[pyo3(signature = (device=0, flags=0))]
    fn new(py: Python<'_>, device: i32, flags: u32) -> PyResult<Self> {
        let flags = context_flags(flags)?;
        let driver = load_driver()?;
        let inner = py
            .allow_threads(|| Executor::new(driver, Device(device), flags))
            .map_err(executor_err)?;
        Ok(Self { inner: Arc::new(inner) })
    }

    /// Create a context whose loop the caller drives with `run_forever()`.
    #[staticmethod]
    #[pyo3(signature = (device=0, flags=0))]
    fn manual(device: i32, flags: u32) -> PyResult<Self> {
        let flags = context_flags(flags)?;
        let driver = load_driver()?;
        let inner = Executor::new_manual(driver, Device(device), flags).map_err(executor_err)?;
        Ok(Self { inner: Arc::new(inner) })
    }

    /// Serve the context on the calling thread until `close()`.
    fn run_forever(&self, py: Python<'_>) -> PyResult<()> {
        py.allow_threads(|| self.inner.run(None)).map_err(executor_err)
    }

    /// Call `func()` on the context's thread and return its result.
    ///
    /// Exceptions raised by `func` propagate unchanged. With `timeout`
    /// (seconds), raises `TimeoutError` if the call has not finished in
    /// time; `func` still runs.
    #[pyo3(signature = (func, timeout=None))]
    fn call(&self, py: Python<'_>, func: PyObject, timeout: Option<f64>) -> PyResult<PyObject> {
        let timeout = timeout
            .map(|secs| {
                Duration::try_from_secs_f64(secs)
                    .map_err(|_| PyValueError::new_err(format!("invalid timeout: {}", secs)))
            })
            .transpose()?;
        let inner = Arc::clone(&self.inner);
        let outcome = py.allow_threads(move || {
            let task = move |_: &CurrentContext<'_>| Python::with_gil(|py| func.call0(py));
            match timeout {
                Some(timeout) => inner.submit_timeout(task, timeout),
                None => inner.submit(task),
            }
        });
        outcome.map_err(executor_err)?
    }

    /// Block until all work queued on the context has completed.
    fn synchronize(&self, py: Python<'_>) -> PyResult<()> {
        py.allow_threads(|| self.inner.synchronize()).map_err(executor_err)
    }

    /// Reset all persisting lines in the L2 cache to normal.
    fn reset_l2_cache(&self, py: Python<'_>) -> PyResult<()> {
        py.allow_threads(|| self.inner.reset_l2_cache()).map_err(executor_err)
    }

    /// `(free, total)` device memory in bytes.
    fn mem_info(&self, py: Python<'_>) -> PyResult<(usize, usize)> {
        let info = py.allow_threads(|| self.inner.mem_info()).map_err(executor_err)?;
        Ok((info.free, info.total))
    }

    /// Stop the context's thread and destroy the context. Idempotent.
    fn close(&self, py: Python<'_>) -> PyResult<()> {
        py.allow_threads(|| self.inner.close()).map_err(executor_err)
    }

    #[getter]
    fn state(&self) -> &'static str {
        self.inner.state().as_str()
    }

    #[getter]
    fn device(&self) -> i32 {
        self.inner.device().ordinal()
    }

    #[getter]
    fn flags(&self) -> u32 {
        self.inner.flags().bits()
    }

    /// Message of the most recent executor-level error, if any.
    #[getter]
    fn last_error(&self) -> Option<String> {
        self.inner.last_error().map(|e| e.to_string())
    }

    fn __enter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    #[pyo3(signature = (_exc_type=None, _exc_value=None, _traceback=None))]
    fn __exit__(
        &self,
        py: Python<'_>,
        _exc_type: Option<PyObject>,
        _exc_value: Option<PyObject>,
        _traceback: Option<PyObject>,
    ) -> PyResult<bool> {
        self.close(py)?;
        Ok(false)
    }

    fn __repr__(&self) -> String {
        format!(
            "Context(device={}, flags={}, state={})",
            self.inner.device().ordinal(),
            self.inner.flags(),
            self.inner.state()
        )
    }
}

impl Drop for PyContext {
    fn drop(&mut self) {
        if self.inner.is_closed() {
            return;
        }
        // A task left behind by a timed-out call may still need the GIL.
        let inner = &self.inner;
        Python::with_gil(|py| {
            py.allow_threads(|| {
                if let Err(e) = inner.close() {
                    tracing::warn!("closing {} on drop failed: {}", inner.device(), e);
                }
            })
        });
    }
}

// ============================================================================
// Device queries
// ============================================================================

/// Number of CUDA devices.
#[pyfunction]
fn device_count() -> PyResult<usize> {
    load_driver()?.device_count().map_err(driver_err)
}

/// Name of device `index`.
#[pyfunction]
fn device_name(index: i32) -> PyResult<String> {
    load_driver()?.device_name(Device(index)).map_err(driver_err)
}

// ============================================================================
// Module entry point
// ============================================================================

#[pymodule]
fn cuctx(py: Python<'_>, m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyContext>()?;
    m.add_function(wrap_pyfunction!(device_count, m)?)?;
    m.add_function(wrap_pyfunction!(device_name, m)?)?;

    m.add("CudaError", py.get_type_bound::<CudaError>())?;
    m.add("ExecutorClosedError", py.get_type_bound::<ExecutorClosedError>())?;

    m.add("CTX_SCHED_AUTO", ContextFlags::SCHED_AUTO.bits())?;
    m.add("CTX_SCHED_SPIN", ContextFlags::SCHED_SPIN.bits())?;
    m.add("CTX_SCHED_YIELD", ContextFlags::SCHED_YIELD.bits())?;
    m.add("CTX_SCHED_BLOCKING_SYNC", ContextFlags::SCHED_BLOCKING_SYNC.bits())?;
    m.add("CTX_MAP_HOST", ContextFlags::MAP_HOST.bits())?;
    m.add("CTX_LMEM_RESIZE_TO_MAX", ContextFlags::LMEM_RESIZE_TO_MAX.bits())?;

    Ok(())
}
