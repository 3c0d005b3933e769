//! # cuctx-core
//!
//! Thread-confined CUDA driver contexts.
//!
//! The driver API requires a context be current on the thread that uses
//! it. [`Executor`] owns one context and one dedicated OS thread with that
//! context current, and runs every operation on the context there, one at a
//! time, in the order callers submitted them.
//!
//! Provides:
//! - [`Executor`]: auto-run, manual-run and adopted executors, `submit`,
//!   deadlines, idempotent `close`
//! - [`Driver`]: the driver capability set the executor is written against
//! - [`cuda::CudaDriver`]: `Driver` over the runtime-loaded system driver
//! - [`ExecutorConfig`]: JSON-loadable executor settings

pub mod config;
pub mod cuda;
pub mod device;
pub mod driver;
pub mod error;
pub mod executor;

pub use config::ExecutorConfig;
pub use cuda::CudaDriver;
pub use device::{ContextFlags, Device};
pub use driver::{ContextHandle, Driver, DriverError, MemInfo};
pub use error::{ConfigError, ExecutorError};
pub use executor::{
    CurrentContext, Executor, ExecutorState, HandleOwnership, ReadySender, WorkerThread,
};
