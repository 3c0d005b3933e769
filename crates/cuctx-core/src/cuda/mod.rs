//! CUDA driver backend.
//!
//! Provides:
//! - Runtime-loaded driver API (`libcuda.so.1` / `nvcuda.dll`)
//! - [`CudaDriver`], the [`Driver`](crate::Driver) implementation executors
//!   use against real hardware

pub mod ffi;
mod driver;

pub use driver::{is_cuda_available, CudaDriver};
