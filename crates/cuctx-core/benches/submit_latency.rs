//! Benchmark: round-trip latency of `Executor::submit`, single caller vs contended.
//!
//! Uses a no-op driver so the numbers measure the queue and thread handoff only.

use std::ffi::c_void;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use cuctx_core::{ContextFlags, ContextHandle, Device, Driver, DriverError, Executor, MemInfo};

struct NullDriver;

impl Driver for NullDriver {
    fn create_context(&self, _device: Device, _flags: ContextFlags) -> Result<ContextHandle, DriverError> {
        Ok(ContextHandle::from_raw(0x1000 as *mut c_void))
    }
    fn set_current(&self, _ctx: Option<ContextHandle>) -> Result<(), DriverError> {
        Ok(())
    }
    fn destroy_context(&self, _ctx: ContextHandle) -> Result<(), DriverError> {
        Ok(())
    }
    fn synchronize(&self) -> Result<(), DriverError> {
        Ok(())
    }
    fn reset_persisting_l2_cache(&self) -> Result<(), DriverError> {
        Ok(())
    }
    fn mem_get_info(&self) -> Result<MemInfo, DriverError> {
        Ok(MemInfo { free: 0, total: 0 })
    }
    fn device_count(&self) -> Result<usize, DriverError> {
        Ok(1)
    }
    fn device_name(&self, _device: Device) -> Result<String, DriverError> {
        Ok("null".into())
    }
}

fn bench_single(ctx: &Executor, iters: usize) -> f64 {
    let start = Instant::now();
    for i in 0..iters {
        let _ = ctx.submit(move |_| i).unwrap();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn bench_contended(ctx: &Arc<Executor>, threads: usize, iters: usize) -> f64 {
    let start = Instant::now();
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let ctx = Arc::clone(ctx);
            thread::spawn(move || {
                for i in 0..iters {
                    let _ = ctx.submit(move |_| i).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    start.elapsed().as_secs_f64() / (threads * iters) as f64
}

fn main() {
    let ctx = Arc::new(Executor::new(Arc::new(NullDriver), Device(0), ContextFlags::SCHED_AUTO).unwrap());
    let iters = 20_000;

    println!("=== cuctx submit round-trip ===");
    // Warmup
    bench_single(&ctx, 1_000);

    let single = bench_single(&ctx, iters);
    println!("  1 caller : {:>8.2} µs/task", single * 1e6);

    for threads in [2, 4, 8] {
        let per_task = bench_contended(&ctx, threads, iters / threads);
        println!("  {} callers: {:>8.2} µs/task", threads, per_task * 1e6);
    }

    ctx.close().unwrap();
}
