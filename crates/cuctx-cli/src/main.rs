use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{bail, Context as _};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cuctx_core::{ContextFlags, CudaDriver, Device, Driver, Executor, ExecutorConfig, ExecutorError};

#[derive(Parser)]
#[command(
    name = "cuctx",
    about = "Thread-confined CUDA contexts",
    long_about = "Inspect GPUs and exercise a context executor against the system driver.\n\nSet RUST_LOG=debug to see the executor's lifecycle.",
    version,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// List the GPUs the driver reports
    Devices,
    /// Create an executor, run the helpers and a batch of tasks, then close it
    Smoke {
        /// Device ordinal [default: 0, or the config's device]
        #[arg(long)]
        device: Option<i32>,
        /// Context flags (comma-separated): spin, yield, blocking-sync, map-host, lmem-resize-to-max
        #[arg(long, value_delimiter = ',')]
        flags: Vec<String>,
        /// JSON executor config; --device and --flags override its values
        #[arg(long)]
        config: Option<PathBuf>,
        /// Number of submitting threads, one no-op task each
        #[arg(long, default_value = "8")]
        tasks: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Devices => cmd_devices(),
        Commands::Smoke { device, flags, config, tasks } => cmd_smoke(device, &flags, config, tasks),
    }
}

fn load_driver() -> anyhow::Result<Arc<CudaDriver>> {
    let driver = CudaDriver::load().context("CUDA driver not available")?;
    Ok(Arc::new(driver))
}

fn cmd_devices() -> anyhow::Result<()> {
    let driver = load_driver()?;
    let count = driver.device_count()?;
    println!("CUDA devices ({})", count);
    for ordinal in 0..count as i32 {
        let device = Device(ordinal);
        let name = driver.device_name(device)?;
        println!("  {:<8} {}", device.to_string(), name);
    }
    Ok(())
}

/// Load `path` (or the defaults) and apply the command-line overrides.
fn smoke_config(device: Option<i32>, flags: &[String], path: Option<&Path>) -> anyhow::Result<ExecutorConfig> {
    let mut config = match path {
        Some(path) => ExecutorConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ExecutorConfig::default(),
    };
    if let Some(device) = device {
        config.device = Device(device);
    }
    if !flags.is_empty() {
        config.flags = flags.to_vec();
    }
    Ok(config)
}

fn cmd_smoke(device: Option<i32>, flags: &[String], config: Option<PathBuf>, tasks: usize) -> anyhow::Result<()> {
    let config = smoke_config(device, flags, config.as_deref())?;
    if !config.auto_run {
        bail!("smoke needs an auto-run executor; set auto_run to true");
    }
    let context_flags: ContextFlags = config.context_flags()?;

    let driver = load_driver()?;
    let started = Instant::now();
    let ctx = Arc::new(Executor::with_config(driver, &config)?);
    println!("=== cuctx smoke ===");
    println!("  device:  {}", ctx.device());
    println!("  flags:   {}", context_flags);
    println!("  handle:  {:?}", ctx.handle());
    println!("  thread:  {}", ctx.thread_name());
    println!("  startup: {:.3}ms", started.elapsed().as_secs_f64() * 1000.0);

    let info = ctx.mem_info()?;
    println!(
        "  memory:  {} MiB free / {} MiB total",
        info.free >> 20,
        info.total >> 20
    );
    ctx.synchronize()?;
    match ctx.reset_l2_cache() {
        Ok(()) => println!("  l2:      persisting lines reset"),
        Err(ExecutorError::Driver(e)) => {
            tracing::warn!("L2 persisting-cache reset unsupported: {}", e);
            println!("  l2:      reset unsupported ({})", e);
        }
        Err(e) => return Err(e.into()),
    }

    let worker = ctx
        .worker_thread()
        .context("executor started without recording its thread")?;
    let started = Instant::now();
    let handles: Vec<_> = (0..tasks)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || ctx.submit(|_| thread::current().id()))
        })
        .collect();
    let mut on_worker = 0;
    for handle in handles {
        let ran_on = handle
            .join()
            .map_err(|_| anyhow::anyhow!("submitting thread panicked"))??;
        if ran_on == worker.id {
            on_worker += 1;
        }
    }
    println!(
        "  tasks:   {}/{} on the executor thread in {:.3}ms",
        on_worker,
        tasks,
        started.elapsed().as_secs_f64() * 1000.0
    );

    ctx.close()?;
    println!("  state:   {}", ctx.state());
    if on_worker != tasks {
        bail!("{} task(s) ran off the executor thread", tasks - on_worker);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(name: &str, text: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("cuctx-cli-{}-{}.json", name, std::process::id()));
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_config_device_kept_without_flag() {
        let path = write_config("keep", r#"{ "device": 1, "flags": ["spin"] }"#);
        let config = smoke_config(None, &[], Some(&path)).unwrap();
        assert_eq!(config.device(), Device(1));
        assert_eq!(config.context_flags().unwrap(), ContextFlags::SCHED_SPIN);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_command_line_overrides_config() {
        let path = write_config("override", r#"{ "device": 1, "flags": ["spin"] }"#);
        let flags = vec!["blocking-sync".to_string()];
        let config = smoke_config(Some(0), &flags, Some(&path)).unwrap();
        assert_eq!(config.device(), Device(0));
        assert_eq!(config.context_flags().unwrap(), ContextFlags::SCHED_BLOCKING_SYNC);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_defaults_without_config() {
        let config = smoke_config(None, &[], None).unwrap();
        assert_eq!(config.device(), Device(0));
        assert!(config.auto_run);
    }

    #[test]
    fn test_smoke_args_parse() {
        let cli = Cli::try_parse_from(["cuctx", "smoke", "--flags", "spin,map-host"]).unwrap();
        match cli.command {
            Commands::Smoke { device, flags, .. } => {
                assert_eq!(device, None);
                assert_eq!(flags, vec!["spin", "map-host"]);
            }
            Commands::Devices => panic!("parsed the wrong command"),
        }
    }
}
