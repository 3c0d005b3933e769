//! Configuration for executors.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::{ContextFlags, Device};
use crate::error::ConfigError;

/// Configuration for an [`Executor`](crate::Executor).
///
/// Every field has a default, so a config file only needs the fields it
/// overrides:
///
/// ```json
/// { "device": 1, "flags": ["blocking-sync"], "submit_timeout_ms": 5000 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Device the context is created on, written as its ordinal.
    pub device: Device,

    /// Context creation flag names (see [`ContextFlags::parse_name`]).
    /// Empty means `sched-auto`.
    pub flags: Vec<String>,

    /// Spawn the dedicated thread during construction. When false the
    /// caller must drive [`Executor::run`](crate::Executor::run) itself.
    pub auto_run: bool,

    /// Name of the dedicated thread. Defaults to `cuctx-ctx{device}`.
    pub thread_name: Option<String>,

    /// Stack size of the dedicated thread, in bytes.
    pub stack_size: Option<usize>,

    /// Deadline used by [`Executor::submit_default`](crate::Executor::submit_default).
    pub submit_timeout_ms: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            device: Device(0),
            flags: Vec::new(),
            auto_run: true,
            thread_name: None,
            stack_size: None,
            submit_timeout_ms: None,
        }
    }
}

impl ExecutorConfig {
    /// Default config for `device`.
    pub fn for_device(device: Device) -> Self {
        Self { device, ..Self::default() }
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.context_flags()?;
        Ok(config)
    }

    /// Load a config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn context_flags(&self) -> Result<ContextFlags, ConfigError> {
        ContextFlags::parse_list(&self.flags).map_err(ConfigError::Flag)
    }

    pub fn thread_name(&self) -> String {
        self.thread_name
            .clone()
            .unwrap_or_else(|| default_thread_name(self.device()))
    }

    pub fn submit_timeout(&self) -> Option<Duration> {
        self.submit_timeout_ms.map(Duration::from_millis)
    }
}

pub(crate) fn default_thread_name(device: Device) -> String {
    format!("cuctx-ctx{}", device.ordinal())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.device(), Device(0));
        assert!(config.auto_run);
        assert_eq!(config.context_flags().unwrap(), ContextFlags::SCHED_AUTO);
        assert_eq!(config.thread_name(), "cuctx-ctx0");
        assert_eq!(config.submit_timeout(), None);
    }

    #[test]
    fn test_partial_json() {
        let config = ExecutorConfig::from_json_str(
            r#"{ "device": 2, "flags": ["blocking-sync", "map_host"], "submit_timeout_ms": 250 }"#,
        )
        .unwrap();
        assert_eq!(config.device(), Device(2));
        assert_eq!(
            config.context_flags().unwrap(),
            ContextFlags::SCHED_BLOCKING_SYNC | ContextFlags::MAP_HOST
        );
        assert!(config.auto_run);
        assert_eq!(config.thread_name(), "cuctx-ctx2");
        assert_eq!(config.submit_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_device_serialized_as_ordinal() {
        let config = ExecutorConfig::for_device(Device(3));
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["device"], serde_json::json!(3));
    }

    #[test]
    fn test_unknown_flag_rejected() {
        let err = ExecutorConfig::from_json_str(r#"{ "flags": ["warp-speed"] }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Flag(ref name) if name == "warp-speed"));
    }

    #[test]
    fn test_malformed_json_rejected() {
        let err = ExecutorConfig::from_json_str("{ device: ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_json_roundtrip_keeps_thread_settings() {
        let config = ExecutorConfig {
            thread_name: Some("gpu-main".into()),
            stack_size: Some(1 << 20),
            auto_run: false,
            ..ExecutorConfig::for_device(Device(1))
        };
        let text = serde_json::to_string(&config).unwrap();
        assert_eq!(ExecutorConfig::from_json_str(&text).unwrap(), config);
    }
}
