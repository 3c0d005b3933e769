use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Ordinal of a physical CUDA device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Device(pub i32);

impl Device {
    /// The device ordinal as passed to `cuDeviceGet`.
    pub fn ordinal(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cuda:{}", self.0)
    }
}

impl From<i32> for Device {
    fn from(ordinal: i32) -> Self {
        Device(ordinal)
    }
}

bitflags! {
    /// Context creation flags, bit-compatible with `CU_CTX_*`.
    ///
    /// The empty set is `CU_CTX_SCHED_AUTO`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ContextFlags: u32 {
        const SCHED_SPIN = 0x01;
        const SCHED_YIELD = 0x02;
        const SCHED_BLOCKING_SYNC = 0x04;
        const MAP_HOST = 0x08;
        const LMEM_RESIZE_TO_MAX = 0x10;
    }
}

impl ContextFlags {
    /// `CU_CTX_SCHED_AUTO`: let the driver pick a scheduling policy.
    pub const SCHED_AUTO: ContextFlags = ContextFlags::empty();

    /// Parse a single flag name such as `sched-spin` or `MAP_HOST`.
    ///
    /// Names are case-insensitive and `_` and `-` are interchangeable.
    pub fn parse_name(name: &str) -> Option<ContextFlags> {
        let normalized = name.trim().to_ascii_lowercase().replace('_', "-");
        let flag = match normalized.as_str() {
            "sched-auto" | "auto" => ContextFlags::SCHED_AUTO,
            "sched-spin" | "spin" => ContextFlags::SCHED_SPIN,
            "sched-yield" | "yield" => ContextFlags::SCHED_YIELD,
            "sched-blocking-sync" | "blocking-sync" => ContextFlags::SCHED_BLOCKING_SYNC,
            "map-host" => ContextFlags::MAP_HOST,
            "lmem-resize-to-max" => ContextFlags::LMEM_RESIZE_TO_MAX,
            _ => return None,
        };
        Some(flag)
    }

    /// Parse a list of flag names and OR them together.
    ///
    /// Returns the first unrecognized name on failure.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<ContextFlags, String> {
        names.iter().try_fold(ContextFlags::SCHED_AUTO, |acc, name| {
            ContextFlags::parse_name(name.as_ref())
                .map(|flag| acc | flag)
                .ok_or_else(|| name.as_ref().to_string())
        })
    }
}

impl fmt::Display for ContextFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "sched-auto");
        }
        let names: Vec<String> = self
            .iter_names()
            .map(|(name, _)| name.to_ascii_lowercase().replace('_', "-"))
            .collect();
        write!(f, "{}", names.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_display() {
        assert_eq!(Device(0).to_string(), "cuda:0");
        assert_eq!(Device::from(3).ordinal(), 3);
        assert_eq!(Device::default(), Device(0));
    }

    #[test]
    fn test_flag_names() {
        assert_eq!(ContextFlags::parse_name("sched-spin"), Some(ContextFlags::SCHED_SPIN));
        assert_eq!(ContextFlags::parse_name("MAP_HOST"), Some(ContextFlags::MAP_HOST));
        assert_eq!(ContextFlags::parse_name("auto"), Some(ContextFlags::SCHED_AUTO));
        assert_eq!(ContextFlags::parse_name("turbo"), None);
    }

    #[test]
    fn test_parse_list() {
        let flags = ContextFlags::parse_list(&["blocking-sync", "map-host"]).unwrap();
        assert_eq!(flags, ContextFlags::SCHED_BLOCKING_SYNC | ContextFlags::MAP_HOST);
        assert_eq!(flags.bits(), 0x0c);

        let empty: [&str; 0] = [];
        assert_eq!(ContextFlags::parse_list(&empty).unwrap(), ContextFlags::SCHED_AUTO);
        assert_eq!(ContextFlags::parse_list(&["spin", "bogus"]).unwrap_err(), "bogus");
    }

    #[test]
    fn test_flags_display() {
        assert_eq!(ContextFlags::SCHED_AUTO.to_string(), "sched-auto");
        let flags = ContextFlags::SCHED_YIELD | ContextFlags::LMEM_RESIZE_TO_MAX;
        assert_eq!(flags.to_string(), "sched-yield|lmem-resize-to-max");
    }
}
