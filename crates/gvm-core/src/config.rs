//! Interposer configuration.
//!
//! Layered, lowest precedence first:
//!
//! 1. [`InterceptConfig::default`]
//! 2. a JSON document at the path named by `GVM_CONFIG`
//! 3. individual `GVM_*` environment variables
//!
//! The preload library reads this once at bootstrap; the CLI uses the same
//! loader so `gvm config` shows exactly what an intercepted process would see.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::MIB;
use crate::error::{InterceptError, Result};

pub const ENV_CONFIG_PATH: &str = "GVM_CONFIG";
pub const ENV_TRACKING: &str = "GVM_TRACKING";
pub const ENV_SAMPLE_INTERVAL_MS: &str = "GVM_SAMPLE_INTERVAL_MS";
pub const ENV_RING_CAPACITY: &str = "GVM_RING_CAPACITY";
pub const ENV_BLOCKING_RESERVE: &str = "GVM_BLOCKING_RESERVE";
pub const ENV_MEMORY_LIMIT_MIB: &str = "GVM_MEMORY_LIMIT_MIB";
pub const ENV_ALLOC_BACKING: &str = "GVM_ALLOC_BACKING";
pub const ENV_STATS_INTERVAL_MS: &str = "GVM_STATS_INTERVAL_MS";

/// How launches are turned into completion records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    /// Every launch gets its own record.
    PerCall,
    /// At most one record per sample interval, carrying the coalesced count.
    #[default]
    Sampled,
    /// Two records per launch: one recorded before the launch, one after.
    DualEdge,
}

impl TrackingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerCall => "per_call",
            Self::Sampled => "sampled",
            Self::DualEdge => "dual_edge",
        }
    }
}

/// Which driver allocator a wrapped allocate forwards to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocBacking {
    /// Plain device memory (`cuMemAlloc_v2` / `cuMemAllocAsync`).
    Device,
    /// Unified memory with global attach (`cuMemAllocManaged`), which lets the
    /// arbiter oversubscribe the device.
    #[default]
    Managed,
}

impl AllocBacking {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Managed => "managed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
    pub tracking: TrackingMode,
    pub sample_interval_ms: u64,
    /// Completion ring slots.
    pub ring_capacity: usize,
    /// Block launches while the ring is full instead of dropping the record.
    pub blocking_reserve: bool,
    /// Optional cap below the device's own capacity.
    pub memory_limit_mib: Option<u64>,
    pub alloc_backing: AllocBacking,
    pub stats_interval_ms: u64,
    pub idle_poll_us: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            tracking: TrackingMode::Sampled,
            sample_interval_ms: 8,
            ring_capacity: 1 << 20,
            blocking_reserve: true,
            memory_limit_mib: None,
            alloc_backing: AllocBacking::Managed,
            stats_interval_ms: 1_000,
            idle_poll_us: 50,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl InterceptConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = match lookup(ENV_CONFIG_PATH) {
            Some(path) if !path.trim().is_empty() => Self::from_json_file(Path::new(&path))?,
            _ => Self::default(),
        };
        cfg.apply_overrides(&lookup)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            InterceptError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json(&data)
            .map_err(|err| InterceptError::Config(format!("{}: {err}", path.display())))
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(data)
            .map_err(|err| InterceptError::Config(format!("malformed config JSON: {err}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup(ENV_TRACKING) {
            self.tracking = parse_tracking_mode(&v)?;
        }
        if let Some(v) = lookup(ENV_SAMPLE_INTERVAL_MS) {
            self.sample_interval_ms = parse_number(ENV_SAMPLE_INTERVAL_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_RING_CAPACITY) {
            self.ring_capacity = parse_number(ENV_RING_CAPACITY, &v)?;
        }
        if let Some(v) = lookup(ENV_BLOCKING_RESERVE) {
            self.blocking_reserve = parse_bool(ENV_BLOCKING_RESERVE, &v)?;
        }
        if let Some(v) = lookup(ENV_MEMORY_LIMIT_MIB) {
            let mib: u64 = parse_number(ENV_MEMORY_LIMIT_MIB, &v)?;
            self.memory_limit_mib = (mib > 0).then_some(mib);
        }
        if let Some(v) = lookup(ENV_ALLOC_BACKING) {
            self.alloc_backing = parse_alloc_backing(&v)?;
        }
        if let Some(v) = lookup(ENV_STATS_INTERVAL_MS) {
            self.stats_interval_ms = parse_number(ENV_STATS_INTERVAL_MS, &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ring_capacity == 0 {
            return Err(InterceptError::Config("ring_capacity must be > 0".into()));
        }
        if self.sample_interval_ms == 0 {
            return Err(InterceptError::Config(
                "sample_interval_ms must be > 0".into(),
            ));
        }
        if self.stats_interval_ms == 0 {
            return Err(InterceptError::Config("stats_interval_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_micros(self.idle_poll_us)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Configured cap in bytes, if any.
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.memory_limit_mib.map(|mib| mib.saturating_mul(MIB))
    }
}

pub fn parse_tracking_mode(s: &str) -> Result<TrackingMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "per_call" | "per-call" | "precise" => Ok(TrackingMode::PerCall),
        "sampled" | "sample" | "interval" => Ok(TrackingMode::Sampled),
        "dual_edge" | "dual-edge" | "dual" => Ok(TrackingMode::DualEdge),
        other => Err(InterceptError::Config(format!(
            "Unknown tracking mode '{other}'. Use per_call, sampled or dual_edge."
        ))),
    }
}

pub fn parse_alloc_backing(s: &str) -> Result<AllocBacking> {
    match s.trim().to_ascii_lowercase().as_str() {
        "device" => Ok(AllocBacking::Device),
        "managed" | "unified" => Ok(AllocBacking::Managed),
        other => Err(InterceptError::Config(format!(
            "Unknown allocation backing '{other}'. Use device or managed."
        ))),
    }
}

fn parse_bool(key: &str, s: &str) -> Result<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(InterceptError::Config(format!(
            "{key}: expected a boolean, got '{other}'"
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, s: &str) -> Result<T> {
    s.trim()
        .parse()
        .map_err(|_| InterceptError::Config(format!("{key}: expected a number, got '{s}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = InterceptConfig::default();
        assert_eq!(cfg.tracking, TrackingMode::Sampled);
        assert_eq!(cfg.sample_interval(), Duration::from_millis(8));
        assert_eq!(cfg.ring_capacity, 1_048_576);
        assert!(cfg.blocking_reserve);
        assert_eq!(cfg.alloc_backing, AllocBacking::Managed);
        assert_eq!(cfg.memory_limit_bytes(), None);
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = InterceptConfig::from_lookup(lookup_from(&[
            (ENV_TRACKING, "dual-edge"),
            (ENV_RING_CAPACITY, "64"),
            (ENV_BLOCKING_RESERVE, "off"),
            (ENV_MEMORY_LIMIT_MIB, "512"),
            (ENV_ALLOC_BACKING, "device"),
        ]))
        .expect("overrides should parse");
        assert_eq!(cfg.tracking, TrackingMode::DualEdge);
        assert_eq!(cfg.ring_capacity, 64);
        assert!(!cfg.blocking_reserve);
        assert_eq!(cfg.memory_limit_bytes(), Some(512 * MIB));
        assert_eq!(cfg.alloc_backing, AllocBacking::Device);
    }

    #[test]
    fn zero_memory_limit_means_unlimited() {
        let cfg = InterceptConfig::from_lookup(lookup_from(&[(ENV_MEMORY_LIMIT_MIB, "0")]))
            .expect("zero limit is valid");
        assert_eq!(cfg.memory_limit_mib, None);
    }

    #[test]
    fn unknown_mode_is_rejected_with_choices() {
        let err = InterceptConfig::from_lookup(lookup_from(&[(ENV_TRACKING, "burst")]))
            .expect_err("unknown mode must fail");
        assert!(err.to_string().contains("per_call, sampled or dual_edge"));
    }

    #[test]
    fn zero_capacity_is_invalid() {
        let err = InterceptConfig::from_json(r#"{ "ring_capacity": 0 }"#)
            .expect_err("zero capacity must fail");
        assert_eq!(err.error_code(), 500);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = InterceptConfig::from_json(r#"{ "tracking": "per_call", "sample_interval_ms": 4 }"#)
            .expect("partial document should parse");
        assert_eq!(cfg.tracking, TrackingMode::PerCall);
        assert_eq!(cfg.sample_interval_ms, 4);
        assert_eq!(cfg.stats_interval_ms, 1_000);
    }

    #[test]
    fn env_wins_over_file() {
        let path = std::env::temp_dir().join(format!("gvm_cfg_{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "tracking": "per_call", "ring_capacity": 32 }"#)
            .expect("write config");
        let path_str = path.to_string_lossy().to_string();
        let cfg = InterceptConfig::from_lookup(lookup_from(&[
            (ENV_CONFIG_PATH, path_str.as_str()),
            (ENV_RING_CAPACITY, "16"),
        ]))
        .expect("layered config should load");
        let _ = std::fs::remove_file(&path);
        assert_eq!(cfg.tracking, TrackingMode::PerCall);
        assert_eq!(cfg.ring_capacity, 16);
    }
}
