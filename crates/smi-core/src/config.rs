//! Configuration for the SMI bus model and its test harness.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SMI_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/smi/config.toml
//!   3. ~/.config/smi/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::frame::frame_capacity;
use crate::wire::{SMI_MEM_BURST_SIZE, SMI_MEM_IN_FLIGHT_LIMIT};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SmiConfig {
    pub bus: BusConfig,
    pub memory: MemoryConfig,
    pub memtest: MemtestConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Burst fragment size in bytes. Power of two.
    pub burst_size: u16,
    /// Outstanding transactions per arbitrated port.
    pub in_flight_limit: u8,
    /// Flits buffered on each direction of a link.
    pub link_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Addressable bytes of simulated memory. Accesses past it fail.
    pub size_bytes: u64,
    /// Address ranges whose accesses report a failure.
    pub faults: Vec<FaultRange>,
}

/// Half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRange {
    pub start: u64,
    pub end: u64,
}

impl FaultRange {
    /// True if `[address, address + length)` touches this range.
    pub fn overlaps(&self, address: u64, length: u64) -> bool {
        length > 0 && address < self.end && address.saturating_add(length) > self.start
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemtestConfig {
    /// Base address of the region the memory test may scribble over.
    pub workspace_base: u64,
    pub workspace_size: u64,
    /// Random write/read-back cycles per operand width.
    pub transfers: u32,
    /// RNG seed. 0 = pick one at startup.
    pub seed: u64,
    /// Share one link through a tagged arbiter instead of one link per width.
    pub arbitrated: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            burst_size: SMI_MEM_BURST_SIZE as u16,
            in_flight_limit: SMI_MEM_IN_FLIGHT_LIMIT as u8,
            link_capacity: 64,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            size_bytes: 1 << 32, // 4 GB
            faults: Vec::new(),
        }
    }
}

impl Default for MemtestConfig {
    fn default() -> Self {
        Self {
            workspace_base: 0x1000_0000,
            workspace_size: 1 << 20,
            transfers: 64,
            seed: 0,
            arbitrated: false,
        }
    }
}

impl BusConfig {
    /// Flits needed to hold one complete frame at this burst size.
    pub fn frame_capacity(&self) -> usize {
        frame_capacity(self.burst_size as usize)
    }

    /// Segmentation needs a power-of-two burst that fits the length field
    /// with room for a full frame.
    pub fn burst_size_valid(&self) -> bool {
        self.burst_size.is_power_of_two() && (8..=4096).contains(&self.burst_size)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("smi")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SmiConfig {
    /// Load config: env vars → file → defaults, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file, or return defaults if it does not exist.
    pub fn load_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(SmiConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SMI_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SmiConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SMI_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(p) = lookup("SMI_BUS__BURST_SIZE").and_then(|v| v.parse().ok()) {
            self.bus.burst_size = p;
        }
        if let Some(p) = lookup("SMI_BUS__IN_FLIGHT_LIMIT").and_then(|v| v.parse().ok()) {
            self.bus.in_flight_limit = p;
        }
        if let Some(p) = lookup("SMI_BUS__LINK_CAPACITY").and_then(|v| v.parse().ok()) {
            self.bus.link_capacity = p;
        }
        if let Some(p) = lookup("SMI_MEMORY__SIZE_BYTES").and_then(|v| v.parse().ok()) {
            self.memory.size_bytes = p;
        }
        if let Some(p) = lookup("SMI_MEMTEST__TRANSFERS").and_then(|v| v.parse().ok()) {
            self.memtest.transfers = p;
        }
        if let Some(p) = lookup("SMI_MEMTEST__SEED").and_then(|v| v.parse().ok()) {
            self.memtest.seed = p;
        }
        if let Some(v) = lookup("SMI_MEMTEST__ARBITRATED") {
            self.memtest.arbitrated = v == "true" || v == "1";
        }
    }

    /// Reject settings the bus cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let burst = self.bus.burst_size;
        if !self.bus.burst_size_valid() {
            return Err(ConfigError::Invalid {
                field: "bus.burst_size",
                reason: format!("{burst} is not a power of two in 8..=4096"),
            });
        }
        if self.bus.in_flight_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "bus.in_flight_limit",
                reason: "must be at least 1".into(),
            });
        }
        if self.bus.link_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "bus.link_capacity",
                reason: "must be at least 1".into(),
            });
        }
        for fault in &self.memory.faults {
            if fault.start >= fault.end {
                return Err(ConfigError::Invalid {
                    field: "memory.faults",
                    reason: format!("empty range 0x{:x}..0x{:x}", fault.start, fault.end),
                });
            }
        }
        Ok(())
    }
}
