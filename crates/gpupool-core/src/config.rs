//! Configuration types for gpupool

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::inventory::GpuVendor;
use crate::{PoolError, PoolResult};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Allocation engine configuration
    pub engine: EngineConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Inventory applied at startup
    pub clusters: Vec<ClusterSeed>,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> PoolResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PoolError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> PoolResult<Self> {
        toml::from_str(content)
            .map_err(|e| PoolError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Allocation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Age after which an uncommitted reservation is reclaimed
    pub reservation_timeout_secs: u64,
    /// Interval between stale-reservation sweeps
    pub sweep_interval_secs: u64,
    /// Attempts per allocation before reporting insufficient resources
    pub max_allocation_attempts: u32,
    /// Page size for lazy listings
    pub list_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservation_timeout_secs: 30,
            sweep_interval_secs: 5,
            max_allocation_attempts: 3,
            list_page_size: 128,
        }
    }
}

impl EngineConfig {
    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_secs(self.reservation_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON snapshot rewritten after every commit; in-memory only when unset
    pub snapshot_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Cluster entry of the startup inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSeed {
    pub id: String,
    pub display_name: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSeed {
    pub id: String,
    pub name: Option<String>,
    /// Device slots; defaults to the number of listed devices
    pub device_slots: Option<u32>,
    #[serde(default)]
    pub devices: Vec<DeviceSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSeed {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub vendor: GpuVendor,
    /// Memory size (e.g. "80Gi")
    pub memory: String,
    pub index: u32,
}

/// Parse a memory size such as "16Gi", "512Mi" or "1073741824" into bytes
pub fn parse_memory(value: &str) -> PoolResult<u64> {
    let value = value.trim();
    let (digits, multiplier) = [
        ("Ti", 1u64 << 40),
        ("Gi", 1 << 30),
        ("Mi", 1 << 20),
        ("Ki", 1 << 10),
    ]
    .iter()
    .find_map(|(suffix, mult)| value.strip_suffix(suffix).map(|d| (d, *mult)))
    .unwrap_or((value, 1));

    let amount: u64 = digits
        .trim()
        .parse()
        .map_err(|_| PoolError::Config(format!("Invalid memory size: {}", value)))?;
    amount
        .checked_mul(multiplier)
        .ok_or_else(|| PoolError::Config(format!("Memory size overflows: {}", value)))
}
