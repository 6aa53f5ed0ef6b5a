use crate::error::{Result, SimError};
use crate::time::{self, SimTime};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Simulation configuration
///
/// A full scenario: data-centre topology, appliance storage, the scaling
/// control law's knobs, utilization sampling, and retry cadence. Every
/// field has a default; the CLI overrides topology from its positional
/// arguments and anything else from an optional YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Physical machine topology
    pub machines: MachineConfig,

    /// Appliance repository storage
    pub storage: StorageConfig,

    /// Autoscaling control law
    pub scaling: ScalingConfig,

    /// Per-VM utilization sampling
    pub monitor: MonitorConfig,

    /// Rejected-job retry queue
    pub queue: QueueConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            machines: MachineConfig::default(),
            storage: StorageConfig::default(),
            scaling: ScalingConfig::default(),
            monitor: MonitorConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl SimConfig {
    /// Load a configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: SimConfig = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Validate configuration preconditions.
    pub fn validate(&self) -> Result<()> {
        if self.machines.count == 0 {
            return Err(SimError::InvalidParameter(
                "machine count must be at least 1".to_string(),
            ));
        }
        if self.machines.cores < 4 {
            return Err(SimError::InvalidParameter(format!(
                "cores per machine must be at least 4, got {}",
                self.machines.cores
            )));
        }
        if self.machines.per_core_perf <= 0.0 {
            return Err(SimError::InvalidParameter(
                "per-core performance must be positive".to_string(),
            ));
        }
        if self.monitor.window < 2 {
            return Err(SimError::InvalidParameter(
                "monitor window needs at least 2 samples".to_string(),
            ));
        }
        if self.scaling.headroom == 0 {
            return Err(SimError::InvalidParameter(
                "pooling headroom must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Physical machine topology
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Number of physical machines
    pub count: u32,

    /// Cores per machine (the CLI rejects values below 4)
    pub cores: u32,

    /// Work units one core processes per simulated millisecond
    pub per_core_perf: f64,

    /// Memory per machine in MB
    pub memory_mb: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            count: 4,
            cores: 8,
            per_core_perf: 1.0,
            memory_mb: 16_384,
        }
    }
}

/// Appliance repository storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Repository capacity in bytes
    pub capacity_bytes: u64,

    /// Repository transfer bandwidth in bytes per simulated millisecond
    pub transfer_bytes_per_ms: u64,

    /// Boot cost of a freshly built appliance, in milliseconds
    pub appliance_boot_ms: SimTime,

    /// Disk size of a freshly built appliance, in bytes
    pub appliance_size_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 32 * GIB,
            transfer_bytes_per_ms: 100_000,
            appliance_boot_ms: 15 * time::SECOND,
            appliance_size_bytes: GIB,
        }
    }
}

/// One gibibyte.
pub const GIB: u64 = 1 << 30;

/// Autoscaling control law
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Control loop cadence in milliseconds
    pub cadence_ms: SimTime,

    /// Below this hourly utilization an idle VM is a shrink candidate
    pub min_util: f64,

    /// Above this mean hourly utilization the pool grows
    pub max_util: f64,

    /// Consecutive would-destroy ticks before a grace period expires
    pub idle_tick_limit: u32,

    /// Idle VMs a pool must retain (Pooling policy)
    pub headroom: usize,

    /// Seed for the randomized eviction policy
    pub seed: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            cadence_ms: 2 * time::MINUTE,
            min_util: 0.2,
            max_util: 0.75,
            idle_tick_limit: 30,
            headroom: 4,
            seed: 42,
        }
    }
}

/// Per-VM utilization sampling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling period in milliseconds
    pub sample_period_ms: SimTime,

    /// Number of samples in the sliding window
    pub window: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_period_ms: 5 * time::MINUTE,
            window: 12,
        }
    }
}

/// Rejected-job retry queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Retry cadence in milliseconds
    pub retry_period_ms: SimTime,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_period_ms: 10 * time::SECOND,
        }
    }
}
