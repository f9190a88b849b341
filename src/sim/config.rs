use std::path::PathBuf;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::*;

use crate::stats::cycle::WindowPolicy;
use crate::stats::memory::DEFAULT_ADDRESS_GRANULARITY;
use crate::stats::types::FuTable;
use crate::timeq::{ServerConfig, DEFAULT_TICK_FREQUENCY};

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> Self {
        match section {
            Some(value) => value.clone().try_into().expect("cannot deserialize config"),
            None => {
                warn!("config section not found");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub accelerator_name: String,
    pub clock_period_ns: u64,
    pub tick_frequency: u64,
    /// Cycles after which an unfinished run is cut off.
    pub timeout_cycles: u64,
    pub workload: Option<PathBuf>,
    pub seed: u64,
    /// Node count of the generated graph when no workload file is given.
    pub synthetic_nodes: usize,
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            accelerator_name: "salam_accel".to_string(),
            clock_period_ns: 10,
            tick_frequency: DEFAULT_TICK_FREQUENCY,
            timeout_cycles: 10_000_000,
            workload: None,
            seed: 0,
            synthetic_nodes: 64,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatsConfig {
    pub cycle_tracking: bool,
    pub output_statistics: bool,
    /// Empty disables report files.
    pub output_file: PathBuf,
    pub pretty_print: bool,
    pub gui_stats_enabled: bool,
    /// Window capacity in cycles.
    pub stat_buffer_size: usize,
    pub window_policy: WindowPolicy,
    pub max_windows: usize,
    pub address_granularity: u64,
    pub power_area_config: Option<PathBuf>,
    pub output_csv: bool,
    pub cycle_trace_file: Option<PathBuf>,
}

impl Config for StatsConfig {}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            cycle_tracking: true,
            output_statistics: true,
            output_file: PathBuf::from("salam_stats.json"),
            pretty_print: true,
            gui_stats_enabled: false,
            stat_buffer_size: 1000,
            window_policy: WindowPolicy::Grow,
            max_windows: 16,
            address_granularity: DEFAULT_ADDRESS_GRANULARITY,
            power_area_config: None,
            output_csv: false,
            cycle_trace_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryConfig {
    pub address: String,
    /// Minimum cycles between two `cycle_update` messages.
    pub publish_interval: u64,
}

impl Config for TelemetryConfig {}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            address: "tcp://*:5555".to_string(),
            publish_interval: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AcceleratorConfig {
    /// Instances per FU type; 0 leaves the type unconstrained.
    pub fu_instances: FuTable<u32>,
    /// Memory reads and writes issued per cycle.
    pub read_ports: u32,
    pub write_ports: u32,
    /// Operations allowed in flight at once.
    pub reservation_size: usize,
    pub spm_size_kb: f64,
    pub cache_size_kb: f64,
    pub cache_line_bytes: u64,
    /// Extra cycles charged to a cache access whose line was never touched.
    pub cache_miss_cycles: u64,
    /// Register file size; 0 reports the peak number of live values instead.
    pub registers: u64,
    pub memory: ServerConfig,
    pub memory_base: u64,
    pub memory_size: usize,
}

impl Config for AcceleratorConfig {}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            fu_instances: FuTable::default(),
            read_ports: 2,
            write_ports: 1,
            reservation_size: 32,
            spm_size_kb: 64.0,
            cache_size_kb: 0.0,
            cache_line_bytes: 64,
            cache_miss_cycles: 10,
            registers: 0,
            memory: ServerConfig {
                base_latency: 2,
                bytes_per_cycle: 8,
                queue_capacity: 8,
            },
            memory_base: 0,
            memory_size: 64 * 1024,
        }
    }
}

/// Every section of one configuration file.
#[derive(Debug, Clone, Default)]
pub struct SalamConfig {
    pub sim: SimConfig,
    pub stats: StatsConfig,
    pub telemetry: TelemetryConfig,
    pub accelerator: AcceleratorConfig,
}

impl SalamConfig {
    pub fn from_table(table: &Table) -> Self {
        Self {
            sim: SimConfig::from_section(table.get("sim")),
            stats: StatsConfig::from_section(table.get("stats")),
            telemetry: TelemetryConfig::from_section(table.get("telemetry")),
            accelerator: AcceleratorConfig::from_section(table.get("accelerator")),
        }
    }
}
