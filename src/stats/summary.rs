use chrono::Local;
use serde::Serialize;

use crate::stats::dataflow::DataflowStats;
use crate::stats::fu::FuUtilization;
use crate::stats::memory::MemoryAccessStats;
use crate::stats::power::{AreaStats, PowerStats};
use crate::stats::stall::StallBreakdown;
use crate::stats::types::{ClassTable, FuTable};

pub const REPORT_VERSION: &str = "3.0";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub setup_time_ns: u64,
    pub sim_time_ns: u64,
    pub clock_period_ns: u64,
    pub sys_clock_ghz: f64,
    pub total_cycles: u64,
    pub stall_cycles: u64,
    pub executed_nodes: u64,
    /// Stalled cycles by which operation classes were in flight.
    pub stalls_by_class: ClassTable<u64>,
    /// Cycles that made progress, by the operation classes issued.
    pub nodes_by_class: ClassTable<u64>,
}

impl PerformanceStats {
    pub fn stall_fraction(&self) -> f64 {
        if self.total_cycles == 0 {
            return 0.0;
        }
        self.stall_cycles as f64 / self.total_cycles as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FunctionalUnitStats {
    pub static_count: FuTable<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub cache_size_kb: f64,
    pub cache_ports: u32,
    pub spm_size_kb: f64,
    pub spm_read_ports: u32,
    pub spm_write_ports: u32,
    pub mem_reads: u64,
    pub mem_writes: u64,
    pub dma_reads: u64,
    pub dma_writes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RegisterStats {
    pub total: u64,
    pub max_usage: u64,
    pub avg_usage: f64,
    pub avg_size_bytes: f64,
    pub reads: u64,
    pub writes: u64,
}

/// Everything the report renders.  Owned by the statistics engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryStats {
    pub version: String,
    pub accelerator_name: String,
    pub timestamp: String,
    pub performance: PerformanceStats,
    pub functional_units: FunctionalUnitStats,
    pub memory: MemoryStats,
    pub registers: RegisterStats,
    pub power: PowerStats,
    pub area: AreaStats,
    pub memory_access: MemoryAccessStats,
    pub dataflow: DataflowStats,
    pub fu_utilization: FuUtilization,
    pub stall_breakdown: StallBreakdown,
}

pub fn timestamp_now() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

impl SummaryStats {
    pub fn new(accelerator_name: &str, address_granularity: u64) -> Self {
        Self {
            version: REPORT_VERSION.to_string(),
            accelerator_name: accelerator_name.to_string(),
            timestamp: timestamp_now(),
            performance: PerformanceStats::default(),
            functional_units: FunctionalUnitStats::default(),
            memory: MemoryStats::default(),
            registers: RegisterStats::default(),
            power: PowerStats::default(),
            area: AreaStats::default(),
            memory_access: MemoryAccessStats::with_granularity(address_granularity),
            dataflow: DataflowStats::default(),
            fu_utilization: FuUtilization::default(),
            stall_breakdown: StallBreakdown::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_shape() {
        let ts = timestamp_now();
        assert_eq!(19, ts.len());
        assert_eq!(Some('T'), ts.chars().nth(10));
        assert_eq!(b'-', ts.as_bytes()[4]);
        assert_eq!(b':', ts.as_bytes()[13]);
    }

    #[test]
    fn new_summary_is_empty() {
        let summary = SummaryStats::new("vadd", 128);
        assert_eq!("3.0", summary.version);
        assert_eq!(0, summary.performance.total_cycles);
        assert_eq!(0.0, summary.performance.stall_fraction());
        assert_eq!(128, summary.memory_access.heatmap.granularity);
    }
}
