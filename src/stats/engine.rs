use std::collections::HashMap;
use std::path::Path;

use log::{debug, warn};

use crate::sim::config::StatsConfig;
use crate::stats::cycle::{CycleSnapshot, CycleStatsSummary, CycleWindows};
use crate::stats::dataflow::{DepKind, DepthTracker};
use crate::stats::power::{
    area_from_activity, power_from_activity, Activity, AreaStats, PowerAreaCoefficients,
    PowerBlocks, PowerStats,
};
use crate::stats::report;
use crate::stats::stall::QueueKind;
use crate::stats::summary::{MemoryStats, RegisterStats, SummaryStats};
use crate::stats::types::{ClassTable, FuTable, FuType, MemAccessType, StallCause, TableKey};
use crate::telemetry::{TelemetryEvent, TelemetryMessage, TelemetrySink};

#[derive(Debug, Clone, Copy, Default)]
struct InstructionInfo {
    opcode: u32,
    is_load: bool,
    is_store: bool,
}

/// Cycle-level statistics for one accelerator.
///
/// The engine exclusively owns the summary and the snapshot windows.  The timing model fills
/// the current snapshot during a cycle and closes it with `cycle_end`; everything else is
/// event counters and end-of-run derivations.
pub struct HwStatistics {
    config: StatsConfig,
    summary: SummaryStats,
    windows: CycleWindows,
    current: CycleSnapshot,
    depth: DepthTracker,
    instructions: HashMap<u32, InstructionInfo>,
    coefficients: PowerAreaCoefficients,
    // set once power/area come from coefficients x activity
    activity_derived: bool,
    sink: Box<dyn TelemetrySink>,
    publish_interval: u64,
    last_cycle_update: Option<u64>,
}

impl HwStatistics {
    pub fn new(config: StatsConfig, accelerator_name: &str, sink: Box<dyn TelemetrySink>) -> Self {
        let coefficients = match &config.power_area_config {
            Some(path) => PowerAreaCoefficients::load_or_default(path).0,
            None => PowerAreaCoefficients::default(),
        };
        Self {
            windows: CycleWindows::new(
                config.stat_buffer_size.max(1),
                config.window_policy,
                config.max_windows,
            ),
            summary: SummaryStats::new(accelerator_name, config.address_granularity),
            current: CycleSnapshot::default(),
            depth: DepthTracker::default(),
            instructions: HashMap::new(),
            coefficients,
            activity_derived: false,
            sink,
            publish_interval: 1,
            last_cycle_update: None,
            config,
        }
    }

    pub fn with_publish_interval(mut self, cycles: u64) -> Self {
        self.publish_interval = cycles;
        self
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    pub fn summary(&self) -> &SummaryStats {
        &self.summary
    }

    pub fn windows(&self) -> &CycleWindows {
        &self.windows
    }

    // ---- cycle recording ----

    /// Starts a fresh snapshot for `cycle`.
    pub fn cycle_start(&mut self, cycle: u64) {
        self.current = CycleSnapshot::new(cycle);
    }

    pub fn current_cycle_mut(&mut self) -> &mut CycleSnapshot {
        &mut self.current
    }

    /// Pushes the current snapshot.  Returns the window closed by this push, if any.
    pub fn cycle_end(&mut self) -> Option<&[CycleSnapshot]> {
        let snapshot = std::mem::take(&mut self.current);
        self.record_cycle_stats(snapshot)
    }

    pub fn record_cycle_stats(&mut self, snapshot: CycleSnapshot) -> Option<&[CycleSnapshot]> {
        self.summary
            .memory_access
            .record_cycle_bandwidth(snapshot.bytes_read, snapshot.bytes_written);
        if !self.config.cycle_tracking {
            return None;
        }
        self.windows.record(snapshot)
    }

    pub fn update_buffer(&mut self) {
        self.windows.update_buffer();
    }

    pub fn summarize_cycle_stats(&self) -> CycleStatsSummary {
        self.windows.summarize()
    }

    // ---- stalls ----

    pub fn record_stall_cause(&mut self, cause: StallCause) {
        self.current.stall_cause = cause;
        self.summary.stall_breakdown.record_stall(cause);
    }

    pub fn record_no_stall(&mut self) {
        self.current.stall_cause = StallCause::None;
        self.summary.stall_breakdown.record_no_stall();
    }

    pub fn record_memory_stall(&mut self, is_write: bool, cache_miss: bool) {
        self.record_stall_cause(StallCause::MemoryLatency);
        self.summary
            .stall_breakdown
            .note_memory_stall(is_write, cache_miss);
    }

    /// A cycle lost to a busy FU: contention on `fu` plus the stall attribution.
    pub fn record_fu_stall(&mut self, fu: FuType) {
        self.record_fu_contention(fu);
        self.record_stall_cause(StallCause::FuContention);
        self.current.comp_fu_stall = true;
    }

    pub fn record_queue_full_stall(&mut self, queue: QueueKind) {
        self.record_stall_cause(StallCause::ResourceLimit);
        self.summary.stall_breakdown.note_queue_full(queue);
        self.summary.memory_access.queue_full_stalls += 1;
    }

    pub fn dominant_cause(&self) -> StallCause {
        self.summary.stall_breakdown.dominant_cause()
    }

    pub fn dominant_bottleneck(&self) -> &'static str {
        self.summary.stall_breakdown.dominant_bottleneck()
    }

    // ---- functional units ----

    pub fn set_fu_instances(&mut self, fu: FuType, count: u32) {
        self.summary.fu_utilization.by_type[fu].set_instances(count);
    }

    pub fn record_fu_busy(&mut self, fu: FuType, instance: u32, start: u64, end: u64) {
        self.summary
            .fu_utilization
            .record_busy(fu, instance, start, end);
        self.current.fu_busy_mask |= fu.mask_bit();
    }

    pub fn record_fu_contention(&mut self, fu: FuType) {
        self.summary.fu_utilization.record_contention(fu);
        self.summary.stall_breakdown.note_fu_stall(fu);
    }

    // ---- dataflow ----

    /// Notes opcode and memory role of an instruction for critical-path composition.
    pub fn record_instruction(&mut self, uid: u32, opcode: u32, is_load: bool, is_store: bool) {
        self.instructions.insert(
            uid,
            InstructionInfo {
                opcode,
                is_load,
                is_store,
            },
        );
        self.depth.add_node(uid);
    }

    pub fn record_dependency(
        &mut self,
        producer: u32,
        consumer: u32,
        is_raw: bool,
        is_war: bool,
        is_waw: bool,
    ) {
        self.summary.dataflow.record_dependency(DepKind {
            raw: is_raw,
            war: is_war,
            waw: is_waw,
        });
        self.track_edge(producer, consumer);
    }

    pub fn record_control_dependency(&mut self, producer: u32, consumer: u32) {
        self.summary.dataflow.control_dependencies += 1;
        self.summary.dataflow.total_dependency_edges += 1;
        self.track_edge(producer, consumer);
    }

    pub fn record_memory_dependency(&mut self, producer: u32, consumer: u32) {
        self.summary.dataflow.memory_dependencies += 1;
        self.summary.dataflow.total_dependency_edges += 1;
        self.track_edge(producer, consumer);
    }

    fn track_edge(&mut self, producer: u32, consumer: u32) {
        self.depth.add_edge(producer, consumer);
        let (max, avg) = self.depth.running_depth();
        self.summary.dataflow.max_dependency_depth = max;
        self.summary.dataflow.avg_dependency_depth = avg;
    }

    pub fn record_critical_path_node(&mut self, opcode: u32, is_load: bool, is_store: bool) {
        self.summary
            .dataflow
            .record_critical_path_node(opcode, is_load, is_store);
    }

    pub fn record_parallelism(&mut self, ready: u64, issued: u64) {
        self.summary.dataflow.record_parallelism(ready, issued);
    }

    pub fn set_critical_path_length(&mut self, length: u64) {
        self.summary.dataflow.critical_path_length = length;
    }

    /// Derives the critical path from every dependency recorded so far and replaces the
    /// critical-path composition with it.  Returns the path, producer first.
    pub fn compute_critical_path(&mut self) -> Vec<u32> {
        if self.depth.is_empty() {
            return Vec::new();
        }
        let depths = self.depth.depths();
        let path = self.depth.critical_path(&depths);

        let df = &mut self.summary.dataflow;
        df.critical_path_length = path.len() as u64;
        df.critical_path_instructions = 0;
        df.critical_path_loads = 0;
        df.critical_path_stores = 0;
        df.critical_path_computes = 0;
        df.critical_path_by_opcode.clear();
        df.max_dependency_depth = depths.values().copied().max().unwrap_or(0);
        df.avg_dependency_depth = depths.values().sum::<u64>() as f64 / depths.len() as f64;

        for uid in &path {
            let info = self.instructions.get(uid).copied().unwrap_or_default();
            self.record_critical_path_node(info.opcode, info.is_load, info.is_store);
        }
        debug!("critical path of {} instructions", path.len());
        path
    }

    // ---- memory ----

    pub fn record_memory_read(
        &mut self,
        addr: u64,
        bytes: u64,
        latency: u64,
        cache_hit: bool,
        kind: MemAccessType,
    ) {
        self.summary
            .memory_access
            .record_read(addr, bytes, latency, cache_hit, kind);
        self.current.bytes_read += bytes;
    }

    pub fn record_memory_write(
        &mut self,
        addr: u64,
        bytes: u64,
        latency: u64,
        cache_hit: bool,
        kind: MemAccessType,
    ) {
        self.summary
            .memory_access
            .record_write(addr, bytes, latency, cache_hit, kind);
        self.current.bytes_written += bytes;
    }

    pub fn record_dma_transfer(&mut self, is_read: bool, bytes: u64, latency: u64) {
        self.summary
            .memory_access
            .record_dma_transfer(is_read, bytes, latency);
    }

    pub fn record_port_contention(&mut self, is_read: bool) {
        self.summary.memory_access.record_port_stall(is_read);
        self.summary.stall_breakdown.note_port_stall(is_read);
    }

    // ---- end-of-run inputs ----

    pub fn collect_performance_stats(
        &mut self,
        setup_time_ns: u64,
        sim_time_ns: u64,
        clock_period_ns: u64,
        total_cycles: u64,
        stall_cycles: u64,
    ) {
        let perf = &mut self.summary.performance;
        perf.setup_time_ns = setup_time_ns;
        perf.sim_time_ns = sim_time_ns;
        perf.clock_period_ns = clock_period_ns;
        perf.sys_clock_ghz = if clock_period_ns == 0 {
            0.0
        } else {
            1.0 / clock_period_ns as f64
        };
        perf.total_cycles = total_cycles;
        perf.stall_cycles = stall_cycles;
        perf.executed_nodes = total_cycles.saturating_sub(stall_cycles).saturating_sub(1);
    }

    pub fn collect_stall_breakdown(&mut self, stalls: ClassTable<u64>, nodes: ClassTable<u64>) {
        self.summary.performance.stalls_by_class = stalls;
        self.summary.performance.nodes_by_class = nodes;
    }

    pub fn collect_fu_static_counts(&mut self, counts: FuTable<u32>) {
        for (fu, &count) in counts.iter() {
            if self.summary.fu_utilization.by_type[fu].instances_available == 0 {
                self.set_fu_instances(fu, count);
            }
        }
        self.summary.functional_units.static_count = counts;
    }

    pub fn collect_memory_stats(&mut self, memory: MemoryStats) {
        self.summary.memory = memory;
    }

    pub fn collect_register_stats(&mut self, registers: RegisterStats) {
        self.summary.registers = registers;
    }

    /// Hand-supplied power components.  Ignored once power is derived from activity.
    pub fn collect_power_stats(&mut self, blocks: &PowerBlocks) {
        if self.activity_derived {
            warn!("power is derived from activity counts; ignoring supplied power figures");
            return;
        }
        self.summary.power = PowerStats::from_blocks(blocks, self.runtime_ns());
    }

    /// Hand-supplied area components.  Ignored once area is derived from activity.
    pub fn collect_area_stats(&mut self, fu: f64, reg: f64, spm: f64, cache: f64) {
        if self.activity_derived {
            warn!("area is derived from the configuration; ignoring supplied area figures");
            return;
        }
        self.summary.area = AreaStats::from_blocks(fu, reg, spm, cache);
    }

    // ---- power/area ----

    pub fn coefficients(&self) -> &PowerAreaCoefficients {
        &self.coefficients
    }

    pub fn set_coefficients(&mut self, coefficients: PowerAreaCoefficients) {
        self.coefficients = coefficients;
    }

    /// Returns whether the file was used; on failure the defaults are in effect.
    pub fn load_power_area_config(&mut self, path: &Path) -> bool {
        let (coefficients, used) = PowerAreaCoefficients::load_or_default(path);
        self.coefficients = coefficients;
        used
    }

    pub fn save_power_area_config(&self, path: &Path) -> Result<(), anyhow::Error> {
        self.coefficients.save(path)
    }

    fn runtime_ns(&self) -> f64 {
        let perf = &self.summary.performance;
        perf.total_cycles as f64 * perf.clock_period_ns as f64
    }

    fn activity(&self) -> Activity {
        let s = &self.summary;
        Activity {
            static_count: s.functional_units.static_count.clone(),
            operations: FuTable::from_fn(|fu| s.fu_utilization.by_type[fu].total_operations),
            registers: s.registers.total,
            register_reads: s.registers.reads,
            register_writes: s.registers.writes,
            spm_size_kb: s.memory.spm_size_kb,
            cache_size_kb: s.memory.cache_size_kb,
            spm_reads: s.memory_access.spm_reads,
            spm_writes: s.memory_access.spm_writes,
            cache_reads: s.memory_access.cache_reads(),
            cache_writes: s.memory_access.cache_writes(),
            runtime_ns: self.runtime_ns(),
        }
    }

    pub fn calculate_power_with_activity(&mut self) -> &PowerStats {
        self.activity_derived = true;
        self.summary.power = power_from_activity(&self.coefficients, &self.activity());
        &self.summary.power
    }

    pub fn calculate_area_from_config(&mut self) -> &AreaStats {
        self.activity_derived = true;
        self.summary.area = area_from_activity(&self.coefficients, &self.activity());
        &self.summary.area
    }

    /// Zeroes the summary and the windows.  Window allocations and coefficients are kept.
    pub fn clear_stats(&mut self) {
        self.summary = SummaryStats::new(
            &self.summary.accelerator_name,
            self.config.address_granularity,
        );
        self.windows.clear();
        self.current = CycleSnapshot::default();
        self.depth.clear();
        self.instructions.clear();
        self.activity_derived = false;
        self.last_cycle_update = None;
    }

    // ---- export ----

    pub fn to_json(&self, pretty: bool) -> String {
        report::to_json(&self.summary, pretty)
    }

    pub fn print_summary(&self) -> String {
        report::print_summary(&self.summary)
    }

    pub fn to_csv(&self) -> String {
        report::to_csv(&self.summary, &self.summarize_cycle_stats())
    }

    /// Writes the JSON report to `output_file`, and the CSV next to it when enabled.
    pub fn write_json_file(&self) -> Result<(), anyhow::Error> {
        if !self.config.output_statistics {
            return Ok(());
        }
        report::write_report(&self.config.output_file, &self.to_json(self.config.pretty_print))?;
        if self.config.output_csv {
            let csv_path = self.config.output_file.with_extension("csv");
            report::write_report(&csv_path, &self.to_csv())?;
        }
        Ok(())
    }

    // ---- telemetry ----

    pub fn telemetry_enabled(&self) -> bool {
        self.config.gui_stats_enabled && self.sink.is_enabled()
    }

    fn publish(&mut self, cycle: u64, event: TelemetryEvent) {
        if !self.telemetry_enabled() {
            return;
        }
        self.sink.publish(&TelemetryMessage::new(cycle, &event));
    }

    pub fn publish_sim_start(&mut self, sim_name: &str) {
        let accel_name = self.summary.accelerator_name.clone();
        self.publish(
            0,
            TelemetryEvent::SimStart {
                sim_name: sim_name.to_string(),
                accel_name,
            },
        );
    }

    /// Sends the final report followed by `sim_end`.
    pub fn publish_sim_end(&mut self) {
        let total_cycles = self.summary.performance.total_cycles;
        self.publish_stats(total_cycles);
        self.publish(total_cycles, TelemetryEvent::SimEnd { total_cycles });
    }

    /// Rate limited to one message per publish interval.
    pub fn publish_cycle_update(&mut self, cycle: u64) {
        if let Some(last) = self.last_cycle_update {
            if cycle.saturating_sub(last) < self.publish_interval {
                return;
            }
        }
        if !self.telemetry_enabled() {
            return;
        }
        self.last_cycle_update = Some(cycle);
        self.publish(cycle, TelemetryEvent::CycleUpdate);
    }

    pub fn publish_queue_state(&mut self, cycle: u64, read: usize, write: usize, compute: usize) {
        self.publish(
            cycle,
            TelemetryEvent::QueueState {
                read_depth: read,
                write_depth: write,
                compute_depth: compute,
            },
        );
    }

    pub fn publish_fu_state(&mut self, cycle: u64, fu: FuType, busy: bool) {
        let utilization = self.summary.fu_utilization.by_type[fu].utilization(cycle.max(1));
        self.publish(
            cycle,
            TelemetryEvent::FuState {
                fu_name: fu.name().to_string(),
                busy,
                utilization,
            },
        );
    }

    pub fn publish_instruction_issue(&mut self, cycle: u64, uid: u32, opcode: &str, fu: FuType) {
        self.publish(
            cycle,
            TelemetryEvent::InstructionIssue {
                uid,
                opcode: opcode.to_string(),
                fu_type: fu.name().to_string(),
            },
        );
    }

    pub fn publish_instruction_complete(&mut self, cycle: u64, uid: u32) {
        self.publish(cycle, TelemetryEvent::InstructionComplete { uid });
    }

    pub fn publish_stall(&mut self, cycle: u64, uid: u32, cause: StallCause) {
        self.publish(
            cycle,
            TelemetryEvent::Stall {
                uid,
                reason: cause.name().to_string(),
            },
        );
    }

    pub fn publish_stats(&mut self, cycle: u64) {
        if !self.telemetry_enabled() {
            return;
        }
        let report = report::to_value(&self.summary);
        self.publish(cycle, TelemetryEvent::StatsUpdate(report));
    }

    pub fn publish_memory_access(
        &mut self,
        cycle: u64,
        address: u64,
        size: u64,
        kind: MemAccessType,
    ) {
        let is_write = matches!(
            kind,
            MemAccessType::CacheWrite
                | MemAccessType::SpmWrite
                | MemAccessType::DmaWrite
                | MemAccessType::LocalWrite
        );
        self.publish(
            cycle,
            TelemetryEvent::MemoryAccess {
                address,
                size,
                is_write,
                access_type: kind.name().to_string(),
            },
        );
    }

    pub fn publish_fu_activity(&mut self, fu: FuType, instance: u32, uid: u32, start: u64, end: u64) {
        self.publish(
            start,
            TelemetryEvent::FuActivity {
                fu_type: fu.name().to_string(),
                instance,
                uid,
                start_cycle: start,
                end_cycle: end,
            },
        );
    }

    pub fn publish_dataflow_node(
        &mut self,
        cycle: u64,
        uid: u32,
        opcode: &str,
        queue: u32,
        dependencies: &[u32],
    ) {
        self.publish(
            cycle,
            TelemetryEvent::DataflowNode {
                uid,
                opcode: opcode.to_string(),
                queue,
                dependencies: dependencies.to_vec(),
            },
        );
    }

    pub fn publish_dataflow_edge(&mut self, cycle: u64, producer: u32, consumer: u32, critical: bool) {
        self.publish(
            cycle,
            TelemetryEvent::DataflowEdge {
                producer,
                consumer,
                critical,
            },
        );
    }

    pub fn publish_heartbeat(&mut self) {
        self.publish(0, TelemetryEvent::Heartbeat);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::cycle::WindowPolicy;
    use crate::stats::power::FuCoefficients;
    use crate::telemetry::{BufferSink, NullSink};

    fn engine(config: StatsConfig) -> HwStatistics {
        HwStatistics::new(config, "test_accel", Box::new(NullSink))
    }

    fn small_windows(k: usize) -> StatsConfig {
        StatsConfig {
            stat_buffer_size: k,
            output_statistics: false,
            ..StatsConfig::default()
        }
    }

    #[test]
    fn window_rotates_after_capacity() {
        let mut stats = engine(small_windows(8));
        for cycle in 0..9 {
            stats.cycle_start(cycle);
            stats.current_cycle_mut().load_in_flight = 1;
            stats.cycle_end();
        }
        assert_eq!(1, stats.windows().rotations());
        assert_eq!(9, stats.summarize_cycle_stats().total_samples);
    }

    #[test]
    fn tracking_off_skips_windows_but_keeps_bandwidth() {
        let mut stats = engine(StatsConfig {
            cycle_tracking: false,
            ..small_windows(4)
        });
        stats.cycle_start(0);
        stats.record_memory_read(0x40, 16, 2, false, MemAccessType::SpmRead);
        assert!(stats.cycle_end().is_none());
        assert_eq!(0, stats.summarize_cycle_stats().total_samples);
        assert_eq!(16, stats.summary().memory_access.peak_read_bytes_per_cycle);
    }

    #[test]
    fn dominant_bottleneck_memory_over_compute() {
        let mut stats = engine(StatsConfig::default());
        for _ in 0..10 {
            stats.record_stall_cause(StallCause::MemoryLatency);
        }
        for _ in 0..3 {
            stats.record_stall_cause(StallCause::FuContention);
        }
        assert_eq!(StallCause::MemoryLatency, stats.dominant_cause());
        assert_eq!("memory_latency", stats.dominant_bottleneck());
    }

    #[test]
    fn fu_contention_feeds_both_records() {
        let mut stats = engine(StatsConfig::default());
        stats.record_fu_busy(FuType::IntMulDiv, 0, 0, 3);
        stats.record_fu_contention(FuType::IntMulDiv);
        let s = stats.summary();
        assert_eq!(1, s.fu_utilization.by_type[FuType::IntMulDiv].contention_stalls);
        assert_eq!(1, s.stall_breakdown.fu_stalls_by_type[FuType::IntMulDiv]);
        assert_eq!(1, s.stall_breakdown.by_cause[StallCause::FuContention]);
        assert_eq!(0, s.stall_breakdown.current_streak);
        assert_eq!(0.5, s.fu_utilization.by_type[FuType::IntMulDiv].contention_rate());
    }

    #[test]
    fn port_contention_counts() {
        let mut stats = engine(StatsConfig::default());
        stats.record_port_contention(true);
        stats.record_port_contention(false);
        stats.record_port_contention(true);
        let s = stats.summary();
        assert_eq!(2, s.memory_access.read_port_stalls);
        assert_eq!(1, s.stall_breakdown.resource.write_port_stalls);
        assert_eq!(3, s.stall_breakdown.by_cause[StallCause::PortContention]);
    }

    #[test]
    fn critical_path_from_dependencies() {
        let mut stats = engine(StatsConfig::default());
        stats.record_instruction(1, 32, true, false);
        stats.record_instruction(2, 32, true, false);
        stats.record_instruction(3, 13, false, false);
        stats.record_instruction(4, 33, false, true);
        stats.record_dependency(1, 3, true, false, false);
        stats.record_dependency(2, 3, true, false, false);
        stats.record_dependency(3, 4, true, false, false);
        stats.record_control_dependency(1, 2);
        stats.record_parallelism(2, 2);
        stats.record_parallelism(1, 1);
        stats.record_parallelism(1, 1);

        let path = stats.compute_critical_path();
        assert_eq!(vec![1, 2, 3, 4], path);
        let df = &stats.summary().dataflow;
        assert_eq!(4, df.critical_path_length);
        assert_eq!((2, 1, 1), (df.critical_path_loads, df.critical_path_stores, df.critical_path_computes));
        assert_eq!(4, df.max_dependency_depth);
        assert_eq!(4, df.total_dependency_edges);
        assert_eq!(1, df.control_dependencies);
        assert_eq!(1.0, df.ilp());

        // recomputing does not double count
        stats.compute_critical_path();
        assert_eq!(4, stats.summary().dataflow.critical_path_instructions);
    }

    #[test]
    fn stall_helpers_attribute_one_cause() {
        let mut stats = engine(StatsConfig::default());
        stats.record_memory_stall(false, true);
        stats.record_fu_stall(FuType::Gep);
        stats.record_queue_full_stall(QueueKind::Compute);
        stats.record_no_stall();
        let b = &stats.summary().stall_breakdown;
        assert_eq!(3, b.total_stall_cycles);
        assert_eq!(1, b.stall_events);
        assert_eq!(1, b.memory.cache_miss_stalls);
        assert_eq!(1, b.fu_stalls_by_type[FuType::Gep]);
        assert_eq!(1, b.resource.compute_queue_full);
        assert_eq!(1, stats.summary().memory_access.queue_full_stalls);
    }

    #[test]
    fn fu_stall_counts_as_contention() {
        let mut stats = engine(StatsConfig::default());
        stats.record_fu_busy(FuType::FpDoubleMulDiv, 0, 0, 4);
        stats.record_fu_stall(FuType::FpDoubleMulDiv);
        stats.record_fu_stall(FuType::FpDoubleMulDiv);

        let s = stats.summary();
        let util = &s.fu_utilization.by_type[FuType::FpDoubleMulDiv];
        assert_eq!(2, util.contention_requests);
        assert_eq!(2, util.contention_stalls);
        assert!((util.contention_rate() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(2, s.stall_breakdown.fu_stalls_by_type[FuType::FpDoubleMulDiv]);
        assert_eq!(2, s.stall_breakdown.current_streak);
        assert_eq!("fp_double_muldiv", s.fu_utilization.most_contended().map_or("none", |fu| fu.name()));
        assert!(stats.current.comp_fu_stall);
    }

    #[test]
    fn single_adder_end_to_end_power() {
        let mut stats = engine(StatsConfig::default());
        let mut coeffs = PowerAreaCoefficients::default();
        coeffs.functional_units[FuType::IntAddSub] =
            FuCoefficients::new(179.443, 0.00238, 0.0081, 0.0062);
        stats.set_coefficients(coeffs);

        let mut counts = FuTable::default();
        counts[FuType::IntAddSub] = 1;
        stats.collect_fu_static_counts(counts);
        for i in 0..4 {
            stats.record_fu_busy(FuType::IntAddSub, 0, i, i + 1);
        }
        stats.collect_performance_stats(0, 40, 10, 4, 0);

        let power = *stats.calculate_power_with_activity();
        assert!((power.fu_leakage - 0.00238).abs() < 1e-9);
        assert!((power.fu_dynamic - 0.0572).abs() < 1e-9);
        assert!((power.fu_total - 0.05958).abs() < 1e-9);
        assert!((power.total_energy_nj - 0.05958 * 40.0 / 1e3).abs() < 1e-12);
        assert_eq!(power, *stats.calculate_power_with_activity());
        assert!((stats.calculate_area_from_config().fu_area_um2 - 179.443).abs() < 1e-9);
    }

    #[test]
    fn manual_power_ignored_after_activity() {
        let mut stats = engine(StatsConfig::default());
        let blocks = PowerBlocks {
            fu_leakage: 5.0,
            ..PowerBlocks::default()
        };
        stats.collect_power_stats(&blocks);
        assert_eq!(5.0, stats.summary().power.total_power);

        stats.calculate_power_with_activity();
        stats.collect_power_stats(&blocks);
        assert_eq!(0.0, stats.summary().power.total_power);
        stats.collect_area_stats(1.0, 1.0, 1.0, 1.0);
        assert_eq!(0.0, stats.summary().area.total_area_um2);
    }

    #[test]
    fn executed_nodes_saturate() {
        let mut stats = engine(StatsConfig::default());
        stats.collect_performance_stats(0, 0, 0, 1, 1);
        assert_eq!(0, stats.summary().performance.executed_nodes);
        assert_eq!(0.0, stats.summary().performance.sys_clock_ghz);
        stats.collect_performance_stats(0, 0, 2, 10, 3);
        assert_eq!(6, stats.summary().performance.executed_nodes);
        assert_eq!(0.5, stats.summary().performance.sys_clock_ghz);
    }

    #[test]
    fn clear_stats_zeroes_and_keeps_capacity() {
        let mut stats = engine(StatsConfig {
            window_policy: WindowPolicy::Wrap,
            max_windows: 3,
            ..small_windows(2)
        });
        for cycle in 0..10 {
            stats.cycle_start(cycle);
            stats.record_stall_cause(StallCause::RawHazard);
            stats.cycle_end();
        }
        stats.record_dependency(1, 2, true, false, false);
        let windows = stats.windows().window_count();
        stats.clear_stats();

        assert_eq!(windows, stats.windows().window_count());
        assert_eq!(0, stats.summarize_cycle_stats().total_samples);
        assert_eq!(0, stats.summary().stall_breakdown.total_stall_cycles);
        assert_eq!(0, stats.summary().dataflow.total_dependency_edges);
        assert_eq!("test_accel", stats.summary().accelerator_name);
        assert!(stats.compute_critical_path().is_empty());
    }

    #[test]
    fn telemetry_respects_switch_and_rate_limit() {
        let sink = BufferSink::new();
        let messages = sink.handle();
        let mut stats = HwStatistics::new(
            StatsConfig {
                gui_stats_enabled: true,
                ..StatsConfig::default()
            },
            "accel",
            Box::new(sink),
        )
        .with_publish_interval(100);

        stats.publish_sim_start("run");
        for cycle in 0..250 {
            stats.publish_cycle_update(cycle);
        }
        stats.publish_fu_activity(FuType::IntAddSub, 0, 9, 3, 4);
        stats.publish_sim_end();

        let kinds: Vec<&str> = messages.borrow().iter().map(|m| m.kind).collect();
        assert_eq!(
            vec![
                "sim_start",
                "cycle_update",
                "cycle_update",
                "cycle_update",
                "fu_activity",
                "stats_update",
                "sim_end"
            ],
            kinds
        );
        let msgs = messages.borrow();
        assert_eq!("accel", msgs[0].data["accel_name"]);
        assert_eq!(200, msgs[3].cycle);
        assert!(msgs[5].data["salam_stats"].is_object());
        assert_eq!("accel", msgs[5].data["salam_stats"]["accelerator_name"]);
        assert_eq!(
            msgs[5].data,
            crate::stats::report::to_value(stats.summary())
        );

        let quiet_sink = BufferSink::new();
        let quiet = quiet_sink.handle();
        let mut off = HwStatistics::new(StatsConfig::default(), "accel", Box::new(quiet_sink));
        off.publish_heartbeat();
        assert!(quiet.borrow().is_empty());
    }

    #[test]
    fn report_files_follow_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output_file = dir.path().join("stats.json");
        let stats = engine(StatsConfig {
            output_file: output_file.clone(),
            output_csv: true,
            ..StatsConfig::default()
        });
        stats.write_json_file().expect("write");
        let json = std::fs::read_to_string(&output_file).expect("json");
        assert!(json.starts_with("{\n  \"salam_stats\": {"));
        assert!(dir.path().join("stats.csv").exists());

        let bad = engine(StatsConfig {
            output_file: dir.path().join("missing").join("stats.json"),
            ..StatsConfig::default()
        });
        assert!(bad.write_json_file().is_err());
    }
}
