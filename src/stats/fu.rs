use serde::Serialize;

use crate::stats::types::{FuTable, FuType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FuInstanceStats {
    pub busy_cycles: u64,
    pub operations: u64,
    /// Cycle the instance's last recorded operation ends.
    pub busy_until: u64,
}

/// Half-open busy interval `[start, end)` on one instance, kept for timeline rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BusyInterval {
    pub instance: u32,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FuTypeUtilization {
    pub instances_available: u32,
    pub max_concurrent_used: u32,
    pub total_busy_cycles: u64,
    pub total_operations: u64,
    pub contention_stalls: u64,
    pub contention_requests: u64,
    pub instance_stats: Vec<FuInstanceStats>,
    pub busy_intervals: Vec<BusyInterval>,
}

impl FuTypeUtilization {
    pub fn set_instances(&mut self, count: u32) {
        self.instances_available = count;
        self.instance_stats.resize(count as usize, FuInstanceStats::default());
    }

    pub fn record_busy(&mut self, instance: u32, start: u64, end: u64) {
        let duration = end.saturating_sub(start);
        self.total_busy_cycles += duration;
        self.total_operations += 1;
        self.busy_intervals.push(BusyInterval {
            instance,
            start,
            end,
        });

        let idx = instance as usize;
        if idx >= self.instance_stats.len() {
            self.instance_stats.resize(idx + 1, FuInstanceStats::default());
        }
        let slot = &mut self.instance_stats[idx];
        slot.busy_cycles += duration;
        slot.operations += 1;
        slot.busy_until = slot.busy_until.max(end);

        let concurrent = self
            .instance_stats
            .iter()
            .filter(|inst| inst.busy_until > start)
            .count() as u32;
        self.max_concurrent_used = self.max_concurrent_used.max(concurrent);
    }

    pub fn record_contention(&mut self) {
        self.contention_stalls += 1;
        self.contention_requests += 1;
    }

    /// contention requests / (operations + contention requests)
    pub fn contention_rate(&self) -> f64 {
        let total = self.total_operations + self.contention_requests;
        if total == 0 {
            return 0.0;
        }
        self.contention_requests as f64 / total as f64
    }

    /// Busy fraction over `total_cycles` across every available instance.
    pub fn utilization(&self, total_cycles: u64) -> f64 {
        let capacity = total_cycles * self.instances_available.max(1) as u64;
        if capacity == 0 {
            return 0.0;
        }
        self.total_busy_cycles as f64 / capacity as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FuUtilization {
    pub by_type: FuTable<FuTypeUtilization>,
    pub total_busy_cycles: u64,
    pub total_contention_stalls: u64,
}

impl FuUtilization {
    pub fn record_busy(&mut self, fu: FuType, instance: u32, start: u64, end: u64) {
        self.by_type[fu].record_busy(instance, start, end);
        self.total_busy_cycles += end.saturating_sub(start);
    }

    pub fn record_contention(&mut self, fu: FuType) {
        self.by_type[fu].record_contention();
        self.total_contention_stalls += 1;
    }

    /// Type with the most contention stalls, if any saw contention.
    pub fn most_contended(&self) -> Option<FuType> {
        let mut best = None;
        let mut best_count = 0;
        for (fu, stats) in self.by_type.iter() {
            if stats.contention_stalls > best_count {
                best = Some(fu);
                best_count = stats.contention_stalls;
            }
        }
        best
    }
}
