use serde::Serialize;

use crate::stats::types::{CauseTable, FuTable, FuType, StallCause, TableKey};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStallDetail {
    pub read_stalls: u64,
    pub write_stalls: u64,
    pub cache_miss_stalls: u64,
    pub dma_stalls: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DependencyStallDetail {
    pub raw_stalls: u64,
    pub waw_stalls: u64,
    pub war_stalls: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceStallDetail {
    pub read_port_stalls: u64,
    pub write_port_stalls: u64,
    pub reservation_full: u64,
    pub compute_queue_full: u64,
}

/// Which queue refused new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Reservation,
    Compute,
}

/// Per-cause stall accounting with consecutive-stall tracking.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StallBreakdown {
    pub by_cause: CauseTable<u64>,
    pub fu_stalls_by_type: FuTable<u64>,
    pub memory: MemoryStallDetail,
    pub dependency: DependencyStallDetail,
    pub resource: ResourceStallDetail,
    pub total_stall_cycles: u64,
    pub max_consecutive_stalls: u64,
    pub current_streak: u64,
    pub stall_events: u64,
}

impl StallBreakdown {
    /// Attributes one stalled cycle to `cause`.
    pub fn record_stall(&mut self, cause: StallCause) {
        if cause == StallCause::None {
            self.record_no_stall();
            return;
        }
        self.by_cause[cause] += 1;
        self.total_stall_cycles += 1;
        self.current_streak += 1;
        self.max_consecutive_stalls = self.max_consecutive_stalls.max(self.current_streak);

        match cause {
            StallCause::RawHazard => self.dependency.raw_stalls += 1,
            StallCause::WawHazard => self.dependency.waw_stalls += 1,
            StallCause::WarHazard => self.dependency.war_stalls += 1,
            StallCause::DmaPending => self.memory.dma_stalls += 1,
            _ => {}
        }
    }

    /// Closes the current streak.  A stall event is counted only for a non-empty streak.
    pub fn record_no_stall(&mut self) {
        if self.current_streak > 0 {
            self.stall_events += 1;
            self.current_streak = 0;
        }
    }

    /// Counts a contention event against `cause` without touching the streak.
    pub fn note_contention(&mut self, cause: StallCause) {
        self.by_cause[cause] += 1;
    }

    pub fn note_fu_stall(&mut self, fu: FuType) {
        self.fu_stalls_by_type[fu] += 1;
        self.note_contention(StallCause::FuContention);
    }

    pub fn note_port_stall(&mut self, is_read: bool) {
        if is_read {
            self.resource.read_port_stalls += 1;
        } else {
            self.resource.write_port_stalls += 1;
        }
        self.note_contention(StallCause::PortContention);
    }

    pub fn note_memory_stall(&mut self, is_write: bool, cache_miss: bool) {
        if is_write {
            self.memory.write_stalls += 1;
        } else {
            self.memory.read_stalls += 1;
        }
        if cache_miss {
            self.memory.cache_miss_stalls += 1;
        }
    }

    pub fn note_queue_full(&mut self, queue: QueueKind) {
        match queue {
            QueueKind::Reservation => self.resource.reservation_full += 1,
            QueueKind::Compute => self.resource.compute_queue_full += 1,
        }
    }

    /// Cause with the highest count, ignoring `none`.  Ties go to the earlier enumerator.
    pub fn dominant_cause(&self) -> StallCause {
        let mut best = StallCause::None;
        let mut best_count = 0;
        for (cause, &count) in self.by_cause.iter().skip(1) {
            if count > best_count {
                best = cause;
                best_count = count;
            }
        }
        best
    }

    pub fn dominant_bottleneck(&self) -> &'static str {
        self.dominant_cause().bottleneck_name()
    }

    pub fn avg_stall_duration(&self) -> f64 {
        if self.stall_events == 0 {
            return 0.0;
        }
        self.total_stall_cycles as f64 / self.stall_events as f64
    }

    pub fn cause_counts(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.by_cause.iter().map(|(cause, &count)| (cause.name(), count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streak_closes_into_one_event() {
        let mut stalls = StallBreakdown::default();
        for _ in 0..5 {
            stalls.record_stall(StallCause::MemoryLatency);
        }
        stalls.record_no_stall();
        assert_eq!(5, stalls.max_consecutive_stalls);
        assert_eq!(1, stalls.stall_events);
        assert_eq!(0, stalls.current_streak);
        assert_eq!(5.0, stalls.avg_stall_duration());
    }

    #[test]
    fn no_stall_without_streak_is_silent() {
        let mut stalls = StallBreakdown::default();
        stalls.record_no_stall();
        stalls.record_no_stall();
        assert_eq!(0, stalls.stall_events);
        assert_eq!(0.0, stalls.avg_stall_duration());
    }

    #[test]
    fn longest_streak_is_kept() {
        let mut stalls = StallBreakdown::default();
        stalls.record_stall(StallCause::RawHazard);
        stalls.record_stall(StallCause::RawHazard);
        stalls.record_stall(StallCause::RawHazard);
        stalls.record_no_stall();
        stalls.record_stall(StallCause::WarHazard);
        stalls.record_no_stall();
        assert_eq!(3, stalls.max_consecutive_stalls);
        assert_eq!(2, stalls.stall_events);
        assert_eq!(3, stalls.dependency.raw_stalls);
        assert_eq!(1, stalls.dependency.war_stalls);
    }

    #[test]
    fn dominant_cause_prefers_highest_then_lowest_enumerator() {
        let mut stalls = StallBreakdown::default();
        assert_eq!(StallCause::None, stalls.dominant_cause());
        assert_eq!("none", stalls.dominant_bottleneck());

        stalls.by_cause[StallCause::PortContention] = 4;
        stalls.by_cause[StallCause::RawHazard] = 4;
        assert_eq!(StallCause::RawHazard, stalls.dominant_cause());
        assert_eq!("data_dependency", stalls.dominant_bottleneck());

        stalls.by_cause[StallCause::None] = 100;
        stalls.by_cause[StallCause::DmaPending] = 5;
        assert_eq!("dma", stalls.dominant_bottleneck());
    }

    #[test]
    fn contention_does_not_extend_streak() {
        let mut stalls = StallBreakdown::default();
        stalls.note_fu_stall(FuType::IntMulDiv);
        stalls.note_port_stall(false);
        assert_eq!(0, stalls.current_streak);
        assert_eq!(0, stalls.total_stall_cycles);
        assert_eq!(1, stalls.by_cause[StallCause::FuContention]);
        assert_eq!(1, stalls.by_cause[StallCause::PortContention]);
        assert_eq!(1, stalls.fu_stalls_by_type[FuType::IntMulDiv]);
        assert_eq!(1, stalls.resource.write_port_stalls);
    }
}
