use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::stats::types::StallCause;

/// Per-cycle counters, filled in by the timing model during a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleSnapshot {
    pub cycle: u64,
    pub res_in_flight: u32,
    pub load_in_flight: u32,
    pub store_in_flight: u32,
    pub comp_in_flight: u32,
    pub load_raw_stall: bool,
    pub comp_fu_stall: bool,
    pub stall_cause: StallCause,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub fu_busy_mask: u32,
}

impl CycleSnapshot {
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            ..Self::default()
        }
    }
}

/// What happens once every window is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPolicy {
    /// Allocate another window; history is never dropped.
    #[default]
    Grow,
    /// Reuse the oldest window once `max_windows` exist.
    Wrap,
}

impl FromStr for WindowPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "grow" => Ok(Self::Grow),
            "wrap" => Ok(Self::Wrap),
            _ => Err(format!(
                "unsupported window policy '{}', expected one of: grow, wrap",
                value
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CycleStatsSummary {
    pub total_samples: u64,
    pub retained_samples: u64,
    pub avg_res_in_flight: f64,
    pub peak_res_in_flight: u32,
    pub avg_load_in_flight: f64,
    pub peak_load_in_flight: u32,
    pub avg_store_in_flight: f64,
    pub peak_store_in_flight: u32,
    pub avg_comp_in_flight: f64,
    pub peak_comp_in_flight: u32,
    pub total_load_raw_stalls: u64,
    pub total_comp_fu_stalls: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Running {
    res: u64,
    load: u64,
    store: u64,
    comp: u64,
    peak_res: u32,
    peak_load: u32,
    peak_store: u32,
    peak_comp: u32,
    load_raw_stalls: u64,
    comp_fu_stalls: u64,
}

impl Running {
    fn add(&mut self, s: &CycleSnapshot) {
        self.res += s.res_in_flight as u64;
        self.load += s.load_in_flight as u64;
        self.store += s.store_in_flight as u64;
        self.comp += s.comp_in_flight as u64;
        self.peak_res = self.peak_res.max(s.res_in_flight);
        self.peak_load = self.peak_load.max(s.load_in_flight);
        self.peak_store = self.peak_store.max(s.store_in_flight);
        self.peak_comp = self.peak_comp.max(s.comp_in_flight);
        self.load_raw_stalls += s.load_raw_stall as u64;
        self.comp_fu_stalls += s.comp_fu_stall as u64;
    }
}

/// Ring of fixed-capacity snapshot windows indexed by an integer cursor.
///
/// A window rotates when a snapshot arrives and the active window is full.  Aggregates are
/// kept over every recorded snapshot, so the summary does not depend on what is retained.
#[derive(Debug, Clone)]
pub struct CycleWindows {
    capacity: usize,
    policy: WindowPolicy,
    max_windows: usize,
    windows: Vec<Vec<CycleSnapshot>>,
    cursor: usize,
    rotations: u64,
    recorded: u64,
    running: Running,
}

impl CycleWindows {
    pub fn new(capacity: usize, policy: WindowPolicy, max_windows: usize) -> Self {
        assert!(capacity > 0, "window capacity must be > 0");
        Self {
            capacity,
            policy,
            max_windows: max_windows.max(2),
            windows: (0..2).map(|_| Vec::with_capacity(capacity)).collect(),
            cursor: 0,
            rotations: 0,
            recorded: 0,
            running: Running::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> WindowPolicy {
        self.policy
    }

    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn active(&self) -> &[CycleSnapshot] {
        &self.windows[self.cursor]
    }

    /// Snapshots still held, oldest window first.
    pub fn retained(&self) -> impl Iterator<Item = &CycleSnapshot> + '_ {
        let (head, tail) = match self.policy {
            WindowPolicy::Grow => (&self.windows[..], &self.windows[..0]),
            WindowPolicy::Wrap => {
                let (before, after) = self.windows.split_at(self.cursor + 1);
                (after, before)
            }
        };
        head.iter().chain(tail.iter()).flat_map(|window| window.iter())
    }

    /// Appends a snapshot.  Returns the window that was closed if this call rotated.
    pub fn record(&mut self, snapshot: CycleSnapshot) -> Option<&[CycleSnapshot]> {
        let mut closed = None;
        if self.windows[self.cursor].len() >= self.capacity {
            closed = Some(self.cursor);
            self.update_buffer();
        }
        self.windows[self.cursor].push(snapshot);
        self.recorded += 1;
        self.running.add(&snapshot);
        closed.map(|idx| self.windows[idx].as_slice())
    }

    /// Advances the cursor to the next window, allocating or reusing one per the policy.
    pub fn update_buffer(&mut self) {
        self.rotations += 1;
        let next = self.cursor + 1;
        if next < self.windows.len() {
            self.cursor = next;
        } else if self.policy == WindowPolicy::Grow || self.windows.len() < self.max_windows {
            self.windows.push(Vec::with_capacity(self.capacity));
            self.cursor = next;
        } else {
            self.cursor = 0;
        }
        self.windows[self.cursor].clear();
    }

    pub fn summarize(&self) -> CycleStatsSummary {
        let n = self.recorded;
        let avg = |sum: u64| if n == 0 { 0.0 } else { sum as f64 / n as f64 };
        CycleStatsSummary {
            total_samples: n,
            retained_samples: self.windows.iter().map(|w| w.len() as u64).sum(),
            avg_res_in_flight: avg(self.running.res),
            peak_res_in_flight: self.running.peak_res,
            avg_load_in_flight: avg(self.running.load),
            peak_load_in_flight: self.running.peak_load,
            avg_store_in_flight: avg(self.running.store),
            peak_store_in_flight: self.running.peak_store,
            avg_comp_in_flight: avg(self.running.comp),
            peak_comp_in_flight: self.running.peak_comp,
            total_load_raw_stalls: self.running.load_raw_stalls,
            total_comp_fu_stalls: self.running.comp_fu_stalls,
        }
    }

    /// Empties every window but keeps the allocations.
    pub fn clear(&mut self) {
        for window in &mut self.windows {
            window.clear();
        }
        self.cursor = 0;
        self.rotations = 0;
        self.recorded = 0;
        self.running = Running::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(cycle: u64, load: u32) -> CycleSnapshot {
        CycleSnapshot {
            cycle,
            load_in_flight: load,
            load_raw_stall: cycle % 2 == 0,
            ..CycleSnapshot::default()
        }
    }

    #[test]
    fn rotates_once_past_capacity() {
        let mut windows = CycleWindows::new(4, WindowPolicy::Grow, 2);
        for c in 0..4 {
            assert!(windows.record(snap(c, 1)).is_none());
        }
        assert_eq!(0, windows.rotations());
        let closed = windows.record(snap(4, 1)).map(|w| w.len());
        assert_eq!(Some(4), closed);
        assert_eq!(1, windows.rotations());
        assert_eq!(5, windows.summarize().total_samples);
    }

    #[test]
    fn total_samples_counts_everything() {
        for m in [0u64, 1, 7, 33] {
            let mut windows = CycleWindows::new(3, WindowPolicy::Wrap, 2);
            for c in 0..m {
                windows.record(snap(c, 2));
            }
            let summary = windows.summarize();
            assert_eq!(m, summary.total_samples);
            assert!(summary.retained_samples <= 6);
        }
    }

    #[test]
    fn grow_keeps_full_history() {
        let mut windows = CycleWindows::new(2, WindowPolicy::Grow, 2);
        for c in 0..9 {
            windows.record(snap(c, c as u32));
        }
        assert_eq!(5, windows.window_count());
        let cycles: Vec<u64> = windows.retained().map(|s| s.cycle).collect();
        assert_eq!((0..9).collect::<Vec<_>>(), cycles);
    }

    #[test]
    fn wrap_keeps_most_recent_windows_in_order() {
        let mut windows = CycleWindows::new(2, WindowPolicy::Wrap, 3);
        for c in 0..9 {
            windows.record(snap(c, 0));
        }
        assert_eq!(3, windows.window_count());
        let cycles: Vec<u64> = windows.retained().map(|s| s.cycle).collect();
        assert_eq!(vec![4, 5, 6, 7, 8], cycles);
    }

    #[test]
    fn summary_averages_and_peaks() {
        let mut windows = CycleWindows::new(8, WindowPolicy::Grow, 2);
        windows.record(snap(0, 2));
        windows.record(snap(1, 4));
        let summary = windows.summarize();
        assert_eq!(3.0, summary.avg_load_in_flight);
        assert_eq!(4, summary.peak_load_in_flight);
        assert_eq!(1, summary.total_load_raw_stalls);
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut windows = CycleWindows::new(16, WindowPolicy::Grow, 2);
        for c in 0..40 {
            windows.record(snap(c, 1));
        }
        let count = windows.window_count();
        windows.clear();
        assert_eq!(count, windows.window_count());
        assert!(windows.active().is_empty());
        assert!(windows.windows.iter().all(|w| w.capacity() >= 16));
        assert_eq!(CycleStatsSummary::default(), windows.summarize());
    }
}
