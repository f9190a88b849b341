use std::collections::BTreeMap;

use serde::Serialize;

use crate::stats::types::MemAccessType;

pub const DEFAULT_ADDRESS_GRANULARITY: u64 = 64;

/// Running latency aggregate.  `min` stays at `u64::MAX` until the first sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatencyStats {
    pub total: u64,
    pub count: u64,
    pub min: u64,
    pub max: u64,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self {
            total: 0,
            count: 0,
            min: u64::MAX,
            max: 0,
        }
    }
}

impl LatencyStats {
    pub fn record(&mut self, latency: u64) {
        self.total = self.total.saturating_add(latency);
        self.count += 1;
        self.min = self.min.min(latency);
        self.max = self.max.max(latency);
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total as f64 / self.count as f64
    }

    /// Minimum, reported as 0 before any sample.
    pub fn min_or_zero(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.min
        }
    }
}

/// Access counts bucketed by address, aligned down to `granularity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressHeatmap {
    pub granularity: u64,
    pub reads: BTreeMap<u64, u64>,
    pub writes: BTreeMap<u64, u64>,
}

impl Default for AddressHeatmap {
    fn default() -> Self {
        Self::new(DEFAULT_ADDRESS_GRANULARITY)
    }
}

impl AddressHeatmap {
    pub fn new(granularity: u64) -> Self {
        Self {
            granularity: granularity.max(1),
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
        }
    }

    pub fn bucket(&self, addr: u64) -> u64 {
        addr / self.granularity * self.granularity
    }

    pub fn record(&mut self, addr: u64, is_write: bool) {
        let bucket = self.bucket(addr);
        let table = if is_write {
            &mut self.writes
        } else {
            &mut self.reads
        };
        *table.entry(bucket).or_default() += 1;
    }

    pub fn clear(&mut self) {
        self.reads.clear();
        self.writes.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryAccessStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_read_hits: u64,
    pub cache_read_misses: u64,
    pub cache_write_hits: u64,
    pub cache_write_misses: u64,

    pub spm_reads: u64,
    pub spm_writes: u64,
    pub spm_read_bytes: u64,
    pub spm_write_bytes: u64,

    pub dma_read_requests: u64,
    pub dma_write_requests: u64,
    pub dma_read_bytes: u64,
    pub dma_write_bytes: u64,
    pub dma_read_latency_total: u64,
    pub dma_write_latency_total: u64,

    pub local_reads: u64,
    pub local_writes: u64,

    pub read_latency: LatencyStats,
    pub write_latency: LatencyStats,

    pub total_bytes_read: u64,
    pub total_bytes_written: u64,
    pub peak_read_bytes_per_cycle: u64,
    pub peak_write_bytes_per_cycle: u64,

    pub read_port_stalls: u64,
    pub write_port_stalls: u64,
    pub queue_full_stalls: u64,

    pub heatmap: AddressHeatmap,
}

impl MemoryAccessStats {
    pub fn with_granularity(granularity: u64) -> Self {
        Self {
            heatmap: AddressHeatmap::new(granularity),
            ..Self::default()
        }
    }

    pub fn record_read(&mut self, addr: u64, bytes: u64, latency: u64, cache_hit: bool, kind: MemAccessType) {
        self.total_bytes_read += bytes;
        self.read_latency.record(latency);
        self.heatmap.record(addr, false);

        match kind {
            MemAccessType::CacheRead => {
                if cache_hit {
                    self.cache_hits += 1;
                    self.cache_read_hits += 1;
                } else {
                    self.cache_misses += 1;
                    self.cache_read_misses += 1;
                }
            }
            MemAccessType::SpmRead => {
                self.spm_reads += 1;
                self.spm_read_bytes += bytes;
            }
            MemAccessType::DmaRead => {
                self.dma_read_requests += 1;
                self.dma_read_bytes += bytes;
                self.dma_read_latency_total += latency;
            }
            MemAccessType::LocalRead => self.local_reads += 1,
            _ => {}
        }
    }

    pub fn record_write(&mut self, addr: u64, bytes: u64, latency: u64, cache_hit: bool, kind: MemAccessType) {
        self.total_bytes_written += bytes;
        self.write_latency.record(latency);
        self.heatmap.record(addr, true);

        match kind {
            MemAccessType::CacheWrite => {
                if cache_hit {
                    self.cache_hits += 1;
                    self.cache_write_hits += 1;
                } else {
                    self.cache_misses += 1;
                    self.cache_write_misses += 1;
                }
            }
            MemAccessType::SpmWrite => {
                self.spm_writes += 1;
                self.spm_write_bytes += bytes;
            }
            MemAccessType::DmaWrite => {
                self.dma_write_requests += 1;
                self.dma_write_bytes += bytes;
                self.dma_write_latency_total += latency;
            }
            MemAccessType::LocalWrite => self.local_writes += 1,
            _ => {}
        }
    }

    /// Bulk DMA transfer outside the per-access path.
    pub fn record_dma_transfer(&mut self, is_read: bool, bytes: u64, latency: u64) {
        if is_read {
            self.dma_read_requests += 1;
            self.dma_read_bytes += bytes;
            self.dma_read_latency_total += latency;
        } else {
            self.dma_write_requests += 1;
            self.dma_write_bytes += bytes;
            self.dma_write_latency_total += latency;
        }
    }

    pub fn record_port_stall(&mut self, is_read: bool) {
        if is_read {
            self.read_port_stalls += 1;
        } else {
            self.write_port_stalls += 1;
        }
    }

    pub fn record_cycle_bandwidth(&mut self, bytes_read: u64, bytes_written: u64) {
        self.peak_read_bytes_per_cycle = self.peak_read_bytes_per_cycle.max(bytes_read);
        self.peak_write_bytes_per_cycle = self.peak_write_bytes_per_cycle.max(bytes_written);
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / total as f64
    }

    pub fn cache_reads(&self) -> u64 {
        self.cache_read_hits + self.cache_read_misses
    }

    pub fn cache_writes(&self) -> u64 {
        self.cache_write_hits + self.cache_write_misses
    }

    /// Resets every counter, keeping the heatmap granularity.
    pub fn clear(&mut self) {
        *self = Self::with_granularity(self.heatmap.granularity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_route_by_access_type() {
        let mut mem = MemoryAccessStats::default();
        mem.record_read(0x100, 8, 4, true, MemAccessType::CacheRead);
        mem.record_read(0x108, 8, 20, false, MemAccessType::CacheRead);
        mem.record_read(0x2000, 64, 2, false, MemAccessType::SpmRead);
        mem.record_read(0x4000, 256, 100, false, MemAccessType::DmaRead);

        assert_eq!(1, mem.cache_read_hits);
        assert_eq!(1, mem.cache_read_misses);
        assert_eq!(0.5, mem.cache_hit_rate());
        assert_eq!(64, mem.spm_read_bytes);
        assert_eq!(100, mem.dma_read_latency_total);
        assert_eq!(336, mem.total_bytes_read);
        assert_eq!(2, mem.read_latency.min);
        assert_eq!(100, mem.read_latency.max);
        assert_eq!(31.5, mem.read_latency.avg());
    }

    #[test]
    fn heatmap_buckets_by_granularity() {
        let mut mem = MemoryAccessStats::default();
        mem.record_read(0x100, 4, 1, false, MemAccessType::SpmRead);
        mem.record_read(0x13f, 4, 1, false, MemAccessType::SpmRead);
        mem.record_write(0x140, 4, 1, false, MemAccessType::SpmWrite);
        assert_eq!(Some(&2), mem.heatmap.reads.get(&0x100));
        assert_eq!(Some(&1), mem.heatmap.writes.get(&0x140));

        let mut coarse = MemoryAccessStats::with_granularity(4096);
        coarse.record_write(0x1fff, 4, 1, false, MemAccessType::SpmWrite);
        assert_eq!(Some(&1), coarse.heatmap.writes.get(&0x1000));
    }

    #[test]
    fn empty_latency_reports_zero_min() {
        let mem = MemoryAccessStats::default();
        assert_eq!(0, mem.write_latency.min_or_zero());
        assert_eq!(0.0, mem.write_latency.avg());
    }

    #[test]
    fn clear_keeps_granularity() {
        let mut mem = MemoryAccessStats::with_granularity(128);
        mem.record_write(0x80, 4, 1, true, MemAccessType::CacheWrite);
        mem.clear();
        assert_eq!(MemoryAccessStats::with_granularity(128), mem);
    }
}
