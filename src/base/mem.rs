use anyhow::bail;
use log::debug;
use serde::Serialize;

use crate::base::module::{component, ClockDomain, Component, ComponentBase, ComponentState};
use crate::base::request::{AddrRange, MemoryRequest, RequestId};
use crate::timeq::{Scheduler, ServerConfig, Tick, TimedServer, MAX_TICK};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    QueueFull,
    Busy,
}

/// A refused timing request.  `retry_at == MAX_TICK` means the responder will not free up on
/// its own and the requester must be told to retry explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reject {
    pub retry_at: Tick,
    pub reason: RejectReason,
}

/// Target side of the memory protocol.
pub trait MemoryResponder {
    fn address_range(&self) -> AddrRange;

    /// Performs the access immediately and marks the request completed.  Out-of-range requests
    /// complete with `success = false` and touch nothing.
    fn recv_functional(&mut self, req: &mut MemoryRequest);

    /// Accepts a request for timing processing and returns the tick its response is due, or
    /// refuses it.
    fn recv_timing_request(&mut self, now: Tick, req: &mut MemoryRequest) -> Result<Tick, Reject>;
}

/// Flat byte array addressed by `address - base`.
#[derive(Debug, Clone)]
pub struct SimpleMemory {
    range: AddrRange,
    data: Vec<u8>,
}

impl SimpleMemory {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            range: AddrRange::new(base, size as u64),
            data: vec![0; size],
        }
    }

    fn offset(&self, addr: u64, len: usize) -> Result<usize, anyhow::Error> {
        if !self.range.contains(addr, len as u64) {
            bail!(
                "access of {} bytes @ {:#x} outside [{:#x}, {:#x})",
                len,
                addr,
                self.range.start,
                self.range.end
            );
        }
        Ok((addr - self.range.start) as usize)
    }

    pub fn read(&self, addr: u64, len: usize) -> Result<&[u8], anyhow::Error> {
        let off = self.offset(addr, len)?;
        Ok(&self.data[off..off + len])
    }

    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), anyhow::Error> {
        let off = self.offset(addr, bytes.len())?;
        self.data[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn access(&mut self, req: &mut MemoryRequest) -> Result<(), anyhow::Error> {
        let size = req.size as usize;
        if req.is_read() {
            let bytes = self.read(req.address, size)?.to_vec();
            req.data = bytes;
        } else if req.is_write() {
            if req.data.len() != size {
                bail!("write payload is {} bytes, request size {}", req.data.len(), size);
            }
            self.write(req.address, &req.data)?;
        } else {
            self.offset(req.address, size)?;
        }
        Ok(())
    }
}

impl MemoryResponder for SimpleMemory {
    fn address_range(&self) -> AddrRange {
        self.range
    }

    fn recv_functional(&mut self, req: &mut MemoryRequest) {
        match self.access(req) {
            Ok(()) => req.mark_done(true),
            Err(err) => {
                debug!("request {}: {:#}", req.id, err);
                req.mark_done(false);
            }
        }
    }

    /// Instant timing: the response is due at the submission tick.
    fn recv_timing_request(&mut self, now: Tick, req: &mut MemoryRequest) -> Result<Tick, Reject> {
        self.recv_functional(req);
        Ok(now)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TimedMemoryStats {
    pub accepted: u64,
    pub queue_full_rejects: u64,
    pub busy_rejects: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// `SimpleMemory` behind a latency/bandwidth service law with a bounded request queue.
///
/// The access itself happens at acceptance; the response is due when the ticket is ready.
/// Only accepts work while `Started`.
pub struct TimedMemory {
    base: ComponentBase,
    memory: SimpleMemory,
    clock: ClockDomain,
    server: TimedServer<RequestId>,
    stats: TimedMemoryStats,
}

impl TimedMemory {
    pub fn new(name: &str, memory: SimpleMemory, clock: ClockDomain, config: ServerConfig) -> Self {
        Self {
            base: ComponentBase::new(name),
            memory,
            clock,
            server: TimedServer::new(config),
            stats: TimedMemoryStats::default(),
        }
    }

    pub fn memory(&self) -> &SimpleMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut SimpleMemory {
        &mut self.memory
    }

    pub fn stats(&self) -> &TimedMemoryStats {
        &self.stats
    }

    pub fn inflight(&self) -> usize {
        self.server.inflight()
    }

    fn retire(&mut self, now: Tick) {
        let cycle = self.clock.ticks_to_cycles(now);
        self.server.service_ready(cycle, |_, _| {});
    }

    /// Retires finished requests and completes a pending drain once idle.
    pub fn tick(&mut self, sched: &mut dyn Scheduler) {
        self.retire(sched.current_tick());
        if self.state() == ComponentState::Draining && self.server.is_idle() {
            self.signal_drained(sched);
        }
    }
}

component!(TimedMemory,
    fn drain_impl(&mut self) -> bool {
        self.server.is_idle()
    }

    fn reset_stats(&mut self) {
        self.stats = TimedMemoryStats::default();
    }
);

impl MemoryResponder for TimedMemory {
    fn address_range(&self) -> AddrRange {
        self.memory.address_range()
    }

    fn recv_functional(&mut self, req: &mut MemoryRequest) {
        self.memory.recv_functional(req);
    }

    fn recv_timing_request(&mut self, now: Tick, req: &mut MemoryRequest) -> Result<Tick, Reject> {
        if self.state() != ComponentState::Started {
            self.stats.busy_rejects += 1;
            return Err(Reject {
                retry_at: MAX_TICK,
                reason: RejectReason::Busy,
            });
        }

        self.retire(now);
        let cycle = self.clock.ticks_to_cycles(now);
        match self.server.try_enqueue(cycle, req.id, req.size) {
            Ok(ticket) => {
                self.memory.recv_functional(req);
                self.stats.accepted += 1;
                if req.is_read() {
                    self.stats.bytes_read += req.size as u64;
                } else if req.is_write() {
                    self.stats.bytes_written += req.size as u64;
                }
                Ok(self.clock.cycles_to_ticks(ticket.ready_at()).max(now))
            }
            Err(backpressure) => {
                self.stats.queue_full_rejects += 1;
                Err(Reject {
                    retry_at: self.clock.cycles_to_ticks(backpressure.retry_at).max(now + 1),
                    reason: RejectReason::QueueFull,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::request::RequestKind;
    use crate::timeq::EventQueue;

    #[test]
    fn functional_write_then_read() {
        let mut mem = SimpleMemory::new(0x1000, 256);
        let mut wr = MemoryRequest::write(0x1010, vec![1, 2, 3, 4, 5]);
        mem.recv_functional(&mut wr);
        assert!(wr.completed && wr.success);

        let mut rd = MemoryRequest::read(0x1010, 5);
        mem.recv_functional(&mut rd);
        assert!(rd.success);
        assert_eq!(vec![1, 2, 3, 4, 5], rd.data);
    }

    #[test]
    fn round_trip_across_the_whole_range() {
        let mut mem = SimpleMemory::new(0x8000, 64);
        for (addr, len) in [(0x8000u64, 1usize), (0x8000, 64), (0x803f, 1), (0x8020, 17)] {
            let bytes: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(7) ^ 0x5a).collect();
            let mut wr = MemoryRequest::write(addr, bytes.clone());
            mem.recv_functional(&mut wr);
            let mut rd = MemoryRequest::read(addr, len as u32);
            mem.recv_functional(&mut rd);
            assert!(rd.success, "read {:#x}+{}", addr, len);
            assert_eq!(bytes, rd.data);
        }
    }

    #[test]
    fn out_of_range_leaves_buffer_untouched() {
        let mut mem = SimpleMemory::new(0x1000, 16);
        let mut rd = MemoryRequest::read(0x100c, 8);
        rd.data = vec![0xee; 3];
        mem.recv_functional(&mut rd);
        assert!(rd.completed);
        assert!(!rd.success);
        assert_eq!(vec![0xee; 3], rd.data);

        let mut below = MemoryRequest::read(0xfff, 1);
        mem.recv_functional(&mut below);
        assert!(!below.success);

        let mut wr = MemoryRequest::write(0x100f, vec![9, 9]);
        mem.recv_functional(&mut wr);
        assert!(!wr.success);
        assert_eq!(&[0u8], mem.read(0x100f, 1).expect("in range"));
    }

    #[test]
    fn malformed_write_payload_fails() {
        let mut mem = SimpleMemory::new(0, 16);
        let mut wr = MemoryRequest::new(RequestKind::Write, 0, 4);
        wr.data.truncate(2);
        mem.recv_functional(&mut wr);
        assert!(!wr.success);
    }

    #[test]
    fn timed_memory_refuses_when_full() {
        let q = EventQueue::default();
        let clock = ClockDomain::new(1000);
        let cfg = ServerConfig {
            base_latency: 2,
            bytes_per_cycle: 4,
            queue_capacity: 1,
        };
        let mut mem = TimedMemory::new("spm", SimpleMemory::new(0, 64), clock, cfg);
        mem.init();
        mem.startup();

        let now = q.current_tick();
        let mut a = MemoryRequest::read(0, 4);
        let ready = mem.recv_timing_request(now, &mut a).expect("accepted");
        assert_eq!(3000, ready);
        assert!(a.success);

        let mut b = MemoryRequest::read(4, 4);
        let reject = mem.recv_timing_request(now, &mut b).expect_err("full");
        assert_eq!(RejectReason::QueueFull, reject.reason);
        assert_eq!(3000, reject.retry_at);
        assert!(mem.recv_timing_request(3000, &mut b).is_ok());
        assert_eq!(1, mem.stats().queue_full_rejects);
    }

    #[test]
    fn timed_memory_drains_asynchronously() {
        let mut q = EventQueue::default();
        let clock = ClockDomain::new(1000);
        let mut mem = TimedMemory::new(
            "spm",
            SimpleMemory::new(0, 64),
            clock,
            ServerConfig {
                base_latency: 5,
                bytes_per_cycle: 8,
                queue_capacity: 4,
            },
        );
        mem.init();
        mem.startup();
        let mut req = MemoryRequest::read(0, 8);
        mem.recv_timing_request(0, &mut req).expect("accepted");

        assert!(!mem.drain());
        let mut late = MemoryRequest::read(8, 8);
        let reject = mem.recv_timing_request(0, &mut late).expect_err("draining");
        assert_eq!(RejectReason::Busy, reject.reason);
        assert_eq!(MAX_TICK, reject.retry_at);

        q.run_until(6000);
        mem.tick(&mut q);
        assert_eq!(ComponentState::Drained, mem.state());
        mem.drain_resume();
        assert!(mem.recv_timing_request(6000, &mut late).is_ok());
    }
}
