use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::rc::Rc;

use log::{debug, info, warn};
use smallvec::SmallVec;

use crate::base::mem::{MemoryResponder, SimpleMemory, TimedMemory};
use crate::base::module::{component, ClockDomain, Clocked, Component, ComponentBase};
use crate::base::port::{MemoryPort, TimingPort};
use crate::base::request::MemoryRequest;
use crate::sim::config::{AcceleratorConfig, SalamConfig};
use crate::sim::perf_log::CycleTrace;
use crate::sim::workload::{MemOp, Node, Workload};
use crate::stats::engine::HwStatistics;
use crate::stats::power::REGISTER_WIDTH_BITS;
use crate::stats::stall::QueueKind;
use crate::stats::summary::{MemoryStats, RegisterStats};
use crate::stats::types::{AccessClass, ClassTable, FuTable, FuType, MemAccessType, MemClass, StallCause};
use crate::telemetry::TelemetrySink;
use crate::timeq::{EventId, EventQueue, Scheduler, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Waiting,
    Issued,
    Done,
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    producer: usize,
    hazard: StallCause,
    // consumer reads the producer's value from a register
    data: bool,
}

struct NodeSlot {
    node: Node,
    fu: FuType,
    state: NodeState,
    producers: SmallVec<[Edge; 4]>,
    consumers: Vec<usize>,
    unresolved: usize,
    pending_reads: usize,
}

impl NodeSlot {
    fn produces_value(&self) -> bool {
        !self.node.is_store()
    }
}

#[derive(Debug, Clone, Copy)]
struct Execution {
    idx: usize,
    finish: u64,
    miss_penalty: bool,
}

/// Why the issue stage gave up on a ready node this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Blocker {
    Fu,
    Port,
    Reservation,
}

#[derive(Debug, Default)]
struct InFlight {
    loads: u32,
    stores: u32,
    computes: u32,
    // accepted by the port, response not back yet
    reads: usize,
    writes: usize,
    dma: usize,
    misses: usize,
}

#[derive(Debug, Default)]
struct RegisterUsage {
    live: u64,
    max_live: u64,
    live_sum: u64,
    reads: u64,
    writes: u64,
}

#[derive(Debug, Default)]
struct MemoryCounts {
    reads: u64,
    writes: u64,
    dma_reads: u64,
    dma_writes: u64,
}

/// Executes a dependency graph one clock edge at a time.
///
/// Each cycle retires finished work, issues ready nodes in uid order subject to the
/// reservation limit, FU instances and memory ports, and closes a statistics snapshot with a
/// single stall attribution.  Memory nodes travel through a `TimingPort` into a `TimedMemory`;
/// responses come back through a mailbox filled by the port's completion callback.
pub struct Accelerator {
    base: ComponentBase,
    clock: ClockDomain,
    period_ns: u64,
    timeout_cycles: u64,
    config: AcceleratorConfig,
    stats: HwStatistics,
    trace: Option<CycleTrace>,

    slots: Vec<NodeSlot>,
    ready: BTreeSet<usize>,
    executing: Vec<Execution>,
    fu_free_at: FuTable<Vec<u64>>,
    prev_busy_mask: u32,
    outstanding: usize,
    done: usize,

    port: TimingPort,
    memory: Rc<RefCell<TimedMemory>>,
    mailbox: Rc<RefCell<VecDeque<MemoryRequest>>>,
    touched_lines: HashSet<u64>,

    inflight: InFlight,
    registers: RegisterUsage,
    mem_counts: MemoryCounts,
    stall_cycles: u64,
    stalls_by_class: ClassTable<u64>,
    nodes_by_class: ClassTable<u64>,

    clock_event: Option<EventId>,
    start: Option<(Tick, u64)>,
    total_cycles: u64,
    timed_out: bool,
}

impl Accelerator {
    pub fn new(
        name: &str,
        clock: ClockDomain,
        period_ns: u64,
        timeout_cycles: u64,
        config: AcceleratorConfig,
        workload: Workload,
        memory: Rc<RefCell<TimedMemory>>,
        mut stats: HwStatistics,
        trace: Option<CycleTrace>,
    ) -> Self {
        let responder: Rc<RefCell<dyn MemoryResponder>> = memory.clone();
        let mut port = TimingPort::new(&format!("{}.port", name), responder);
        let mailbox: Rc<RefCell<VecDeque<MemoryRequest>>> = Rc::new(RefCell::new(VecDeque::new()));
        let inbox = Rc::clone(&mailbox);
        port.set_completion_callback(Box::new(move |_: &mut dyn Scheduler, req: MemoryRequest| {
            inbox.borrow_mut().push_back(req);
        }));

        let fu_free_at = FuTable::from_fn(|fu| vec![0; config.fu_instances[fu] as usize]);
        for (fu, &count) in config.fu_instances.iter() {
            if count > 0 {
                stats.set_fu_instances(fu, count);
            }
        }

        let mut accel = Self {
            base: ComponentBase::new(name),
            clock,
            period_ns,
            timeout_cycles,
            config,
            stats,
            trace,
            slots: Vec::new(),
            ready: BTreeSet::new(),
            executing: Vec::new(),
            fu_free_at,
            prev_busy_mask: 0,
            outstanding: 0,
            done: 0,
            port,
            memory,
            mailbox,
            touched_lines: HashSet::new(),
            inflight: InFlight::default(),
            registers: RegisterUsage::default(),
            mem_counts: MemoryCounts::default(),
            stall_cycles: 0,
            stalls_by_class: ClassTable::default(),
            nodes_by_class: ClassTable::default(),
            clock_event: None,
            start: None,
            total_cycles: 0,
            timed_out: false,
        };
        accel.build_graph(workload);
        accel
    }

    pub fn stats(&self) -> &HwStatistics {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut HwStatistics {
        &mut self.stats
    }

    pub fn port(&self) -> &TimingPort {
        &self.port
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn is_finished(&self) -> bool {
        self.done == self.slots.len()
    }

    pub fn set_clock_event(&mut self, event: EventId) {
        self.clock_event = Some(event);
    }

    fn build_graph(&mut self, workload: Workload) {
        let index: HashMap<u32, usize> = workload
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.uid, i))
            .collect();

        for node in workload.nodes {
            self.stats
                .record_instruction(node.uid, node.opcode_id(), node.is_load(), node.is_store());
            self.slots.push(NodeSlot {
                fu: node.fu_type(),
                node,
                state: NodeState::Waiting,
                producers: SmallVec::new(),
                consumers: Vec::new(),
                unresolved: 0,
                pending_reads: 0,
            });
        }

        let mut seen: HashSet<(usize, usize)> = HashSet::new();
        for consumer in 0..self.slots.len() {
            let deps = self.slots[consumer].node.deps.clone();
            for dep in deps {
                let producer = index[&dep];
                if !seen.insert((producer, consumer)) {
                    continue;
                }
                let (p_uid, c_uid) = (self.slots[producer].node.uid, self.slots[consumer].node.uid);
                if is_control(&self.slots[producer].node) {
                    self.stats.record_control_dependency(p_uid, c_uid);
                    self.add_edge(producer, consumer, StallCause::ControlFlow, false);
                } else {
                    self.stats.record_dependency(p_uid, c_uid, true, false, false);
                    let data = self.slots[producer].produces_value();
                    self.add_edge(producer, consumer, StallCause::RawHazard, data);
                }
            }
        }

        // ordering between overlapping memory operations, in program (uid) order
        let mem_nodes: Vec<(usize, MemOp)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.node.mem.map(|m| (i, m)))
            .collect();
        for (later_pos, &(consumer, later)) in mem_nodes.iter().enumerate() {
            for &(producer, earlier) in mem_nodes[..later_pos].iter().rev() {
                if !overlaps(&earlier, &later) {
                    continue;
                }
                if !(earlier.is_write || later.is_write) {
                    continue;
                }
                if seen.insert((producer, consumer)) {
                    let (p_uid, c_uid) =
                        (self.slots[producer].node.uid, self.slots[consumer].node.uid);
                    let hazard = match (earlier.is_write, later.is_write) {
                        (true, false) => {
                            self.stats.record_memory_dependency(p_uid, c_uid);
                            StallCause::RawHazard
                        }
                        (false, true) => {
                            self.stats.record_dependency(p_uid, c_uid, false, true, false);
                            StallCause::WarHazard
                        }
                        _ => {
                            self.stats.record_dependency(p_uid, c_uid, false, false, true);
                            StallCause::WawHazard
                        }
                    };
                    self.add_edge(producer, consumer, hazard, false);
                }
                // the nearest earlier write orders everything before it
                if earlier.is_write {
                    break;
                }
            }
        }

        for (i, slot) in self.slots.iter().enumerate() {
            if slot.unresolved == 0 {
                self.ready.insert(i);
            }
        }
        debug!(
            "{}: {} nodes, {} initially ready",
            self.base.name,
            self.slots.len(),
            self.ready.len()
        );
    }

    fn add_edge(&mut self, producer: usize, consumer: usize, hazard: StallCause, data: bool) {
        self.slots[consumer].producers.push(Edge {
            producer,
            hazard,
            data,
        });
        self.slots[consumer].unresolved += 1;
        self.slots[producer].consumers.push(consumer);
        if data {
            self.slots[producer].pending_reads += 1;
        }
    }

    /// One clock edge.
    pub fn tick(&mut self, sched: &mut dyn Scheduler) {
        let cycle = self.current_cycle(sched);
        if self.start.is_none() {
            self.start = Some((sched.current_tick(), cycle));
            self.announce();
        }
        self.stats.cycle_start(cycle);

        self.collect_responses(cycle);
        self.retire(cycle);
        let ready = self.ready.len() as u64;
        let (issued, blocker) = self.issue(sched, cycle);
        self.stats.record_parallelism(ready, issued);
        self.account_cycle(cycle, issued, blocker);

        if let Some(window) = self.stats.cycle_end() {
            if let Some(trace) = self.trace.as_mut() {
                trace.write_window(window);
            }
        }
        self.stats.publish_cycle_update(cycle);
        self.stats.publish_queue_state(
            cycle,
            self.inflight.reads,
            self.inflight.writes,
            self.inflight.computes as usize,
        );
        self.memory.borrow_mut().tick(sched);

        let elapsed = cycle - self.start.map_or(cycle, |(_, c)| c) + 1;
        if self.is_finished() {
            self.finalize(sched, elapsed);
        } else if elapsed >= self.timeout_cycles {
            warn!(
                "{}: timed out after {} cycles with {} of {} nodes done",
                self.base.name,
                elapsed,
                self.done,
                self.slots.len()
            );
            self.timed_out = true;
            self.finalize(sched, elapsed);
        } else if let Some(event) = self.clock_event {
            let next = self.next_cycle_tick(sched);
            sched.schedule(event, next);
        }
    }

    fn announce(&mut self) {
        let name = self.base.name.clone();
        self.stats.publish_sim_start(&name);
        if !self.stats.telemetry_enabled() {
            return;
        }
        for slot in &self.slots {
            let queue = match slot.node.mem {
                Some(mem) if mem.is_write => 2,
                Some(_) => 1,
                None => 0,
            };
            self.stats
                .publish_dataflow_node(0, slot.node.uid, &slot.node.opcode, queue, &slot.node.deps);
        }
    }

    fn collect_responses(&mut self, cycle: u64) {
        let responses: Vec<MemoryRequest> = self.mailbox.borrow_mut().drain(..).collect();
        for req in responses {
            let Some(&idx) = req.context_ref::<usize>() else {
                warn!("{}: response without a node context", self.base.name);
                continue;
            };
            let Some(mem) = self.slots[idx].node.mem else {
                continue;
            };
            if !req.success {
                warn!(
                    "{}: node {} access @ {:#x} failed",
                    self.base.name, self.slots[idx].node.uid, mem.address
                );
            }

            if mem.is_write {
                self.inflight.writes -= 1;
            } else {
                self.inflight.reads -= 1;
            }
            if mem.class == MemClass::Dma {
                self.inflight.dma -= 1;
            }

            let mut latency = req.latency().map_or(0, |t| self.clock.ticks_to_cycles(t));
            let mut hit = false;
            if mem.class == MemClass::Cache {
                let line = mem.address / self.config.cache_line_bytes.max(1);
                hit = !self.touched_lines.insert(line);
                if !hit {
                    latency += self.config.cache_miss_cycles;
                }
            }
            self.record_access(cycle, mem, latency, hit);

            if mem.class == MemClass::Cache && !hit && self.config.cache_miss_cycles > 0 {
                self.inflight.misses += 1;
                self.executing.push(Execution {
                    idx,
                    finish: cycle + self.config.cache_miss_cycles,
                    miss_penalty: true,
                });
            } else {
                self.complete(cycle, idx);
            }
        }
    }

    fn record_access(&mut self, cycle: u64, mem: MemOp, latency: u64, hit: bool) {
        let kind = MemAccessType::new(mem.class, mem.is_write);
        let bytes = mem.size as u64;
        if mem.is_write {
            self.stats
                .record_memory_write(mem.address, bytes, latency, hit, kind);
        } else {
            self.stats
                .record_memory_read(mem.address, bytes, latency, hit, kind);
        }
        match (mem.class, mem.is_write) {
            (MemClass::Dma, false) => self.mem_counts.dma_reads += 1,
            (MemClass::Dma, true) => self.mem_counts.dma_writes += 1,
            (_, false) => self.mem_counts.reads += 1,
            (_, true) => self.mem_counts.writes += 1,
        }
        self.stats.publish_memory_access(cycle, mem.address, bytes, kind);
    }

    fn retire(&mut self, cycle: u64) {
        let (finished, pending): (Vec<Execution>, Vec<Execution>) =
            std::mem::take(&mut self.executing)
                .into_iter()
                .partition(|e| e.finish <= cycle);
        self.executing = pending;
        for exec in finished {
            if exec.miss_penalty {
                self.inflight.misses -= 1;
            }
            self.complete(cycle, exec.idx);
        }
    }

    fn complete(&mut self, cycle: u64, idx: usize) {
        let slot = &mut self.slots[idx];
        slot.state = NodeState::Done;
        match slot.node.mem {
            Some(mem) if mem.is_write => self.inflight.stores -= 1,
            Some(_) => self.inflight.loads -= 1,
            None => self.inflight.computes -= 1,
        }
        if slot.produces_value() {
            self.registers.writes += 1;
            if slot.pending_reads > 0 {
                self.registers.live += 1;
            }
        }
        let uid = slot.node.uid;
        self.done += 1;
        self.outstanding -= 1;
        self.stats.publish_instruction_complete(cycle, uid);

        for k in 0..self.slots[idx].consumers.len() {
            let consumer = self.slots[idx].consumers[k];
            let c = &mut self.slots[consumer];
            c.unresolved -= 1;
            if c.unresolved == 0 && c.state == NodeState::Waiting {
                self.ready.insert(consumer);
            }
        }
    }

    fn issue(&mut self, sched: &mut dyn Scheduler, cycle: u64) -> (u64, Option<Blocker>) {
        let candidates: Vec<usize> = self.ready.iter().copied().collect();
        let mut reads_left = self.config.read_ports;
        let mut writes_left = self.config.write_ports;
        let mut issued = 0;
        let mut blocker = None;

        for idx in candidates {
            if self.outstanding >= self.config.reservation_size.max(1) {
                blocker.get_or_insert(Blocker::Reservation);
                break;
            }
            let launched = match self.slots[idx].node.mem {
                Some(mem) => {
                    let left = if mem.is_write {
                        &mut writes_left
                    } else {
                        &mut reads_left
                    };
                    self.issue_memory(sched, cycle, idx, mem, left)
                }
                None => self.issue_compute(cycle, idx),
            };
            match launched {
                Ok(()) => {
                    self.ready.remove(&idx);
                    self.on_issue(cycle, idx);
                    issued += 1;
                }
                Err(b) => {
                    blocker.get_or_insert(b);
                }
            }
        }
        (issued, blocker)
    }

    fn issue_memory(
        &mut self,
        sched: &mut dyn Scheduler,
        cycle: u64,
        idx: usize,
        mem: MemOp,
        ports_left: &mut u32,
    ) -> Result<(), Blocker> {
        if mem.class == MemClass::Local {
            self.record_access(cycle, mem, 1, false);
            self.executing.push(Execution {
                idx,
                finish: cycle + 1,
                miss_penalty: false,
            });
            return Ok(());
        }

        if *ports_left == 0 || self.port.is_stalled() {
            self.stats.record_port_contention(!mem.is_write);
            return Err(Blocker::Port);
        }
        *ports_left -= 1;

        let uid = self.slots[idx].node.uid;
        let req = if mem.is_write {
            MemoryRequest::write(mem.address, vec![uid as u8; mem.size as usize])
        } else {
            MemoryRequest::read(mem.address, mem.size)
        }
        .with_context(idx);
        if !self.port.send_timing_request(sched, req) {
            debug!("{}: node {} queued behind a refused request", self.base.name, uid);
        }

        if mem.is_write {
            self.inflight.writes += 1;
        } else {
            self.inflight.reads += 1;
        }
        if mem.class == MemClass::Dma {
            self.inflight.dma += 1;
        }
        Ok(())
    }

    fn issue_compute(&mut self, cycle: u64, idx: usize) -> Result<(), Blocker> {
        let fu = self.slots[idx].fu;
        let latency = self.slots[idx].node.latency().max(1) as u64;
        let limit = self.config.fu_instances[fu];

        let free = self.fu_free_at[fu].iter().position(|&t| t <= cycle);
        let instance = match free {
            Some(i) => i,
            None if limit == 0 => {
                self.fu_free_at[fu].push(0);
                self.fu_free_at[fu].len() - 1
            }
            None => {
                self.stats.record_fu_contention(fu);
                return Err(Blocker::Fu);
            }
        };

        let end = cycle + latency;
        self.fu_free_at[fu][instance] = end;
        let uid = self.slots[idx].node.uid;
        self.stats.record_fu_busy(fu, instance as u32, cycle, end);
        self.stats.publish_fu_activity(fu, instance as u32, uid, cycle, end);
        self.executing.push(Execution {
            idx,
            finish: end,
            miss_penalty: false,
        });
        Ok(())
    }

    fn on_issue(&mut self, cycle: u64, idx: usize) {
        self.outstanding += 1;
        self.slots[idx].state = NodeState::Issued;
        match self.slots[idx].node.mem {
            Some(mem) if mem.is_write => self.inflight.stores += 1,
            Some(_) => self.inflight.loads += 1,
            None => self.inflight.computes += 1,
        }

        let edges = self.slots[idx].producers.clone();
        for edge in edges.iter().filter(|e| e.data) {
            self.registers.reads += 1;
            let producer = &mut self.slots[edge.producer];
            producer.pending_reads -= 1;
            if producer.pending_reads == 0 {
                self.registers.live -= 1;
            }
        }

        let slot = &self.slots[idx];
        self.stats
            .publish_instruction_issue(cycle, slot.node.uid, &slot.node.opcode, slot.fu);
    }

    fn account_cycle(&mut self, cycle: u64, issued: u64, blocker: Option<Blocker>) {
        let waiting = self.slots.len() - self.done - self.outstanding;
        let busy_mask = self
            .fu_free_at
            .iter()
            .filter(|(_, free_at)| free_at.iter().any(|&t| t > cycle))
            .fold(0, |mask, (fu, _)| mask | fu.mask_bit());

        let snapshot = self.stats.current_cycle_mut();
        snapshot.res_in_flight = self.outstanding as u32;
        snapshot.load_in_flight = self.inflight.loads;
        snapshot.store_in_flight = self.inflight.stores;
        snapshot.comp_in_flight = self.inflight.computes;
        snapshot.load_raw_stall = issued == 0 && waiting > 0 && self.inflight.loads > 0;
        snapshot.fu_busy_mask |= busy_mask;

        let class = AccessClass::from_activity(
            self.inflight.loads > 0,
            self.inflight.stores > 0,
            self.inflight.computes > 0,
        );
        if issued == 0 && waiting > 0 {
            match blocker {
                // contention was already counted when the issue attempt failed
                Some(Blocker::Fu) => {
                    self.stats.record_stall_cause(StallCause::FuContention);
                    self.stats.current_cycle_mut().comp_fu_stall = true;
                }
                Some(Blocker::Port) => self.stats.record_stall_cause(StallCause::PortContention),
                Some(Blocker::Reservation) => {
                    self.stats.record_queue_full_stall(QueueKind::Reservation)
                }
                None if self.inflight.dma > 0 => {
                    self.stats.record_stall_cause(StallCause::DmaPending)
                }
                None if self.inflight.reads + self.inflight.writes + self.inflight.misses > 0 => {
                    let is_write = self.inflight.writes > 0 && self.inflight.reads == 0;
                    self.stats
                        .record_memory_stall(is_write, self.inflight.misses > 0);
                }
                None => {
                    let hazard = self.waiting_hazard();
                    self.stats.record_stall_cause(hazard);
                }
            }
            self.stall_cycles += 1;
            if let Some(class) = class {
                self.stalls_by_class[class] += 1;
            }
            let (uid, cause) = (
                self.oldest_waiting_uid(),
                self.stats.current_cycle_mut().stall_cause,
            );
            self.stats.publish_stall(cycle, uid, cause);
        } else {
            self.stats.record_no_stall();
            if let Some(class) = class {
                self.nodes_by_class[class] += 1;
            }
        }

        self.registers.live_sum += self.registers.live;
        self.registers.max_live = self.registers.max_live.max(self.registers.live);

        let changed = busy_mask ^ self.prev_busy_mask;
        for fu in FuType::from_mask(changed) {
            self.stats
                .publish_fu_state(cycle, fu, busy_mask & fu.mask_bit() != 0);
        }
        self.prev_busy_mask = busy_mask;
    }

    fn oldest_waiting(&self) -> Option<&NodeSlot> {
        self.slots.iter().find(|s| s.state == NodeState::Waiting)
    }

    fn oldest_waiting_uid(&self) -> u32 {
        self.oldest_waiting().map_or(0, |s| s.node.uid)
    }

    /// Hazard of the first unfinished producer the oldest waiting node depends on.
    fn waiting_hazard(&self) -> StallCause {
        self.oldest_waiting()
            .and_then(|slot| {
                slot.producers
                    .iter()
                    .find(|e| self.slots[e.producer].state != NodeState::Done)
            })
            .map_or(StallCause::RawHazard, |e| e.hazard)
    }

    fn finalize(&mut self, sched: &mut dyn Scheduler, total_cycles: u64) {
        self.total_cycles = total_cycles;
        let (start_tick, _) = self.start.unwrap_or((sched.current_tick(), 0));
        let setup_ns = sched.ticks_to_ns(start_tick);
        let sim_ns = total_cycles * self.period_ns;

        self.stats.collect_performance_stats(
            setup_ns,
            sim_ns,
            self.period_ns,
            total_cycles,
            self.stall_cycles,
        );
        self.stats.collect_stall_breakdown(
            std::mem::take(&mut self.stalls_by_class),
            std::mem::take(&mut self.nodes_by_class),
        );

        let limits = &self.config.fu_instances;
        let allocated = &self.fu_free_at;
        let static_count = FuTable::from_fn(|fu| match limits[fu] {
            0 => allocated[fu].len() as u32,
            n => n,
        });
        self.stats.collect_fu_static_counts(static_count);

        let cache_ports = if self.config.cache_size_kb > 0.0 {
            self.config.read_ports + self.config.write_ports
        } else {
            0
        };
        self.stats.collect_memory_stats(MemoryStats {
            cache_size_kb: self.config.cache_size_kb,
            cache_ports,
            spm_size_kb: self.config.spm_size_kb,
            spm_read_ports: self.config.read_ports,
            spm_write_ports: self.config.write_ports,
            mem_reads: self.mem_counts.reads,
            mem_writes: self.mem_counts.writes,
            dma_reads: self.mem_counts.dma_reads,
            dma_writes: self.mem_counts.dma_writes,
        });

        let regs = &self.registers;
        self.stats.collect_register_stats(RegisterStats {
            total: if self.config.registers > 0 {
                self.config.registers
            } else {
                regs.max_live
            },
            max_usage: regs.max_live,
            avg_usage: regs.live_sum as f64 / total_cycles.max(1) as f64,
            avg_size_bytes: REGISTER_WIDTH_BITS / 8.0,
            reads: regs.reads,
            writes: regs.writes,
        });

        let path = self.stats.compute_critical_path();
        if self.stats.telemetry_enabled() {
            let critical: HashSet<(u32, u32)> = path.windows(2).map(|w| (w[0], w[1])).collect();
            let slots = &self.slots;
            let edges: Vec<(u32, u32)> = slots
                .iter()
                .flat_map(|s| {
                    s.producers
                        .iter()
                        .map(move |e| (slots[e.producer].node.uid, s.node.uid))
                })
                .collect();
            for (p, c) in edges {
                let on_path = critical.contains(&(p, c));
                self.stats.publish_dataflow_edge(total_cycles, p, c, on_path);
            }
        }

        self.stats.calculate_power_with_activity();
        self.stats.calculate_area_from_config();
        self.stats.publish_sim_end();

        if let Some(trace) = self.trace.as_mut() {
            trace.write_window(self.stats.windows().active());
            trace.flush();
        }

        let mut memory = self.memory.borrow_mut();
        memory.tick(sched);
        if !memory.drain() {
            debug!("{}: memory still busy at end of run", memory.name());
        }
        memory.stop();
        drop(memory);
        self.stop();

        info!(
            "{}: {} nodes in {} cycles ({} stalled), bottleneck {}",
            self.base.name,
            self.done,
            total_cycles,
            self.stall_cycles,
            self.stats.dominant_bottleneck()
        );
    }
}

fn is_control(node: &Node) -> bool {
    matches!(node.opcode.as_str(), "br" | "ret" | "switch")
}

fn overlaps(a: &MemOp, b: &MemOp) -> bool {
    a.address < b.address + b.size as u64 && b.address < a.address + a.size as u64
}

component!(Accelerator,
    fn drain_impl(&mut self) -> bool {
        self.outstanding == 0
    }

    fn reset_stats(&mut self) {
        self.stats.clear_stats();
    }
);

impl Clocked for Accelerator {
    fn clock(&self) -> &ClockDomain {
        &self.clock
    }
}

/// Event queue plus the accelerator it drives.
pub struct Sim {
    queue: EventQueue,
    accelerator: Rc<RefCell<Accelerator>>,
    memory: Rc<RefCell<TimedMemory>>,
}

impl Sim {
    pub fn new(
        config: SalamConfig,
        workload: Workload,
        sink: Box<dyn TelemetrySink>,
    ) -> Result<Self, anyhow::Error> {
        let SalamConfig {
            sim,
            stats,
            telemetry,
            accelerator,
        } = config;

        let mut queue = EventQueue::new(sim.tick_frequency);
        let clock = ClockDomain::from_ns(sim.clock_period_ns.max(1), &queue);
        let memory = Rc::new(RefCell::new(TimedMemory::new(
            &format!("{}.mem", sim.accelerator_name),
            SimpleMemory::new(accelerator.memory_base, accelerator.memory_size),
            clock,
            accelerator.memory,
        )));

        let trace = match &stats.cycle_trace_file {
            Some(path) => Some(CycleTrace::create(path)?),
            None => None,
        };
        let engine = HwStatistics::new(stats, &sim.accelerator_name, sink)
            .with_publish_interval(telemetry.publish_interval);

        let accel = Rc::new(RefCell::new(Accelerator::new(
            &sim.accelerator_name,
            clock,
            sim.clock_period_ns.max(1),
            sim.timeout_cycles.max(1),
            accelerator,
            workload,
            Rc::clone(&memory),
            engine,
            trace,
        )));

        {
            let mut mem = memory.borrow_mut();
            mem.init();
            mem.startup();
        }
        {
            let mut a = accel.borrow_mut();
            a.init();
            a.startup();
        }

        let driver = Rc::clone(&accel);
        let event = queue.create_event(
            Box::new(move |s: &mut dyn Scheduler| driver.borrow_mut().tick(s)),
            &format!("{}.clock", sim.accelerator_name),
        );
        accel.borrow_mut().set_clock_event(event);
        queue.schedule(event, 0);

        Ok(Self {
            queue,
            accelerator: accel,
            memory,
        })
    }

    /// Runs to completion or timeout.  Returns the number of cycles simulated.
    pub fn simulate(&mut self) -> u64 {
        let fired = self.queue.run();
        let accel = self.accelerator.borrow();
        debug!(
            "{} events fired, memory {:?}",
            fired,
            self.memory.borrow().stats()
        );
        accel.total_cycles()
    }

    pub fn accelerator(&self) -> Ref<'_, Accelerator> {
        self.accelerator.borrow()
    }

    pub fn accelerator_mut(&self) -> RefMut<'_, Accelerator> {
        self.accelerator.borrow_mut()
    }

    pub fn memory(&self) -> Ref<'_, TimedMemory> {
        self.memory.borrow()
    }
}
