/*
Time-queue for the timing model.

Simulated time is counted in ticks.  Everything that happens in the model happens because an
event fired at some tick; nothing here reads the host clock to make a timing decision.

Components talk to time through the `Scheduler` trait so the same timing logic can be driven by
the standalone `EventQueue` below or embedded in a host simulator that owns global time.  Events
are created once, owned by the scheduler, and referred to by `EventId` afterwards.

Shared resources with a latency/bandwidth budget are wrapped by a `TimedServer`, which enforces
a service law:
    - A base latency plus a throughput component expressed in bytes-per-cycle
    - A bounded number of requests in flight

When the server cannot accept more work it returns a `Backpressure` carrying the cycle at which a
slot frees up, so the requester can schedule its own retry.
*/

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use log::trace;
use serde::Deserialize;

pub type Tick = u64;
pub type Cycle = u64;

/// Reserved tick meaning "never" / "not scheduled".
pub const MAX_TICK: Tick = u64::MAX;

/// One tick per picosecond.
pub const DEFAULT_TICK_FREQUENCY: u64 = 1_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId {
    index: u32,
    generation: u32,
}

pub type EventCallback = Box<dyn FnMut(&mut dyn Scheduler)>;

/// Event scheduling capability.  Implemented once per backend.
pub trait Scheduler {
    fn current_tick(&self) -> Tick;

    /// Ticks per simulated second.
    fn tick_frequency(&self) -> u64;

    /// Registers a callback and returns a handle to it.  An empty name gets a generated one.
    fn create_event(&mut self, callback: EventCallback, name: &str) -> EventId;

    /// Schedules an unscheduled event at an absolute tick.  Scheduling an event that is already
    /// pending is a contract violation; use `reschedule` instead.
    fn schedule(&mut self, event: EventId, when: Tick);

    /// No-op if the event is not pending.
    fn deschedule(&mut self, event: EventId);

    /// Moves a pending event, or schedules it if it was not pending.
    fn reschedule(&mut self, event: EventId, when: Tick);

    /// Tick the event is pending at, `MAX_TICK` when unscheduled.
    fn scheduled_tick(&self, event: EventId) -> Tick;

    /// Creates an event that fires once at `when` and is released afterwards.
    fn schedule_callback(&mut self, when: Tick, callback: EventCallback, name: &str) -> EventId;

    fn is_scheduled(&self, event: EventId) -> bool {
        self.scheduled_tick(event) != MAX_TICK
    }

    fn schedule_after(&mut self, event: EventId, delay: Tick) {
        let when = self.current_tick().saturating_add(delay);
        self.schedule(event, when);
    }

    fn ns_to_ticks(&self, ns: u64) -> Tick {
        (ns as u128 * self.tick_frequency() as u128 / 1_000_000_000) as Tick
    }

    fn ticks_to_ns(&self, ticks: Tick) -> u64 {
        (ticks as u128 * 1_000_000_000 / self.tick_frequency() as u128) as u64
    }
}

struct EventSlot {
    name: String,
    generation: u32,
    callback: Option<EventCallback>,
    when: Tick,
    seq: u64,
    one_shot: bool,
    live: bool,
}

/// Standalone scheduler backend.
///
/// Pending events live in a min-heap keyed by (tick, submission sequence), so events due at the
/// same tick fire in the order they were scheduled.  Descheduling is lazy: stale heap entries
/// are skipped when popped.
pub struct EventQueue {
    now: Tick,
    frequency: u64,
    slots: Vec<EventSlot>,
    free: Vec<u32>,
    heap: BinaryHeap<Reverse<(Tick, u64, u32)>>,
    next_seq: u64,
    next_name: u64,
    fired: u64,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_FREQUENCY)
    }
}

impl EventQueue {
    pub fn new(frequency: u64) -> Self {
        assert!(frequency > 0, "tick frequency must be > 0");
        Self {
            now: 0,
            frequency,
            slots: Vec::new(),
            free: Vec::new(),
            heap: BinaryHeap::new(),
            next_seq: 0,
            next_name: 0,
            fired: 0,
        }
    }

    /// Number of callbacks executed so far.
    pub fn events_fired(&self) -> u64 {
        self.fired
    }

    pub fn event_name(&self, event: EventId) -> Option<&str> {
        self.slots
            .get(event.index as usize)
            .filter(|slot| slot.live && slot.generation == event.generation)
            .map(|slot| slot.name.as_str())
    }

    /// Drops an event and its callback.  The handle becomes invalid.
    pub fn release_event(&mut self, event: EventId) {
        let slot = self.slot_mut(event);
        slot.live = false;
        slot.when = MAX_TICK;
        slot.callback = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(event.index);
    }

    /// Tick of the next pending event, if any.
    pub fn next_tick(&mut self) -> Option<Tick> {
        while let Some(Reverse((when, seq, index))) = self.heap.peek().copied() {
            if self.is_live_entry(when, seq, index) {
                return Some(when);
            }
            self.heap.pop();
        }
        None
    }

    pub fn is_empty(&mut self) -> bool {
        self.next_tick().is_none()
    }

    /// Fires the next pending event.  Returns false when nothing is pending.
    pub fn step(&mut self) -> bool {
        while let Some(Reverse((when, seq, index))) = self.heap.pop() {
            if !self.is_live_entry(when, seq, index) {
                continue;
            }

            let slot = &mut self.slots[index as usize];
            slot.when = MAX_TICK;
            let generation = slot.generation;
            let one_shot = slot.one_shot;
            let mut callback = slot.callback.take();
            trace!("tick {}: firing {}", when, slot.name);

            self.now = when;
            self.fired += 1;
            if let Some(cb) = callback.as_mut() {
                cb(self);
            }

            // the callback may have released or rescheduled its own event
            let slot = &mut self.slots[index as usize];
            if slot.live && slot.generation == generation {
                if one_shot && slot.when == MAX_TICK {
                    self.release_event(EventId { index, generation });
                } else {
                    slot.callback = callback;
                }
            }
            return true;
        }
        false
    }

    /// Runs until no events remain.  Returns the number of events fired.
    pub fn run(&mut self) -> u64 {
        let start = self.fired;
        while self.step() {}
        self.fired - start
    }

    /// Runs every event due at or before `limit`, then advances time to `limit`.
    pub fn run_until(&mut self, limit: Tick) -> u64 {
        let start = self.fired;
        while let Some(when) = self.next_tick() {
            if when > limit {
                break;
            }
            self.step();
        }
        if limit != MAX_TICK && limit > self.now {
            self.now = limit;
        }
        self.fired - start
    }

    fn is_live_entry(&self, when: Tick, seq: u64, index: u32) -> bool {
        let slot = &self.slots[index as usize];
        slot.live && slot.when == when && slot.seq == seq
    }

    fn slot(&self, event: EventId) -> &EventSlot {
        let slot = &self.slots[event.index as usize];
        assert!(
            slot.live && slot.generation == event.generation,
            "use of released event handle {:?}",
            event
        );
        slot
    }

    fn slot_mut(&mut self, event: EventId) -> &mut EventSlot {
        let slot = &mut self.slots[event.index as usize];
        assert!(
            slot.live && slot.generation == event.generation,
            "use of released event handle {:?}",
            event
        );
        slot
    }

    fn alloc(&mut self, callback: EventCallback, name: &str, one_shot: bool) -> EventId {
        let name = if name.is_empty() {
            let generated = format!("salam_event_{}", self.next_name);
            self.next_name += 1;
            generated
        } else {
            name.to_string()
        };

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.name = name;
            slot.callback = Some(callback);
            slot.when = MAX_TICK;
            slot.one_shot = one_shot;
            slot.live = true;
            return EventId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(EventSlot {
            name,
            generation: 0,
            callback: Some(callback),
            when: MAX_TICK,
            seq: 0,
            one_shot,
            live: true,
        });
        EventId {
            index,
            generation: 0,
        }
    }
}

impl Scheduler for EventQueue {
    fn current_tick(&self) -> Tick {
        self.now
    }

    fn tick_frequency(&self) -> u64 {
        self.frequency
    }

    fn create_event(&mut self, callback: EventCallback, name: &str) -> EventId {
        self.alloc(callback, name, false)
    }

    fn schedule(&mut self, event: EventId, when: Tick) {
        let now = self.now;
        let seq = self.next_seq;
        let slot = self.slot_mut(event);
        assert!(
            slot.when == MAX_TICK,
            "event '{}' already scheduled at tick {}",
            slot.name,
            slot.when
        );
        assert!(when != MAX_TICK, "event '{}' scheduled at MAX_TICK", slot.name);
        assert!(
            when >= now,
            "event '{}' scheduled in the past ({} < {})",
            slot.name,
            when,
            now
        );
        slot.when = when;
        slot.seq = seq;
        self.next_seq += 1;
        self.heap.push(Reverse((when, seq, event.index)));
    }

    fn deschedule(&mut self, event: EventId) {
        self.slot_mut(event).when = MAX_TICK;
    }

    fn reschedule(&mut self, event: EventId, when: Tick) {
        self.deschedule(event);
        self.schedule(event, when);
    }

    fn scheduled_tick(&self, event: EventId) -> Tick {
        self.slot(event).when
    }

    fn schedule_callback(&mut self, when: Tick, callback: EventCallback, name: &str) -> EventId {
        let event = self.alloc(callback, name, true);
        self.schedule(event, when);
        event
    }
}

// Result of queueing a request with a timed server
#[derive(Debug, Clone, Copy)]
pub struct Ticket {
    ready_at: Cycle,
}

impl Ticket {
    // Cycle at which the server will make the payload available to downstream consumers.
    pub fn ready_at(&self) -> Cycle {
        self.ready_at
    }

    pub fn is_ready(&self, now: Cycle) -> bool {
        now >= self.ready_at
    }
}

// Server refused the request because every slot is occupied
#[derive(Debug)]
pub struct Backpressure<T> {
    pub payload: T,
    // Cycle at which the oldest in-flight request retires and frees a slot
    pub retry_at: Cycle,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    // Fixed latency added to every request
    pub base_latency: Cycle,
    // Throughput
    pub bytes_per_cycle: u32,
    // Maximum number of outstanding requests the server will accept
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_latency: 0,
            bytes_per_cycle: 1,
            queue_capacity: 1,
        }
    }
}

#[derive(Debug)]
struct Inflight<T> {
    payload: T,
    ticket: Ticket,
}

// Pipelined server: transfers are serialized on the data path (bytes_per_cycle) while the base
// latency overlaps between requests.  Outstanding work is tracked in issue order.
#[derive(Debug)]
pub struct TimedServer<T> {
    config: ServerConfig,
    inflight: VecDeque<Inflight<T>>,
    busy_until: Cycle,
}

impl<T> TimedServer<T> {
    pub fn new(config: ServerConfig) -> Self {
        assert!(config.bytes_per_cycle > 0, "bytes_per_cycle must be > 0");
        assert!(config.queue_capacity > 0, "queue_capacity must be > 0");
        Self {
            config,
            inflight: VecDeque::with_capacity(config.queue_capacity),
            busy_until: 0,
        }
    }

    // Attempt to enqueue a request at the provided cycle.
    pub fn try_enqueue(
        &mut self,
        now: Cycle,
        payload: T,
        size_bytes: u32,
    ) -> Result<Ticket, Backpressure<T>> {
        if self.inflight.len() >= self.config.queue_capacity {
            let retry_at = self
                .inflight
                .iter()
                .map(|entry| entry.ticket.ready_at)
                .min()
                .unwrap_or(now)
                .max(now);
            return Err(Backpressure {
                payload,
                retry_at,
            });
        }

        let start = self.busy_until.max(now);
        let transfer = ceil_div_u64(size_bytes as u64, self.config.bytes_per_cycle as u64);
        let ready_at = start
            .saturating_add(transfer)
            .saturating_add(self.config.base_latency);
        let ticket = Ticket { ready_at };

        self.busy_until = start.saturating_add(transfer);
        self.inflight.push_back(Inflight { payload, ticket });

        Ok(ticket)
    }

    // Retire every request that has completed by "now", in ready order.
    pub fn service_ready<F>(&mut self, now: Cycle, mut callback: F)
    where
        F: FnMut(T, Ticket),
    {
        let mut idx = 0;
        while idx < self.inflight.len() {
            if self.inflight[idx].ticket.is_ready(now) {
                if let Some(done) = self.inflight.remove(idx) {
                    callback(done.payload, done.ticket);
                }
            } else {
                idx += 1;
            }
        }

        if self.inflight.is_empty() && now > self.busy_until {
            self.busy_until = now;
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.inflight.is_empty()
    }
}

pub(crate) fn ceil_div_u64(nom: u64, denom: u64) -> u64 {
    debug_assert!(denom > 0);
    nom.div_ceil(denom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder(log: &Rc<RefCell<Vec<&'static str>>>, tag: &'static str) -> EventCallback {
        let log = Rc::clone(log);
        Box::new(move |_sched: &mut dyn Scheduler| log.borrow_mut().push(tag))
    }

    #[test]
    fn same_tick_events_fire_in_submission_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = EventQueue::default();
        let a = q.create_event(recorder(&log, "a"), "a");
        let b = q.create_event(recorder(&log, "b"), "b");
        let c = q.create_event(recorder(&log, "c"), "c");
        q.schedule(b, 10);
        q.schedule(a, 10);
        q.schedule(c, 5);
        assert_eq!(3, q.run());
        assert_eq!(vec!["c", "b", "a"], *log.borrow());
        assert_eq!(10, q.current_tick());
    }

    #[test]
    fn deschedule_cancels_and_is_noop_when_idle() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = EventQueue::default();
        let a = q.create_event(recorder(&log, "a"), "");
        q.deschedule(a);
        q.schedule(a, 4);
        assert!(q.is_scheduled(a));
        q.deschedule(a);
        assert!(!q.is_scheduled(a));
        assert_eq!(0, q.run());
        assert!(log.borrow().is_empty());
        assert_eq!(Some("salam_event_0"), q.event_name(a));
    }

    #[test]
    fn reschedule_moves_pending_event() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = EventQueue::default();
        let a = q.create_event(recorder(&log, "a"), "a");
        let b = q.create_event(recorder(&log, "b"), "b");
        q.schedule(a, 5);
        q.schedule(b, 7);
        q.reschedule(a, 9);
        assert_eq!(9, q.scheduled_tick(a));
        q.run();
        assert_eq!(vec!["b", "a"], *log.borrow());
    }

    #[test]
    #[should_panic(expected = "already scheduled")]
    fn double_schedule_panics() {
        let mut q = EventQueue::default();
        let a = q.create_event(Box::new(|_: &mut dyn Scheduler| {}), "a");
        q.schedule(a, 1);
        q.schedule(a, 2);
    }

    #[test]
    fn periodic_event_reschedules_itself() {
        let count = Rc::new(RefCell::new(0u32));
        let mut q = EventQueue::default();
        let seen = Rc::clone(&count);
        let slot: Rc<RefCell<Option<EventId>>> = Rc::new(RefCell::new(None));
        let me = Rc::clone(&slot);
        let ev = q.create_event(
            Box::new(move |sched: &mut dyn Scheduler| {
                *seen.borrow_mut() += 1;
                if *seen.borrow() < 4 {
                    if let Some(id) = *me.borrow() {
                        sched.schedule_after(id, 100);
                    }
                }
            }),
            "clock",
        );
        *slot.borrow_mut() = Some(ev);
        q.schedule(ev, 0);
        q.run();
        assert_eq!(4, *count.borrow());
        assert_eq!(300, q.current_tick());
    }

    #[test]
    fn one_shot_callbacks_are_released() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = EventQueue::default();
        let ev = q.schedule_callback(3, recorder(&log, "once"), "once");
        q.run();
        assert_eq!(vec!["once"], *log.borrow());
        assert_eq!(None, q.event_name(ev));
    }

    #[test]
    fn run_until_stops_at_limit() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = EventQueue::default();
        q.schedule_callback(5, recorder(&log, "early"), "");
        q.schedule_callback(50, recorder(&log, "late"), "");
        assert_eq!(1, q.run_until(20));
        assert_eq!(20, q.current_tick());
        assert_eq!(Some(50), q.next_tick());
    }

    #[test]
    fn ns_tick_conversion() {
        let q = EventQueue::default();
        assert_eq!(10_000, q.ns_to_ticks(10));
        assert_eq!(10, q.ticks_to_ns(10_000));
        let slow = EventQueue::new(1_000_000_000);
        assert_eq!(7, slow.ns_to_ticks(7));
    }

    #[test]
    fn server_queue_full_reports_retry_cycle() {
        let mut server = TimedServer::new(ServerConfig {
            base_latency: 4,
            bytes_per_cycle: 8,
            queue_capacity: 2,
        });
        let first = server.try_enqueue(0, 'a', 16).expect("first");
        let second = server.try_enqueue(0, 'b', 16).expect("second");
        assert_eq!(6, first.ready_at());
        assert_eq!(8, second.ready_at());
        let err = server.try_enqueue(1, 'c', 16).expect_err("full");
        assert_eq!('c', err.payload);
        assert_eq!(6, err.retry_at);

        let mut done = Vec::new();
        server.service_ready(6, |payload, _| done.push(payload));
        assert_eq!(vec!['a'], done);
        assert!(server.try_enqueue(6, 'c', 16).is_ok());
    }
}
