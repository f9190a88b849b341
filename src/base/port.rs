use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use log::{debug, warn};
use serde::Serialize;

use crate::base::mem::{MemoryResponder, Reject};
use crate::base::request::{AddrRange, MemoryRequest, RequestId};
use crate::timeq::{EventId, Scheduler, Tick, MAX_TICK};

pub type CompletionCallback = Box<dyn FnMut(&mut dyn Scheduler, MemoryRequest)>;

/// Requestor side of the memory protocol.
pub trait MemoryPort {
    fn name(&self) -> &str;

    /// Submits a request for timing processing.  Returns true once it has been accepted
    /// downstream.  On false the port keeps the request queued and will resubmit it on retry.
    fn send_timing_request(&mut self, sched: &mut dyn Scheduler, req: MemoryRequest) -> bool;

    /// Performs the access immediately, ignoring back-pressure.
    fn send_functional(&mut self, req: &mut MemoryRequest);

    /// Resubmits queued requests in order, stopping at the first renewed refusal.
    fn recv_retry(&mut self, sched: &mut dyn Scheduler);

    fn is_stalled(&self) -> bool;

    fn is_ready(&self) -> bool {
        !self.is_stalled()
    }

    /// Called once per accepted timing request, at the tick its response arrives.
    fn set_completion_callback(&mut self, callback: CompletionCallback);

    fn address_range(&self) -> AddrRange {
        AddrRange::FULL
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PortStats {
    pub sent: u64,
    pub accepted: u64,
    pub refused: u64,
    pub retries: u64,
    pub completed: u64,
    pub max_retry_depth: u64,
}

struct PortInner {
    name: String,
    responder: Rc<RefCell<dyn MemoryResponder>>,
    stalled: bool,
    retry_queue: VecDeque<MemoryRequest>,
    inflight: HashMap<RequestId, MemoryRequest>,
    next_id: RequestId,
    callback: Option<CompletionCallback>,
    retry_event: Option<EventId>,
    stats: PortStats,
}

/// Standalone port wired directly to a responder.  Cloning yields another handle to the same
/// port, which is how scheduled responses and retries find their way back.
#[derive(Clone)]
pub struct TimingPort {
    name: String,
    inner: Rc<RefCell<PortInner>>,
}

impl TimingPort {
    pub fn new(name: &str, responder: Rc<RefCell<dyn MemoryResponder>>) -> Self {
        Self {
            name: name.to_string(),
            inner: Rc::new(RefCell::new(PortInner {
                name: name.to_string(),
                responder,
                stalled: false,
                retry_queue: VecDeque::new(),
                inflight: HashMap::new(),
                next_id: 0,
                callback: None,
                retry_event: None,
                stats: PortStats::default(),
            })),
        }
    }

    /// Accepted requests whose response has not arrived yet.
    pub fn inflight(&self) -> usize {
        self.inner.borrow().inflight.len()
    }

    pub fn retry_depth(&self) -> usize {
        self.inner.borrow().retry_queue.len()
    }

    /// True when nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.borrow();
        inner.inflight.is_empty() && inner.retry_queue.is_empty()
    }

    pub fn stats(&self) -> PortStats {
        self.inner.borrow().stats
    }

    fn try_send(
        &self,
        sched: &mut dyn Scheduler,
        mut req: MemoryRequest,
    ) -> Result<(), (MemoryRequest, Reject)> {
        let responder = Rc::clone(&self.inner.borrow().responder);
        let now = sched.current_tick();
        let verdict = responder.borrow_mut().recv_timing_request(now, &mut req);
        match verdict {
            Ok(ready_at) => {
                let id = req.id;
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.inflight.insert(id, req);
                    inner.stats.accepted += 1;
                }
                let port = self.clone();
                let name = format!("{}.response", self.name);
                sched.schedule_callback(
                    ready_at.max(now),
                    Box::new(move |s: &mut dyn Scheduler| port.deliver(s, id)),
                    &name,
                );
                Ok(())
            }
            Err(reject) => {
                self.inner.borrow_mut().stats.refused += 1;
                Err((req, reject))
            }
        }
    }

    fn deliver(&self, sched: &mut dyn Scheduler, id: RequestId) {
        let (req, callback) = {
            let mut inner = self.inner.borrow_mut();
            let Some(mut req) = inner.inflight.remove(&id) else {
                warn!("{}: response for unknown request {}", inner.name, id);
                return;
            };
            req.response_tick = sched.current_tick();
            req.completed = true;
            inner.stats.completed += 1;
            (req, inner.callback.take())
        };

        match callback {
            Some(mut cb) => {
                cb(sched, req);
                let mut inner = self.inner.borrow_mut();
                if inner.callback.is_none() {
                    inner.callback = Some(cb);
                }
            }
            None => debug!("{}: no completion callback, dropping response {}", self.name, id),
        }
    }

    fn stall(&self, sched: &mut dyn Scheduler, retry_at: Tick) {
        self.inner.borrow_mut().stalled = true;
        if retry_at == MAX_TICK {
            return;
        }

        let existing = self.inner.borrow().retry_event;
        let event = match existing {
            Some(event) => event,
            None => {
                let mut port = self.clone();
                let name = format!("{}.retry", self.name);
                let event = sched.create_event(
                    Box::new(move |s: &mut dyn Scheduler| port.recv_retry(s)),
                    &name,
                );
                self.inner.borrow_mut().retry_event = Some(event);
                event
            }
        };

        let pending = sched.scheduled_tick(event);
        if pending == MAX_TICK {
            sched.schedule(event, retry_at.max(sched.current_tick()));
        } else if retry_at < pending {
            sched.reschedule(event, retry_at.max(sched.current_tick()));
        }
    }
}

impl MemoryPort for TimingPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_timing_request(&mut self, sched: &mut dyn Scheduler, mut req: MemoryRequest) -> bool {
        {
            let mut inner = self.inner.borrow_mut();
            inner.next_id += 1;
            req.id = inner.next_id;
            req.request_tick = sched.current_tick();
            req.response_tick = MAX_TICK;
            req.completed = false;
            inner.stats.sent += 1;
            if inner.stalled {
                inner.retry_queue.push_back(req);
                inner.stats.max_retry_depth =
                    inner.stats.max_retry_depth.max(inner.retry_queue.len() as u64);
                return false;
            }
        }

        match self.try_send(sched, req) {
            Ok(()) => true,
            Err((req, reject)) => {
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.retry_queue.push_back(req);
                    inner.stats.max_retry_depth =
                        inner.stats.max_retry_depth.max(inner.retry_queue.len() as u64);
                }
                self.stall(sched, reject.retry_at);
                false
            }
        }
    }

    fn send_functional(&mut self, req: &mut MemoryRequest) {
        let responder = Rc::clone(&self.inner.borrow().responder);
        responder.borrow_mut().recv_functional(req);
    }

    fn recv_retry(&mut self, sched: &mut dyn Scheduler) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.stalled = false;
            inner.stats.retries += 1;
        }

        loop {
            let next = self.inner.borrow_mut().retry_queue.pop_front();
            let Some(req) = next else { break };
            if let Err((req, reject)) = self.try_send(sched, req) {
                // keep the refused request at the head so ordering survives
                self.inner.borrow_mut().retry_queue.push_front(req);
                self.stall(sched, reject.retry_at);
                break;
            }
        }
        debug!("{}: retry done, {} still queued", self.name, self.retry_depth());
    }

    fn is_stalled(&self) -> bool {
        self.inner.borrow().stalled
    }

    fn set_completion_callback(&mut self, callback: CompletionCallback) {
        self.inner.borrow_mut().callback = Some(callback);
    }

    fn address_range(&self) -> AddrRange {
        self.inner.borrow().responder.borrow().address_range()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::mem::{RejectReason, SimpleMemory, TimedMemory};
    use crate::base::module::{ClockDomain, Component};
    use crate::timeq::{EventQueue, ServerConfig};

    // Accepts while it has budget, then refuses without a retry hint.
    struct Gate {
        budget: usize,
        seen: Vec<u64>,
    }

    impl MemoryResponder for Gate {
        fn address_range(&self) -> AddrRange {
            AddrRange::FULL
        }

        fn recv_functional(&mut self, req: &mut MemoryRequest) {
            req.mark_done(true);
        }

        fn recv_timing_request(&mut self, now: Tick, req: &mut MemoryRequest) -> Result<Tick, Reject> {
            if self.budget == 0 {
                return Err(Reject {
                    retry_at: MAX_TICK,
                    reason: RejectReason::Busy,
                });
            }
            self.budget -= 1;
            self.seen.push(req.address);
            req.mark_done(true);
            Ok(now + 10)
        }
    }

    fn gated_port(budget: usize) -> (TimingPort, Rc<RefCell<Gate>>) {
        let gate = Rc::new(RefCell::new(Gate {
            budget,
            seen: Vec::new(),
        }));
        let port = TimingPort::new("port", gate.clone());
        (port, gate)
    }

    #[test]
    fn stalled_requests_retry_in_order() {
        let mut q = EventQueue::default();
        let (mut port, gate) = gated_port(0);

        assert!(!port.send_timing_request(&mut q, MemoryRequest::read(0xa, 4)));
        assert!(port.is_stalled());
        assert!(!port.send_timing_request(&mut q, MemoryRequest::read(0xb, 4)));
        assert!(!port.send_timing_request(&mut q, MemoryRequest::read(0xc, 4)));
        assert_eq!(3, port.retry_depth());

        gate.borrow_mut().budget = 2;
        port.recv_retry(&mut q);
        assert_eq!(vec![0xa, 0xb], gate.borrow().seen);
        assert!(port.is_stalled());
        assert_eq!(1, port.retry_depth());

        gate.borrow_mut().budget = 5;
        port.recv_retry(&mut q);
        assert_eq!(vec![0xa, 0xb, 0xc], gate.borrow().seen);
        assert!(port.is_ready());
        assert_eq!(0, port.retry_depth());
    }

    #[test]
    fn completion_fires_once_per_request() {
        let mut q = EventQueue::default();
        let (mut port, _gate) = gated_port(8);
        let done: Rc<RefCell<Vec<(u64, Tick)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&done);
        port.set_completion_callback(Box::new(move |_s: &mut dyn Scheduler, req: MemoryRequest| {
            assert!(req.completed);
            sink.borrow_mut().push((req.address, req.response_tick));
        }));

        assert!(port.send_timing_request(&mut q, MemoryRequest::read(1, 4)));
        assert!(port.send_timing_request(&mut q, MemoryRequest::read(2, 4)));
        assert_eq!(2, port.inflight());
        q.run();
        assert_eq!(vec![(1, 10), (2, 10)], *done.borrow());
        assert!(port.is_idle());
        assert_eq!(2, port.stats().completed);
    }

    #[test]
    fn functional_access_bypasses_stall() {
        let mut q = EventQueue::default();
        let (mut port, _gate) = gated_port(0);
        assert!(!port.send_timing_request(&mut q, MemoryRequest::read(0, 4)));
        let mut req = MemoryRequest::read(0, 4);
        port.send_functional(&mut req);
        assert!(req.completed && req.success);
    }

    #[test]
    fn queue_full_schedules_its_own_retry() {
        let mut q = EventQueue::default();
        let clock = ClockDomain::new(1000);
        let mut spm = TimedMemory::new(
            "spm",
            SimpleMemory::new(0, 256),
            clock,
            ServerConfig {
                base_latency: 3,
                bytes_per_cycle: 4,
                queue_capacity: 1,
            },
        );
        spm.init();
        spm.startup();
        let spm = Rc::new(RefCell::new(spm));
        let mut port = TimingPort::new("lsu", spm.clone());
        let order = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&order);
        port.set_completion_callback(Box::new(move |_s: &mut dyn Scheduler, req: MemoryRequest| {
            sink.borrow_mut().push(req.address);
        }));

        for addr in [0u64, 4, 8] {
            port.send_timing_request(&mut q, MemoryRequest::read(addr, 4));
        }
        assert!(port.is_stalled());
        q.run();
        assert_eq!(vec![0, 4, 8], *order.borrow());
        assert!(port.is_idle());
        assert!(port.is_ready());
        assert!(port.stats().retries >= 2);
    }
}
