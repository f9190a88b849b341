use log::warn;

use crate::timeq::{EventId, Scheduler, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComponentState {
    #[default]
    Created,
    Initialized,
    Started,
    Draining,
    Drained,
    Resuming,
    Stopped,
}

impl ComponentState {
    pub fn can_transition_to(self, next: ComponentState) -> bool {
        use ComponentState::*;
        match (self, next) {
            (Created, Initialized) | (Initialized, Started) => true,
            (Started, Draining) | (Started, Drained) | (Draining, Drained) => true,
            (Draining, Resuming) | (Drained, Resuming) | (Resuming, Started) => true,
            (Stopped, _) => false,
            (_, Stopped) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ComponentBase {
    pub name: String,
    state: ComponentState,
    drain_listener: Option<EventId>,
}

impl ComponentBase {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    fn transition(&mut self, next: ComponentState) {
        assert!(
            self.state.can_transition_to(next),
            "{}: illegal transition {:?} -> {:?}",
            self.name,
            self.state,
            next
        );
        self.state = next;
    }

    /// Event scheduled when an asynchronous drain finishes.
    pub fn set_drain_listener(&mut self, event: EventId) {
        self.drain_listener = Some(event);
    }
}

/// Lifecycle shared by every timed hardware unit.
///
/// Implementors provide the `*_impl` hooks; the wrappers enforce the state machine.
pub trait Component {
    fn base(&mut self) -> &mut ComponentBase;

    fn base_ref(&self) -> &ComponentBase;

    fn name(&self) -> &str {
        &self.base_ref().name
    }

    fn state(&self) -> ComponentState {
        self.base_ref().state
    }

    fn init_impl(&mut self) {}

    fn startup_impl(&mut self) {}

    /// Returns true when nothing is outstanding and the drain can finish immediately.
    fn drain_impl(&mut self) -> bool {
        true
    }

    fn resume_impl(&mut self) {}

    fn stop_impl(&mut self) {}

    fn reset_stats(&mut self) {}

    fn init(&mut self) {
        if self.state() != ComponentState::Created {
            warn!("{}: init() in state {:?} ignored", self.name(), self.state());
            return;
        }
        self.init_impl();
        self.base().transition(ComponentState::Initialized);
    }

    fn startup(&mut self) {
        if self.state() != ComponentState::Initialized {
            warn!("{}: startup() in state {:?} ignored", self.name(), self.state());
            return;
        }
        self.startup_impl();
        self.base().transition(ComponentState::Started);
    }

    /// Returns whether the drain completed synchronously.  Otherwise the component stays in
    /// `Draining` until it calls `signal_drained`.
    fn drain(&mut self) -> bool {
        match self.state() {
            ComponentState::Drained => return true,
            ComponentState::Draining => return false,
            ComponentState::Started => {}
            other => panic!("{}: drain() in state {:?}", self.name(), other),
        }
        if self.drain_impl() {
            self.base().transition(ComponentState::Drained);
            true
        } else {
            self.base().transition(ComponentState::Draining);
            false
        }
    }

    /// Completes an asynchronous drain and notifies the drain listener, if any.
    fn signal_drained(&mut self, sched: &mut dyn Scheduler) {
        if self.state() != ComponentState::Draining {
            return;
        }
        self.base().transition(ComponentState::Drained);
        if let Some(listener) = self.base_ref().drain_listener {
            if !sched.is_scheduled(listener) {
                let now = sched.current_tick();
                sched.schedule(listener, now);
            }
        }
    }

    fn drain_resume(&mut self) {
        match self.state() {
            ComponentState::Drained | ComponentState::Draining => {}
            other => panic!(
                "{}: drain_resume() on a component that was never drained (state {:?})",
                self.name(),
                other
            ),
        }
        self.base().transition(ComponentState::Resuming);
        self.resume_impl();
        self.base().transition(ComponentState::Started);
    }

    fn stop(&mut self) {
        if self.state() == ComponentState::Stopped {
            return;
        }
        self.stop_impl();
        self.base().transition(ComponentState::Stopped);
    }
}

/// Fixed-period clock derived from the tick timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockDomain {
    period: Tick,
}

impl ClockDomain {
    pub fn new(period: Tick) -> Self {
        assert!(period > 0, "clock period must be > 0");
        Self { period }
    }

    pub fn from_ns(period_ns: u64, sched: &dyn Scheduler) -> Self {
        Self::new(sched.ns_to_ticks(period_ns).max(1))
    }

    pub fn period(&self) -> Tick {
        self.period
    }

    pub fn frequency_hz(&self, tick_frequency: u64) -> f64 {
        tick_frequency as f64 / self.period as f64
    }

    /// First cycle boundary strictly after `after`.
    pub fn next_cycle(&self, after: Tick) -> Tick {
        (after / self.period + 1) * self.period
    }

    pub fn cycles_to_ticks(&self, cycles: u64) -> Tick {
        cycles.saturating_mul(self.period)
    }

    pub fn ticks_to_cycles(&self, ticks: Tick) -> u64 {
        ticks / self.period
    }
}

/// A component that advances on cycle boundaries.
pub trait Clocked: Component {
    fn clock(&self) -> &ClockDomain;

    fn current_cycle(&self, sched: &dyn Scheduler) -> u64 {
        self.clock().ticks_to_cycles(sched.current_tick())
    }

    fn next_cycle_tick(&self, sched: &dyn Scheduler) -> Tick {
        self.clock().next_cycle(sched.current_tick())
    }
}

/// arguments: identifier, additional trait methods
macro_rules! component {
    ($comp:ident, $($method:item)*) => {
        impl Component for $comp {
            fn base(&mut self) -> &mut ComponentBase {
                &mut self.base
            }

            fn base_ref(&self) -> &ComponentBase {
                &self.base
            }

            $($method)*
        }
    };
}

pub(crate) use component;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeq::EventQueue;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Unit {
        base: ComponentBase,
        outstanding: u32,
        inits: u32,
    }

    impl Unit {
        fn new(outstanding: u32) -> Self {
            Self {
                base: ComponentBase::new("unit"),
                outstanding,
                inits: 0,
            }
        }
    }

    component!(Unit,
        fn init_impl(&mut self) {
            self.inits += 1;
        }

        fn drain_impl(&mut self) -> bool {
            self.outstanding == 0
        }
    );

    #[test]
    fn synchronous_drain_cycle() {
        let mut unit = Unit::new(0);
        unit.init();
        unit.startup();
        assert_eq!(ComponentState::Started, unit.state());
        assert!(unit.drain());
        assert_eq!(ComponentState::Drained, unit.state());
        unit.drain_resume();
        assert_eq!(ComponentState::Started, unit.state());
        unit.stop();
        assert_eq!(ComponentState::Stopped, unit.state());
    }

    #[test]
    fn double_init_is_ignored() {
        let mut unit = Unit::new(0);
        unit.init();
        unit.init();
        assert_eq!(1, unit.inits);
        assert_eq!(ComponentState::Initialized, unit.state());
    }

    #[test]
    fn asynchronous_drain_notifies_listener() {
        let mut q = EventQueue::default();
        let fired = Rc::new(Cell::new(false));
        let seen = Rc::clone(&fired);
        let listener = q.create_event(Box::new(move |_: &mut dyn Scheduler| seen.set(true)), "drained");

        let mut unit = Unit::new(2);
        unit.base().set_drain_listener(listener);
        unit.init();
        unit.startup();
        assert!(!unit.drain());
        assert_eq!(ComponentState::Draining, unit.state());
        assert!(!unit.drain());

        unit.outstanding = 0;
        unit.signal_drained(&mut q);
        assert_eq!(ComponentState::Drained, unit.state());
        q.run();
        assert!(fired.get());
    }

    #[test]
    #[should_panic(expected = "never drained")]
    fn resume_without_drain_panics() {
        let mut unit = Unit::new(0);
        unit.init();
        unit.startup();
        unit.drain_resume();
    }

    #[test]
    fn clock_boundaries() {
        let clock = ClockDomain::new(1000);
        assert_eq!(1000, clock.next_cycle(0));
        assert_eq!(2000, clock.next_cycle(1000));
        assert_eq!(2000, clock.next_cycle(1999));
        assert_eq!(5000, clock.cycles_to_ticks(5));
        assert_eq!(4, clock.ticks_to_cycles(4999));
        assert_eq!(1e9, clock.frequency_hz(1_000_000_000_000));
    }

    #[test]
    fn stopped_is_terminal() {
        assert!(!ComponentState::Stopped.can_transition_to(ComponentState::Started));
        assert!(ComponentState::Drained.can_transition_to(ComponentState::Resuming));
        assert!(!ComponentState::Created.can_transition_to(ComponentState::Started));
    }
}
