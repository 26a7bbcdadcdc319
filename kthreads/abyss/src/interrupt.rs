//! Interrupt controller.
//!
//! The controller keeps the simulated clock. Time only moves forward when
//! interrupts go from disabled to enabled: each such transition advances the
//! clock by [`KERNEL_TICK`] and delivers every pending interrupt that became
//! due, in due-time order. Handlers run with interrupts disabled, and may
//! switch to another context before they return.
//!
//! Disabling interrupts returns the previous [`InterruptState`], and
//! restoring puts that state back. Nested critical sections therefore compose
//! without any counter:
//!
//! ```
//! # use abyss::machine::{Machine, MachineConfig};
//! # let machine = Machine::new(&MachineConfig::default());
//! let interrupt = machine.interrupt();
//! interrupt.enable();
//! let outer = interrupt.disable();
//! let inner = interrupt.disable();
//! interrupt.restore(inner);
//! assert!(interrupt.disabled());
//! interrupt.restore(outer);
//! assert!(interrupt.enabled());
//! ```

use crate::{KERNEL_TICK, dprintln, kprint::DebugFlags, spinlock::SpinLock, tcb};
use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

/// Enumeration representing the interrupt state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

/// A one-shot interrupt handler.
pub type Handler = Box<dyn FnOnce() + Send>;

struct PendingInterrupt {
    when: u64,
    seq: u64,
    kind: &'static str,
    handler: Handler,
}

impl PartialEq for PendingInterrupt {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for PendingInterrupt {}

impl PartialOrd for PendingInterrupt {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingInterrupt {
    // Earliest first on top of the max-heap.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The interrupt controller of the machine.
pub struct Interrupt {
    enabled: AtomicBool,
    halted: AtomicBool,
    clock: AtomicU64,
    delivered: AtomicU64,
    seq: AtomicU64,
    pending: SpinLock<BinaryHeap<PendingInterrupt>>,
}

impl Interrupt {
    /// Creates a controller with interrupts disabled at time zero.
    pub(crate) fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            clock: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            pending: SpinLock::new(BinaryHeap::new()),
        }
    }

    /// Disables interrupts and returns the previous state.
    pub fn disable(&self) -> InterruptState {
        if self.enabled.swap(false, Ordering::SeqCst) {
            InterruptState::On
        } else {
            InterruptState::Off
        }
    }

    /// Restores the state returned by a previous [`Interrupt::disable`].
    pub fn restore(&self, state: InterruptState) {
        match state {
            InterruptState::On => self.enable(),
            InterruptState::Off => {
                if !tcb::is_torn_down() {
                    self.enabled.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    /// Enables interrupts.
    ///
    /// If interrupts were disabled, the clock advances by one tick and due
    /// interrupts are delivered.
    pub fn enable(&self) {
        // A context being torn down no longer owns the processor.
        if tcb::is_torn_down() {
            return;
        }
        if !self.enabled.swap(true, Ordering::SeqCst)
            && !self.halted.load(Ordering::SeqCst)
            && !std::thread::panicking()
        {
            self.tick();
        }
    }

    /// Whether interrupts are enabled.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether interrupts are disabled.
    pub fn disabled(&self) -> bool {
        !self.enabled()
    }

    /// Current simulated time, in ticks.
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    /// Number of interrupts delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Number of interrupts that are not delivered yet.
    pub fn pending(&self) -> usize {
        self.pending.with(|pending| pending.len())
    }

    /// Arranges for `handler` to run `delay` ticks from now.
    pub fn schedule(&self, delay: u64, kind: &'static str, handler: impl FnOnce() + Send + 'static) {
        assert!(delay > 0, "interrupt must be scheduled in the future");
        let when = self.now() + delay;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        dprintln!(
            DebugFlags::INTERRUPT,
            "Scheduling interrupt handler the {kind} at time = {when}"
        );
        self.pending.with(|pending| {
            pending.push(PendingInterrupt {
                when,
                seq,
                kind,
                handler: Box::new(handler),
            })
        });
    }

    /// Stops delivering interrupts and drops the pending ones.
    pub(crate) fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
        let pending = self.pending.with(core::mem::take);
        drop(pending);
    }

    fn take_due(&self) -> Option<PendingInterrupt> {
        let now = self.now();
        self.pending.with(|pending| {
            if pending.peek().is_some_and(|p| p.when <= now) {
                pending.pop()
            } else {
                None
            }
        })
    }

    fn tick(&self) {
        let now = self.clock.fetch_add(KERNEL_TICK, Ordering::SeqCst) + KERNEL_TICK;
        dprintln!(DebugFlags::INTERRUPT, "== Tick {now} ==");

        self.enabled.store(false, Ordering::SeqCst);
        while let Some(interrupt) = self.take_due() {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            dprintln!(
                DebugFlags::INTERRUPT,
                "Invoking interrupt handler for the {} at time {}",
                interrupt.kind,
                interrupt.when
            );
            (interrupt.handler)();
            if self.halted.load(Ordering::SeqCst) {
                return;
            }
        }
        self.enabled.store(true, Ordering::SeqCst);
    }
}

/// RAII implementation of an interrupt-disabled section.
///
/// Interrupts are disabled while the guard lives; dropping it restores the
/// state observed at creation.
pub struct InterruptGuard<'a> {
    interrupt: &'a Interrupt,
    state: InterruptState,
}

impl<'a> InterruptGuard<'a> {
    /// Disables interrupts until the guard is dropped.
    pub fn new(interrupt: &'a Interrupt) -> Self {
        Self {
            state: interrupt.disable(),
            interrupt,
        }
    }

    /// The state restored when this guard is dropped.
    pub fn saved(&self) -> InterruptState {
        self.state
    }
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        self.interrupt.restore(self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn nested_disable_restores_saved_state() {
        let interrupt = Interrupt::new();
        assert!(interrupt.disabled());
        interrupt.enable();
        assert_eq!(interrupt.now(), KERNEL_TICK);

        {
            let outer = InterruptGuard::new(&interrupt);
            assert_eq!(outer.saved(), InterruptState::On);
            {
                let inner = InterruptGuard::new(&interrupt);
                assert_eq!(inner.saved(), InterruptState::Off);
            }
            assert!(interrupt.disabled());
            assert_eq!(interrupt.now(), KERNEL_TICK);
        }
        assert!(interrupt.enabled());
        assert_eq!(interrupt.now(), 2 * KERNEL_TICK);
    }

    #[test]
    fn enabling_twice_is_one_tick() {
        let interrupt = Interrupt::new();
        interrupt.enable();
        interrupt.enable();
        interrupt.restore(InterruptState::On);
        assert_eq!(interrupt.now(), KERNEL_TICK);
    }

    #[test]
    fn pending_interrupts_fire_in_time_order() {
        let interrupt = Arc::new(Interrupt::new());
        let order = Arc::new(SpinLock::new(Vec::new()));
        for (delay, name) in [(30, "b"), (20, "a"), (20, "c"), (100, "late")] {
            let order = order.clone();
            let clock = interrupt.clone();
            interrupt.schedule(delay, "test", move || {
                assert!(clock.disabled());
                order.with(|o| o.push((name, clock.now())));
            });
        }

        for _ in 0..3 {
            interrupt.enable();
            interrupt.disable();
        }
        assert_eq!(
            order.with(|o| o.clone()),
            [("a", 20), ("c", 20), ("b", 30)]
        );
        assert_eq!(interrupt.pending(), 1);
        assert_eq!(interrupt.delivered(), 3);
    }

    #[test]
    fn halted_controller_drops_pending() {
        let interrupt = Interrupt::new();
        interrupt.schedule(10, "test", || panic!("delivered after halt"));
        interrupt.halt();
        interrupt.enable();
        assert_eq!(interrupt.pending(), 0);
        assert_eq!(interrupt.now(), 0);
    }
}
