//! # Alarm.
//!
//! The alarm turns the periodic timer interrupt into deadline wakeups.
//! [`Alarm::wait_until`] blocks the caller until a deadline, and on every
//! tick [`Alarm::on_tick`] readies *every* sleeper whose deadline has passed.
//! Wakeups are therefore only as precise as the timer: a sleeper becomes
//! ready on the first tick sampled at or after its deadline, never before.
//!
//! The tick handler finally yields the running thread, which is how the
//! timer preempts threads that never yield on their own.

use crate::{Kernel, thread::Thread};
use abyss::{dprintln, interrupt::InterruptGuard, kprint::DebugFlags, spinlock::SpinLock};
use std::{
    cmp::{Ordering as CmpOrdering, Reverse},
    collections::BinaryHeap,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

struct Sleeper {
    deadline: u64,
    seq: u64,
    thread: Arc<Thread>,
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Sleeper {}

impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sleeper {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Deadline-based sleeping on top of the timer device.
pub struct Alarm {
    kernel: Kernel,
    sleepers: SpinLock<BinaryHeap<Reverse<Sleeper>>>,
    seq: AtomicU64,
}

impl Alarm {
    /// Creates an alarm and installs it as the tick handler of the kernel's
    /// timer.
    pub fn new(kernel: &Kernel) -> Arc<Self> {
        let alarm = Arc::new(Self {
            kernel: kernel.clone(),
            sleepers: SpinLock::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
        });
        let handler: Weak<Self> = Arc::downgrade(&alarm);
        kernel.machine().timer().set_tick_handler(move |now| {
            if let Some(alarm) = handler.upgrade() {
                alarm.on_tick(now);
            }
        });
        alarm
    }

    /// Puts the running thread to sleep for at least `ticks` ticks.
    ///
    /// Returns at once, without leaving the processor, if `ticks` is not
    /// positive.
    pub fn wait_until(&self, ticks: i64) {
        let Ok(ticks) = u64::try_from(ticks) else {
            return;
        };
        if ticks == 0 {
            return;
        }

        let _guard = InterruptGuard::new(self.kernel.interrupt());
        let deadline = self.kernel.now() + ticks;
        let thread = self.kernel.current();
        dprintln!(DebugFlags::ALARM, "{thread} sleeps until {deadline}");
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.sleepers.with(|sleepers| {
            sleepers.push(Reverse(Sleeper {
                deadline,
                seq,
                thread,
            }))
        });
        self.kernel.block();
    }

    /// Handles a timer interrupt at time `now`.
    ///
    /// Readies every sleeper whose deadline is not after `now`, then yields
    /// the running thread.
    pub fn on_tick(&self, now: u64) {
        let _guard = InterruptGuard::new(self.kernel.interrupt());
        self.kernel.timer_interrupt(now);
        while let Some(sleeper) = self.sleepers.with(|sleepers| {
            if sleepers.peek().is_some_and(|Reverse(s)| s.deadline <= now) {
                sleepers.pop().map(|Reverse(s)| s)
            } else {
                None
            }
        }) {
            dprintln!(
                DebugFlags::ALARM,
                "Waking {} (deadline {}) at {now}",
                sleeper.thread,
                sleeper.deadline
            );
            self.kernel.ready(&sleeper.thread);
        }
        self.kernel.yield_now();
    }

    /// Whether some thread sleeps on this alarm.
    pub fn has_sleepers(&self) -> bool {
        self.sleepers.with(|sleepers| !sleepers.is_empty())
    }
}
