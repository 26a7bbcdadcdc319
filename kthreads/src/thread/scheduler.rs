//! Thread scheduler
//!
//! The kernel keeps ready threads in a [`Scheduler`], a pluggable ready-queue
//! policy. Dispatching takes the next thread from the policy, or the idle
//! thread when nothing is ready, and switches to it.

use super::{Thread, ThreadStatus};
use crate::Kernel;
use abyss::{dprintln, kprint::DebugFlags};
use crossbeam_queue::SegQueue;
use std::sync::Arc;

/// A trait for a ready-queue policy.
///
/// The [`Scheduler`] trait decides which ready thread runs next. The kernel
/// only calls it with interrupts disabled, and a policy must be
/// deterministic: the same sequence of calls yields the same order.
pub trait Scheduler: Send + Sync {
    /// Pops the next thread to run.
    ///
    /// Returns `None` if no thread is ready.
    fn next_to_run(&self) -> Option<Arc<Thread>>;

    /// Push a thread `th` into scheduling queue.
    fn push_to_queue(&self, th: Arc<Thread>);

    /// Called on every timer interrupt, before the running thread is
    /// preempted.
    fn timer_tick(&self) {}

    /// Number of queued threads.
    fn len(&self) -> usize;

    /// Whether no thread is queued.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A First-in-first-out scheduler.
#[derive(Default)]
pub struct Fifo {
    runqueue: SegQueue<Arc<Thread>>,
}

impl Scheduler for Fifo {
    fn next_to_run(&self) -> Option<Arc<Thread>> {
        self.runqueue.pop()
    }

    fn push_to_queue(&self, th: Arc<Thread>) {
        self.runqueue.push(th);
    }

    fn len(&self) -> usize {
        self.runqueue.len()
    }
}

impl Kernel {
    /// Dispatches the next ready thread, or the idle thread.
    pub(crate) fn run_next_thread(&self) {
        let next = self
            .0
            .scheduler
            .next_to_run()
            .or_else(|| self.0.idle.with(|idle| idle.clone()))
            .expect("nothing to run and no idle thread");
        self.run(next);
    }

    /// Switches the processor to `next`.
    fn run(&self, next: Arc<Thread>) {
        assert!(
            self.interrupt().disabled(),
            "dispatch requires interrupts to be disabled"
        );
        let tcb = next.tcb();
        let prev = self
            .0
            .current
            .with(|current| current.replace(next.clone()))
            .expect("no thread is running");
        dprintln!(DebugFlags::THREAD, "Switching from: {prev} to: {next}");
        drop((prev, next));

        tcb.context_switch();
        self.restore_state();
    }

    /// Finishes a switch on the thread that got the processor.
    pub(crate) fn restore_state(&self) {
        assert!(
            self.interrupt().disabled(),
            "dispatch requires interrupts to be disabled"
        );
        let me = self.current();
        dprintln!(DebugFlags::THREAD, "Running thread: {me}");
        if let Some(observer) = self.observer() {
            observer.running_thread(&me, self.now());
        }
        me.set_status(ThreadStatus::Running);

        if let Some(dead) = self.0.to_be_destroyed.with(Option::take) {
            assert!(!Arc::ptr_eq(&dead, &me), "{me} runs after finishing");
            if let Some(tcb) = dead.tcb.with(Option::take) {
                tcb.destroy();
            }
        }
    }

    pub(crate) fn is_idle(&self, th: &Arc<Thread>) -> bool {
        self.0
            .idle
            .with(|idle| idle.as_ref().is_some_and(|idle| Arc::ptr_eq(idle, th)))
    }

    /// Number of threads in the ready queue.
    pub fn ready_count(&self) -> usize {
        self.0.scheduler.len()
    }

    pub(crate) fn create_idle_thread(&self) {
        let kernel = self.clone();
        let idle = self.spawn("idle", move || kernel.idle());
        self.0.idle.with(|slot| *slot = Some(idle.clone()));
        if let Some(observer) = self.observer() {
            observer.set_idle_thread(&idle);
        }
        self.start(&idle);
    }

    /// Body of the idle thread.
    ///
    /// The idle thread runs only when the ready queue is empty. If no alarm
    /// sleeper is pending either, nothing can ever make a thread ready again.
    fn idle(&self) {
        loop {
            let sleepers = self.0.alarm.with(|alarm| {
                alarm
                    .as_ref()
                    .is_some_and(|alarm| alarm.has_sleepers())
            });
            if self.0.scheduler.is_empty() && !sleepers {
                panic!("deadlock: every thread is blocked and no alarm is pending");
            }
            self.yield_now();
        }
    }

    /// Accounts a timer interrupt before the running thread is preempted.
    pub(crate) fn timer_interrupt(&self, now: u64) {
        self.0.scheduler.timer_tick();
        if let Some(observer) = self.observer() {
            observer.timer_interrupt(now);
        }
    }
}
