//! # Condition Variable.
//!
//! A **Condition Variable** allows a thread to efficiently block until a
//! certain condition is met, without consuming CPU cycles. It is always used
//! in conjunction with the [`Lock`] that guards the shared data the
//! condition is about, and every operation requires the caller to hold that
//! lock.
//!
//! [`Condition::sleep`] puts the caller on the wait set *before* it releases
//! the lock, with interrupts disabled throughout. A waker that takes the lock
//! next is therefore guaranteed to find the sleeper on the wait set; no wake
//! can slip in between.
//!
//! A woken thread only learns that the state *may* have changed. Callers
//! re-check their predicate in a loop, which [`Condition::wait_while`] does
//! for a [`Mutex`]:
//!
//! ```
//! # use std::sync::Arc;
//! # use kthreads::{Kernel, KernelConfig, ThreadBuilder, sync::{Condition, Mutex}};
//! # Kernel::boot(KernelConfig::default().quiet(true), |kernel| {
//! let ready = Arc::new(Mutex::new(kernel, false));
//! let cond = Arc::new(Condition::new(ready.raw_lock()));
//!
//! let (r, c) = (ready.clone(), cond.clone());
//! let waiter = ThreadBuilder::new("waiter").spawn(kernel, move || {
//!     let guard = c.wait_while(r.lock(), |ready| !*ready);
//!     guard.unlock();
//! });
//!
//! let mut guard = ready.lock();
//! *guard = true;
//! cond.wake();
//! guard.unlock();
//! waiter.join().unwrap();
//! # });
//! ```
//!
//! [`Mutex`]: super::Mutex

use super::{Lock, MutexGuard};
use crate::thread::Thread;
use abyss::{dprintln, interrupt::InterruptGuard, kprint::DebugFlags, spinlock::SpinLock};
use std::{collections::VecDeque, sync::Arc};

/// A condition variable bound to one [`Lock`].
pub struct Condition {
    lock: Arc<Lock>,
    waiters: SpinLock<VecDeque<Arc<Thread>>>,
}

impl Condition {
    /// Creates a condition variable associated with `lock`.
    pub fn new(lock: &Arc<Lock>) -> Self {
        Self {
            lock: lock.clone(),
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// The lock this condition is associated with.
    pub fn lock(&self) -> &Arc<Lock> {
        &self.lock
    }

    fn assert_held(&self, op: &str) {
        assert!(
            self.lock.is_held_by_current_thread(),
            "{op} on a condition variable without holding its lock"
        );
    }

    /// Atomically releases the lock and blocks until woken, then reacquires
    /// the lock before returning.
    ///
    /// # Panics
    /// Panics if the running thread does not hold the associated lock.
    pub fn sleep(&self) {
        self.assert_held("sleep");
        let kernel = self.lock.kernel();
        let current = kernel.current();
        dprintln!(DebugFlags::SYNC, "{current} sleeps on a condition");

        let guard = InterruptGuard::new(kernel.interrupt());
        self.waiters.with(|waiters| waiters.push_back(current));
        self.lock.release();
        kernel.block();
        drop(guard);

        self.lock.acquire();
    }

    /// Readies one sleeping thread, if any.
    ///
    /// # Panics
    /// Panics if the running thread does not hold the associated lock.
    pub fn wake(&self) {
        self.assert_held("wake");
        let kernel = self.lock.kernel();
        let _guard = InterruptGuard::new(kernel.interrupt());
        if let Some(waiter) = self.waiters.with(VecDeque::pop_front) {
            dprintln!(DebugFlags::SYNC, "Waking {waiter}");
            kernel.ready(&waiter);
        }
    }

    /// Readies every sleeping thread.
    ///
    /// # Panics
    /// Panics if the running thread does not hold the associated lock.
    pub fn wake_all(&self) {
        self.assert_held("wake_all");
        let kernel = self.lock.kernel();
        let _guard = InterruptGuard::new(kernel.interrupt());
        let waiters = self.waiters.with(core::mem::take);
        for waiter in waiters {
            dprintln!(DebugFlags::SYNC, "Waking {waiter}");
            kernel.ready(&waiter);
        }
    }

    /// Sleeps once, with the mutex of `guard` as the associated lock.
    ///
    /// # Panics
    /// Panics if `guard` does not belong to the associated lock.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        assert!(
            Arc::ptr_eq(guard.raw_lock(), &self.lock),
            "condition variable used with a foreign mutex"
        );
        self.sleep();
        guard
    }

    /// Blocks the current thread while `predicate` returns `true`.
    ///
    /// The predicate is checked with the mutex held, before the first sleep
    /// and after every wakeup. The returned guard holds the mutex and the
    /// predicate is `false` for its data.
    pub fn wait_while<'a, T>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut predicate: impl FnMut(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        while predicate(&mut guard) {
            guard = self.wait(guard);
        }
        guard
    }
}
