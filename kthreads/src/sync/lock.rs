//! Lock.
//!
//! A [`Lock`] has at most one owner. Threads that find it owned join its
//! wait set and block. Releasing the lock readies the first waiter, but does
//! not hand ownership over: the waiter tries again once it runs, and whoever
//! the ready queue dispatches first takes the lock.

use crate::{Kernel, thread::Thread};
use abyss::{dprintln, interrupt::InterruptGuard, kprint::DebugFlags, spinlock::SpinLock};
use std::{collections::VecDeque, sync::Arc};

/// A mutual exclusion lock with an owning thread.
pub struct Lock {
    kernel: Kernel,
    owner: SpinLock<Option<Arc<Thread>>>,
    waiters: SpinLock<VecDeque<Arc<Thread>>>,
}

impl Lock {
    /// Creates an unowned lock.
    pub fn new(kernel: &Kernel) -> Self {
        Self {
            kernel: kernel.clone(),
            owner: SpinLock::new(None),
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    pub(crate) fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    fn is_owned_by(&self, th: &Arc<Thread>) -> bool {
        self.owner
            .with(|owner| owner.as_ref().is_some_and(|owner| Arc::ptr_eq(owner, th)))
    }

    /// Acquires the lock, blocking until it is free.
    ///
    /// # Panics
    /// Panics if the running thread already owns the lock.
    pub fn acquire(&self) {
        let current = self.kernel.current();
        let _guard = InterruptGuard::new(self.kernel.interrupt());
        assert!(
            !self.is_owned_by(&current),
            "{current} acquires a lock it already holds"
        );

        while self.owner.with(|owner| owner.is_some()) {
            dprintln!(DebugFlags::SYNC, "{current} waits for a lock");
            self.waiters.with(|waiters| waiters.push_back(current.clone()));
            self.kernel.block();
        }
        self.owner.with(|owner| *owner = Some(current));
    }

    /// Acquires the lock if it is free. Never blocks.
    pub fn try_acquire(&self) -> bool {
        let current = self.kernel.current();
        let _guard = InterruptGuard::new(self.kernel.interrupt());
        self.owner.with(|owner| match owner {
            Some(_) => false,
            None => {
                *owner = Some(current);
                true
            }
        })
    }

    /// Releases the lock and readies the first waiter, if any.
    ///
    /// # Panics
    /// Panics if the running thread does not own the lock.
    pub fn release(&self) {
        let current = self.kernel.current();
        let _guard = InterruptGuard::new(self.kernel.interrupt());
        assert!(
            self.is_owned_by(&current),
            "{current} releases a lock it does not hold"
        );

        self.owner.with(|owner| *owner = None);
        if let Some(waiter) = self.waiters.with(VecDeque::pop_front) {
            self.kernel.ready(&waiter);
        }
    }

    /// Whether the running thread owns the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.is_owned_by(&self.kernel.current())
    }
}
