//! # Mutex.
//!
//! A [`Mutex`] is a [`Lock`] that owns the data it protects. The data is only
//! reachable through the [`MutexGuard`] returned by [`Mutex::lock`], so it can
//! only be touched by the thread that owns the lock.
//!
//! Like the spinlock guard, a [`MutexGuard`] is not released on drop. It must
//! be given back explicitly with [`MutexGuard::unlock`]; dropping a guard
//! that still holds the lock panics.
//!
//! ```
//! # use kthreads::{Kernel, KernelConfig, sync::Mutex};
//! # Kernel::boot(KernelConfig::default().quiet(true), |kernel| {
//! let counter = Mutex::new(kernel, 0);
//! let mut guard = counter.lock();
//! *guard += 1;
//! guard.unlock();
//! # });
//! ```

use super::{Lock, WouldBlock};
use crate::Kernel;
use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::Arc,
};

/// A mutual exclusion primitive useful for protecting shared data.
pub struct Mutex<T> {
    lock: Arc<Lock>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    pub fn new(kernel: &Kernel, t: T) -> Self {
        Self {
            lock: Arc::new(Lock::new(kernel)),
            data: UnsafeCell::new(t),
        }
    }

    /// Acquires the mutex, blocking the current thread until it is able to
    /// do so.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.lock.acquire();
        MutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire the mutex without blocking.
    ///
    /// # Errors
    /// Returns [`WouldBlock`] if the mutex is held.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, WouldBlock> {
        if self.lock.try_acquire() {
            Ok(MutexGuard {
                mutex: self,
                _not_send: PhantomData,
            })
        } else {
            Err(WouldBlock)
        }
    }

    /// The lock underneath, to build a [`Condition`] on.
    ///
    /// [`Condition`]: super::Condition
    pub fn raw_lock(&self) -> &Arc<Lock> {
        &self.lock
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// An RAII implementation of a "scoped lock" of a mutex.
///
/// The lock must be explicitly released by [`unlock`]. Dropping a guard
/// without unlocking panics.
///
/// [`unlock`]: Self::unlock
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: Sync> Sync for MutexGuard<'_, T> {}

impl<T> MutexGuard<'_, T> {
    pub(crate) fn raw_lock(&self) -> &Arc<Lock> {
        &self.mutex.lock
    }

    /// Releases the underlying [`Mutex`].
    pub fn unlock(self) {
        self.mutex.lock.release();
        core::mem::forget(self);
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // An unwinding thread must not touch the scheduler.
        if !std::thread::panicking() {
            panic!("`.unlock()` must be explicitly called before dropping MutexGuard.");
        }
    }
}
