//! # Synchronization primitives.
//!
//! Threads that share data must coordinate. This module provides blocking
//! primitives built directly on the scheduler: a waiting thread leaves the
//! processor and is made ready again by the thread that changes the state it
//! waits for. Nothing here busy-waits.
//!
//! - [`Lock`]: mutual exclusion with an owner. Only the owner may release it.
//! - [`Mutex`]: a [`Lock`] that owns the data it protects.
//! - [`Condition`]: waits for a predicate over the data guarded by a
//!   [`Lock`].
//!
//! Every primitive keeps its own bookkeeping consistent by disabling
//! interrupts around it, so a timer interrupt can never preempt a thread
//! halfway through enqueueing itself on a wait set.
//!
//! ## Misuse
//!
//! Releasing a lock one does not own, re-acquiring a lock one already owns,
//! or using a condition variable without holding its lock are programming
//! errors and panic. A panic in any kernel thread halts the whole kernel.

pub mod condition;
pub mod lock;
pub mod mutex;

pub use abyss::spinlock::{SpinLock, SpinLockGuard, WouldBlock};
pub use condition::Condition;
pub use lock::Lock;
pub use mutex::{Mutex, MutexGuard};
