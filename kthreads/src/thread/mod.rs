//! Thread abstraction.
//!
//! ## The threading model
//!
//! A [`Thread`] is created in [`ThreadStatus::New`] by [`Kernel::spawn`] and
//! becomes runnable with [`Kernel::start`]. From then on it moves between
//! the states below, driven by the scheduler:
//!
//! ```text
//!  New --start--> Ready --dispatch--> Running --finish--> Finished
//!                   ^                  |   |
//!                   +-------yield------+   |
//!                   |                      |
//!                   +--ready-- Blocked <---+ block
//! ```
//!
//! A finished thread is still executing on its own context while it
//! finishes. Its context is therefore destroyed lazily, by whichever thread
//! runs next.
//!
//! [`ThreadBuilder`] and [`JoinHandle`] wrap spawn, start and join in the
//! familiar shape:
//!
//! ```
//! # use kthreads::{Kernel, KernelConfig, ThreadBuilder};
//! # Kernel::boot(KernelConfig::default().quiet(true), |kernel| {
//! let handle = ThreadBuilder::new("adder").spawn(kernel, || 1 + 1);
//! assert_eq!(handle.join(), Ok(2));
//! # });
//! ```
pub mod scheduler;

use crate::{Kernel, KernelError};
use abyss::{
    dprintln, interrupt::InterruptGuard, kprint::DebugFlags, spinlock::SpinLock, tcb::Tcb,
};
use crossbeam_utils::atomic::AtomicCell;
use std::{fmt, sync::Arc, sync::atomic::Ordering};

/// A possible state of the thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadStatus {
    /// Thread is created but not started.
    New,
    /// Thread waits in the ready queue.
    Ready,
    /// Thread is running.
    Running,
    /// Thread waits for somebody to make it ready.
    Blocked,
    /// Thread has finished.
    Finished,
}

type Action = Box<dyn FnOnce() + Send>;

/// A kernel thread.
pub struct Thread {
    tid: u64,
    name: String,
    status: AtomicCell<ThreadStatus>,
    action: SpinLock<Option<Action>>,
    tcb: SpinLock<Option<Tcb>>,
    joiner: SpinLock<Option<Arc<Thread>>>,
}

impl Thread {
    /// Thread id, unique within its kernel.
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state of the thread.
    pub fn status(&self) -> ThreadStatus {
        self.status.load()
    }

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        self.status.store(status);
    }

    /// Sets the action a [`ThreadStatus::New`] thread runs once started.
    pub fn set_action(&self, action: impl FnOnce() + Send + 'static) {
        assert_eq!(
            self.status(),
            ThreadStatus::New,
            "{self} is already started"
        );
        self.action.with(|slot| *slot = Some(Box::new(action)));
    }

    /// Whether the thread still owns its execution context.
    ///
    /// A finished thread keeps its context until the next thread is
    /// dispatched, which tears it down.
    pub fn has_context(&self) -> bool {
        self.tcb.with(|tcb| tcb.is_some())
    }

    pub(crate) fn tcb(&self) -> Tcb {
        self.tcb
            .with(|tcb| tcb.clone())
            .unwrap_or_else(|| panic!("{self} has no execution context"))
    }
}

impl fmt::Display for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.name, self.tid)
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

/// Observer of scheduling events.
///
/// Every method has an empty default body. The observer is only told what
/// happens; it must not call back into the kernel.
pub trait Observer: Send + Sync {
    /// `th` was put on the ready queue at time `now`.
    fn ready_thread(&self, _th: &Thread, _now: u64) {}
    /// `th` got the processor at time `now`.
    fn running_thread(&self, _th: &Thread, _now: u64) {}
    /// `th` is finishing at time `now`.
    fn finishing_thread(&self, _th: &Thread, _now: u64) {}
    /// `th` is the idle thread.
    fn set_idle_thread(&self, _th: &Thread) {}
    /// A timer interrupt fired at time `now`.
    fn timer_interrupt(&self, _now: u64) {}
}

impl Kernel {
    pub(crate) fn new_thread(&self, name: String, action: Option<Action>, tcb: Tcb) -> Arc<Thread> {
        Arc::new(Thread {
            tid: self.0.next_tid.fetch_add(1, Ordering::SeqCst),
            name,
            status: AtomicCell::new(ThreadStatus::New),
            action: SpinLock::new(action),
            tcb: SpinLock::new(Some(tcb)),
            joiner: SpinLock::new(None),
        })
    }

    /// Creates a thread that will run `action`. The thread does not run
    /// until [`Kernel::start`] is called on it.
    pub fn spawn(
        &self,
        name: impl Into<String>,
        action: impl FnOnce() + Send + 'static,
    ) -> Arc<Thread> {
        let th = self.create(name);
        th.set_action(action);
        th
    }

    /// Creates a thread without an action. See [`Thread::set_action`].
    pub fn create(&self, name: impl Into<String>) -> Arc<Thread> {
        let name = name.into();
        let tcb = self.machine().new_tcb(name.clone());
        self.new_thread(name, None, tcb)
    }

    /// Makes a new thread ready to run.
    ///
    /// Once dispatched, the thread runs its action and then finishes.
    ///
    /// # Panics
    /// Panics if the thread was already started or has no action.
    pub fn start(&self, th: &Arc<Thread>) {
        assert_eq!(
            th.status(),
            ThreadStatus::New,
            "{th} is already started"
        );
        let action = th
            .action
            .with(Option::take)
            .unwrap_or_else(|| panic!("{th} has no action to run"));
        dprintln!(DebugFlags::THREAD, "Forking thread: {th}");

        let _guard = InterruptGuard::new(self.interrupt());
        let kernel = self.clone();
        th.tcb().start(move || kernel.run_thread(action));
        self.ready(th);
    }

    /// Entry of every started thread.
    fn run_thread(&self, action: Action) {
        self.restore_state();
        self.interrupt().enable();
        action();
        self.finish();
    }

    /// The running thread.
    pub fn current(&self) -> Arc<Thread> {
        self.0
            .current
            .with(|current| current.clone())
            .expect("no thread is running")
    }

    /// Relinquishes the processor to the next ready thread, if any.
    ///
    /// The caller goes back to the ready queue and returns once it is
    /// dispatched again.
    pub fn yield_now(&self) {
        let current = self.current();
        assert_eq!(
            current.status(),
            ThreadStatus::Running,
            "{current} yields while not running"
        );
        dprintln!(DebugFlags::THREAD, "Yielding thread: {current}");

        let _guard = InterruptGuard::new(self.interrupt());
        self.ready(&current);
        drop(current);
        self.run_next_thread();
    }

    /// Relinquishes the processor without going back to the ready queue.
    ///
    /// The caller stays blocked until another thread passes it to
    /// [`Kernel::ready`]. Interrupts must be disabled, so that the caller
    /// can register itself somewhere before blocking without racing with
    /// the one who will wake it.
    pub fn block(&self) {
        assert!(
            self.interrupt().disabled(),
            "block() requires interrupts to be disabled"
        );
        let current = self.current();
        dprintln!(DebugFlags::THREAD, "Sleeping thread: {current}");
        if current.status() != ThreadStatus::Finished {
            current.set_status(ThreadStatus::Blocked);
        }
        drop(current);
        self.run_next_thread();
    }

    /// Moves `th` to the ready queue.
    ///
    /// Interrupts must be disabled. The idle thread is marked ready but
    /// never queued; it only runs when the queue is empty.
    pub fn ready(&self, th: &Arc<Thread>) {
        assert!(
            self.interrupt().disabled(),
            "ready() requires interrupts to be disabled"
        );
        assert_ne!(th.status(), ThreadStatus::Ready, "{th} is already ready");
        dprintln!(DebugFlags::THREAD, "Ready thread: {th}");

        th.set_status(ThreadStatus::Ready);
        if !self.is_idle(th) {
            self.0.scheduler.push_to_queue(th.clone());
        }
        if let Some(observer) = self.observer() {
            observer.ready_thread(th, self.now());
        }
    }

    /// Finishes the running thread.
    ///
    /// Its joiner, if any, becomes ready. The context of the finishing
    /// thread is destroyed by the next thread that runs.
    pub fn finish(&self) -> ! {
        let _ = self.interrupt().disable();
        let current = self.current();
        dprintln!(DebugFlags::THREAD, "Finishing thread: {current}");
        if let Some(observer) = self.observer() {
            observer.finishing_thread(&current, self.now());
        }

        self.0.to_be_destroyed.with(|slot| {
            assert!(slot.is_none(), "two threads finish at once");
            *slot = Some(current.clone());
        });
        current.set_status(ThreadStatus::Finished);
        if let Some(joiner) = current.joiner.with(Option::take) {
            self.ready(&joiner);
        }
        drop(current);

        self.block();
        unreachable!("a finished thread was dispatched");
    }

    /// Waits for `th` to finish.
    ///
    /// Returns immediately if `th` already finished.
    ///
    /// # Errors
    /// - [`KernelError::Deadlock`] if `th` is the calling thread.
    /// - [`KernelError::AlreadyJoined`] if another thread already waits for
    ///   `th`. A thread has at most one joiner.
    pub fn join(&self, th: &Arc<Thread>) -> Result<(), KernelError> {
        let current = self.current();
        if Arc::ptr_eq(th, &current) {
            return Err(KernelError::Deadlock);
        }
        dprintln!(DebugFlags::THREAD, "Joining to thread: {th}");

        let _guard = InterruptGuard::new(self.interrupt());
        if th.status() == ThreadStatus::Finished {
            return Ok(());
        }
        th.joiner.with(|joiner| match joiner {
            Some(_) => Err(KernelError::AlreadyJoined),
            None => {
                *joiner = Some(current);
                Ok(())
            }
        })?;
        self.block();
        Ok(())
    }
}

/// Thread factory, which can be used in order to configure the properties of
/// a new thread.
pub struct ThreadBuilder {
    name: String,
}

impl ThreadBuilder {
    /// Create a new [`ThreadBuilder`] which can be used to configure the
    /// properties of a new thread.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Spawns and starts a new thread on `kernel` and returns a
    /// [`JoinHandle`] for it.
    pub fn spawn<T, F>(self, kernel: &Kernel, f: F) -> JoinHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let result = Arc::new(SpinLock::new(None));
        let slot = result.clone();
        let thread = kernel.spawn(self.name, move || {
            let value = f();
            slot.with(|slot| *slot = Some(value));
        });
        kernel.start(&thread);
        JoinHandle {
            kernel: kernel.clone(),
            thread,
            result,
        }
    }
}

/// A handle to join a thread and collect its result.
pub struct JoinHandle<T> {
    kernel: Kernel,
    thread: Arc<Thread>,
    result: Arc<SpinLock<Option<T>>>,
}

impl<T> JoinHandle<T> {
    /// The underlying thread.
    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    /// Waits for the thread to finish and returns its result.
    ///
    /// # Panics
    /// Panics if the thread finished without returning, i.e. by calling
    /// [`Kernel::finish`] itself.
    pub fn join(self) -> Result<T, KernelError> {
        self.kernel.join(&self.thread)?;
        let value = self.result.with(Option::take);
        Ok(value.unwrap_or_else(|| panic!("{} finished without a result", self.thread)))
    }
}
