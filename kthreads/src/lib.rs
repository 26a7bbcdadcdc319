//! # kthreads
//!
//! A single-processor kernel-thread runtime and the blocking synchronization
//! primitives built on top of it.
//!
//! ## The threading model
//!
//! A booted [`Kernel`] owns a ready queue, the notion of the current thread,
//! and an idle thread. Exactly one [`Thread`] runs at any instant. A thread
//! runs until it yields, blocks, finishes, or is preempted by the periodic
//! timer. Everything that changes scheduler state does so with interrupts
//! disabled, so a timer interrupt never observes a half-updated structure.
//!
//! On top of the scheduler sit
//! - the [`alarm`], which turns timer ticks into deadline wakeups,
//! - [`sync`]: a [`Lock`], a [`Condition`] variable and a data-carrying
//!   [`Mutex`],
//! - a zero-buffer rendezvous [`channel`],
//! - the [`ferry`], a multi-agent crossing problem that exercises all of the
//!   above.
//!
//! ## Booting
//!
//! ```
//! use kthreads::{Kernel, KernelConfig, ThreadBuilder};
//!
//! let answer = Kernel::boot(KernelConfig::default().quiet(true), |kernel| {
//!     let handle = ThreadBuilder::new("worker").spawn(kernel, || 6 * 7);
//!     handle.join().unwrap()
//! });
//! assert_eq!(answer, 42);
//! ```
//!
//! The kernel is an ordinary value: every primitive is created from a
//! [`Kernel`] handle, and independent kernels may run side by side.
//!
//! [`Lock`]: sync::Lock
//! [`Condition`]: sync::Condition
//! [`Mutex`]: sync::Mutex

pub mod alarm;
pub mod channel;
pub mod ferry;
pub mod sync;
pub mod thread;

pub use abyss::kprint::DebugFlags;
pub use thread::{
    JoinHandle, Observer, Thread, ThreadBuilder, ThreadStatus,
    scheduler::{Fifo, Scheduler},
};

use abyss::{
    info,
    interrupt::Interrupt,
    machine::{Machine, MachineConfig, Stats},
    spinlock::SpinLock,
    warning,
};
use alarm::Alarm;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::AtomicU64,
    },
};

/// Represents errors that can occur in the kernel.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum KernelError {
    /// Device or resource busy. (EBUSY)
    ///
    /// The thread already has a joiner.
    AlreadyJoined = -16,
    /// Invalid arguement. (EINVAL)
    InvalidArgument = -22,
    /// Resource deadlock would occur. (EDEADLK)
    ///
    /// A thread tried to join itself.
    Deadlock = -35,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::AlreadyJoined => write!(f, "thread already has a joiner"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::Deadlock => write!(f, "resource deadlock would occur"),
        }
    }
}

impl std::error::Error for KernelError {}

/// Builder of a kernel configuration.
///
/// ```
/// use kthreads::{Fifo, KernelConfig};
///
/// let config = KernelConfig::default()
///     .set_scheduler(Fifo::default())
///     .timer_period(200)
///     .random_seed(7)
///     .debug("ta");
/// ```
pub struct KernelConfig {
    scheduler: Box<dyn Scheduler>,
    machine: MachineConfig,
    observer: Option<Arc<dyn Observer>>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            scheduler: Box::new(Fifo::default()),
            machine: MachineConfig::default(),
            observer: None,
        }
    }
}

impl KernelConfig {
    /// Set the ready-queue policy of the kernel.
    pub fn set_scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Box::new(scheduler);
        self
    }

    /// Set the period of the timer device, in ticks.
    pub fn timer_period(mut self, ticks: u64) -> Self {
        self.machine.timer_period = ticks;
        self
    }

    /// Jitter the timer with a seeded generator.
    ///
    /// Different seeds move preemption points around; a given seed always
    /// reproduces the same run.
    pub fn random_seed(mut self, seed: u64) -> Self {
        self.machine.random_seed = Some(seed);
        self
    }

    /// Install an observer of scheduling events.
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Enable debug categories from a string of letters, such as `"ta"`.
    pub fn debug(mut self, letters: &str) -> Self {
        self.machine.debug = DebugFlags::from_letters(letters);
        self
    }

    /// Suppress informational console output.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.machine.quiet = quiet;
        self
    }
}

/// A handle to a booted kernel.
///
/// Cloning the handle is cheap; all clones refer to the same kernel.
#[derive(Clone)]
pub struct Kernel(Arc<KernelInner>);

pub(crate) struct KernelInner {
    machine: Machine,
    scheduler: Box<dyn Scheduler>,
    observer: Option<Arc<dyn Observer>>,
    current: SpinLock<Option<Arc<Thread>>>,
    idle: SpinLock<Option<Arc<Thread>>>,
    to_be_destroyed: SpinLock<Option<Arc<Thread>>>,
    alarm: SpinLock<Option<Arc<Alarm>>>,
    next_tid: AtomicU64,
}

/// Terminates the kernel when the boot scope is left, even by a panic.
struct Terminator<'a>(&'a Kernel);

impl Drop for Terminator<'_> {
    fn drop(&mut self) {
        self.0.terminate();
    }
}

impl Kernel {
    /// Boots a kernel, runs `main` on its main thread, then shuts it down.
    ///
    /// The calling host thread becomes the kernel's `main` thread. When
    /// `main` returns, the machine halts and every other thread is torn
    /// down, whatever its state. A panic in any kernel thread halts the
    /// machine and is re-raised from this call.
    pub fn boot<R>(config: KernelConfig, main: impl FnOnce(&Kernel) -> R) -> R {
        let KernelConfig {
            scheduler,
            machine,
            observer,
        } = config;
        let machine = Machine::new(&machine);
        let main_tcb = machine.adopt_current("main");
        let kernel = Kernel(Arc::new(KernelInner {
            machine,
            scheduler,
            observer,
            current: SpinLock::new(None),
            idle: SpinLock::new(None),
            to_be_destroyed: SpinLock::new(None),
            alarm: SpinLock::new(None),
            next_tid: AtomicU64::new(0),
        }));
        let _terminator = Terminator(&kernel);

        let main_thread = kernel.new_thread("main".into(), None, main_tcb);
        main_thread.set_status(ThreadStatus::Running);
        kernel.0.current.with(|current| *current = Some(main_thread));

        let alarm = Alarm::new(&kernel);
        kernel.0.alarm.with(|slot| *slot = Some(alarm));
        kernel.create_idle_thread();

        kernel.interrupt().enable();
        info!("Kernel booted.");
        main(&kernel)
    }

    /// Halts the machine and releases every scheduler structure.
    fn terminate(&self) {
        let _ = self.interrupt().disable();
        self.0.machine.halt();

        let alarm = self.0.alarm.with(Option::take);
        let idle = self.0.idle.with(Option::take);
        let dead = self.0.to_be_destroyed.with(Option::take);
        let current = self.0.current.with(Option::take);
        let mut stranded = 0;
        while self.0.scheduler.next_to_run().is_some() {
            stranded += 1;
        }
        if stranded > 0 {
            warning!("{stranded} ready threads never ran again");
        }
        drop((alarm, idle, dead, current));
    }

    /// The interrupt controller of the kernel's machine.
    pub fn interrupt(&self) -> &Interrupt {
        self.0.machine.interrupt()
    }

    /// Current simulated time, in ticks.
    pub fn now(&self) -> u64 {
        self.0.machine.timer().now()
    }

    /// Counters of the kernel's machine.
    pub fn stats(&self) -> Stats {
        self.0.machine.stats()
    }

    /// The alarm of this kernel.
    pub fn alarm(&self) -> Arc<Alarm> {
        self.0
            .alarm
            .with(|alarm| alarm.clone())
            .expect("kernel is terminated")
    }

    pub(crate) fn machine(&self) -> &Machine {
        &self.0.machine
    }

    pub(crate) fn observer(&self) -> Option<&dyn Observer> {
        self.0.observer.as_deref()
    }
}
