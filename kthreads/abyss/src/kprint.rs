//! Kernel print utilities.
//!
//! Every line goes to the host's standard error, which the test harness
//! captures per test. Besides the plain [`print!`] family, each machine keeps
//! its own [`Console`] settings: whether informational messages are
//! suppressed and which [`DebugFlags`] are enabled. [`dprintln!`] only prints
//! when its category is enabled, which keeps traces of one subsystem readable.
//!
//! The settings follow the host thread. Every context of a machine is
//! attached to the machine's console when it starts, so machines running
//! side by side never see each other's settings. A host thread that belongs
//! to no machine prints everything but debug traces.

use crate::spinlock::SpinLock;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::{cell::RefCell, sync::Arc};

static CONSOLE: SpinLock<()> = SpinLock::new(());

thread_local! {
    static SETTINGS: RefCell<Option<Arc<Console>>> = const { RefCell::new(None) };
}

bitflags::bitflags! {
    /// Categories of debug tracing.
    pub struct DebugFlags: u32 {
        /// Thread life cycle and context switches (`t`).
        const THREAD = 1 << 0;
        /// Interrupt delivery and the simulated clock (`i`).
        const INTERRUPT = 1 << 1;
        /// Alarm sleepers and timer ticks (`a`).
        const ALARM = 1 << 2;
        /// Locks and condition variables (`s`).
        const SYNC = 1 << 3;
        /// Rendezvous channels (`c`).
        const CHANNEL = 1 << 4;
        /// Ferry crossings (`f`).
        const FERRY = 1 << 5;
    }
}

impl DebugFlags {
    /// Parses a string of category letters, such as `"ta"`.
    ///
    /// `+` enables every category. Unknown letters are ignored.
    pub fn from_letters(letters: &str) -> Self {
        letters.chars().fold(Self::empty(), |flags, c| {
            flags
                | match c {
                    '+' => Self::all(),
                    't' => Self::THREAD,
                    'i' => Self::INTERRUPT,
                    'a' => Self::ALARM,
                    's' => Self::SYNC,
                    'c' => Self::CHANNEL,
                    'f' => Self::FERRY,
                    _ => Self::empty(),
                }
        })
    }
}

/// Console settings of one machine.
#[derive(Debug)]
pub struct Console {
    quiet: AtomicBool,
    debug: AtomicU32,
}

impl Console {
    /// Creates the settings. `quiet` suppresses informational messages.
    pub fn new(quiet: bool, debug: DebugFlags) -> Self {
        Self {
            quiet: AtomicBool::new(quiet),
            debug: AtomicU32::new(debug.bits()),
        }
    }

    /// Whether informational messages are suppressed.
    pub fn is_quiet(&self) -> bool {
        self.quiet.load(Ordering::SeqCst)
    }

    /// Categories printed by [`dprintln!`].
    pub fn debug_flags(&self) -> DebugFlags {
        DebugFlags::from_bits_truncate(self.debug.load(Ordering::SeqCst))
    }
}

/// Makes `console` the settings of the calling host thread.
pub(crate) fn attach(console: Arc<Console>) {
    SETTINGS.with(|settings| *settings.borrow_mut() = Some(console));
}

/// Whether the calling host thread suppresses informational messages.
pub fn is_quiet() -> bool {
    SETTINGS.with(|settings| settings.borrow().as_ref().is_some_and(|c| c.is_quiet()))
}

/// Whether any category in `flags` is enabled for the calling host thread.
pub fn debug_enabled(flags: DebugFlags) -> bool {
    SETTINGS.with(|settings| {
        settings
            .borrow()
            .as_ref()
            .is_some_and(|c| c.debug_flags().intersects(flags))
    })
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    let guard = CONSOLE.lock();
    eprint!("{fmt}");
    guard.unlock();
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the console.
/// This first holds the lock for console device.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the console.
/// This first holds the lock for console device.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    () => (if !$crate::kprint::is_quiet() { $crate::print!("[INFO]\n") });
    ($($arg:tt)*) => (if !$crate::kprint::is_quiet() { $crate::print!("[INFO] {}\n", format_args!($($arg)*)) });
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    () => (if !$crate::kprint::is_quiet() { $crate::print!("[WARN]\n") });
    ($($arg:tt)*) => (if !$crate::kprint::is_quiet() { $crate::print!("[WARN] {}\n", format_args!($($arg)*)) });
}

/// Display a debug message of a category.
///
/// The message is printed only when the category is enabled in the
/// [`Console`] of the calling context.
///
/// ```
/// use abyss::{dprintln, kprint::DebugFlags};
///
/// dprintln!(DebugFlags::THREAD, "Forking thread: {}", "main");
/// ```
#[macro_export]
macro_rules! dprintln {
    ($flags:expr, $($arg:tt)*) => (if $crate::kprint::debug_enabled($flags) { $crate::print!("[{:?}] {}\n", $flags, format_args!($($arg)*)) });
}
