//! # Abyss: the machine underneath the kernel.
//!
//! Abyss simulates the single-processor machine that the kernel threads run
//! on. It provides the pieces a kernel normally receives from hardware:
//!
//! - an [`interrupt`] controller with a simulated clock,
//! - a periodic [`timer`] device,
//! - execution contexts ([`tcb`]) that can be started, switched into and
//!   destroyed,
//! - console output ([`kprint`]) and a [`spinlock`] for short critical
//!   sections.
//!
//! The kernel never inspects the internals of these devices. It only talks to
//! them through the [`Machine`] handle.
//!
//! [`Machine`]: machine::Machine

pub mod interrupt;
pub mod kprint;
pub mod machine;
pub mod spinlock;
pub mod tcb;
pub mod timer;

/// Ticks the clock advances every time interrupts are re-enabled.
pub const KERNEL_TICK: u64 = 10;

/// Default period of the timer device, in ticks.
pub const TIMER_TICKS: u64 = 500;
