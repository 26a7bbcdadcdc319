//! The machine.
//!
//! [`Machine`] bundles the devices of one simulated processor. Several
//! machines may run side by side in one process; they share nothing but the
//! console device, and each keeps its own [`Console`] settings.

use crate::{
    TIMER_TICKS, info,
    interrupt::Interrupt,
    kprint::{Console, DebugFlags},
    tcb::{Cpu, Tcb},
    timer::Timer,
};
use std::{fmt, sync::Arc};

/// Configuration of a [`Machine`].
#[derive(Clone, Debug)]
pub struct MachineConfig {
    /// Nominal period of the timer device, in ticks.
    pub timer_period: u64,
    /// Seed for the timer jitter. `None` keeps the period exact.
    pub random_seed: Option<u64>,
    /// Suppress informational console output.
    pub quiet: bool,
    /// Categories of debug tracing to print.
    pub debug: DebugFlags,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            timer_period: TIMER_TICKS,
            random_seed: None,
            quiet: false,
            debug: DebugFlags::empty(),
        }
    }
}

/// Counters of a machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Simulated time, in ticks.
    pub ticks: u64,
    /// Interrupts delivered.
    pub interrupts: u64,
    /// Switches between two distinct contexts.
    pub context_switches: u64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ticks: total {}, interrupts {}, context switches {}",
            self.ticks, self.interrupts, self.context_switches
        )
    }
}

/// A handle to a simulated single-processor machine.
#[derive(Clone)]
pub struct Machine {
    interrupt: Arc<Interrupt>,
    timer: Arc<Timer>,
    cpu: Arc<Cpu>,
}

impl Machine {
    /// Powers on a machine. Interrupts start disabled.
    pub fn new(config: &MachineConfig) -> Self {
        let interrupt = Arc::new(Interrupt::new());
        let timer = Timer::new(interrupt.clone(), config.timer_period, config.random_seed);
        let console = Arc::new(Console::new(config.quiet, config.debug));
        let cpu = Arc::new(Cpu::new(interrupt.clone(), console));
        Self {
            interrupt,
            timer,
            cpu,
        }
    }

    /// The interrupt controller.
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// The timer device.
    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// Creates a context that runs nothing until it is started.
    pub fn new_tcb(&self, name: impl Into<String>) -> Tcb {
        Tcb::new(&self.cpu, name.into())
    }

    /// Makes the calling host thread the root context of this machine.
    ///
    /// The host thread takes the machine's console settings. The root context holds the processor on return. Panics raised in
    /// other contexts are re-raised in the root context.
    pub fn adopt_current(&self, name: impl Into<String>) -> Tcb {
        Tcb::adopt(&self.cpu, name.into())
    }

    /// Whether the machine was halted.
    pub fn is_halted(&self) -> bool {
        self.cpu.is_halted()
    }

    /// Snapshot of the machine counters.
    pub fn stats(&self) -> Stats {
        Stats {
            ticks: self.interrupt.now(),
            interrupts: self.interrupt.delivered(),
            context_switches: self.cpu.context_switches(),
        }
    }

    /// Halts the machine.
    ///
    /// Interrupts are no longer delivered and every context except the
    /// calling one is destroyed. Halting twice is harmless.
    pub fn halt(&self) {
        let first = !self.is_halted();
        self.cpu.halt();
        if first {
            info!("Machine halting!");
            info!("{}", self.stats());
        }
    }
}
