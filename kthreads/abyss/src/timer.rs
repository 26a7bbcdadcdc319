//! Periodic timer device.
//!
//! The timer raises an interrupt every `period` ticks and calls the installed
//! tick handler with the current time. When the machine is configured with a
//! random seed, each period is stretched or shrunk by up to 5%, which changes
//! where preemption lands while keeping a run reproducible.

use crate::{interrupt::Interrupt, spinlock::SpinLock};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::sync::{Arc, Weak};

/// Handler invoked on every timer interrupt with the current time.
pub type TickHandler = Arc<dyn Fn(u64) + Send + Sync>;

/// The timer device.
pub struct Timer {
    interrupt: Arc<Interrupt>,
    period: u64,
    jitter: Option<SpinLock<SmallRng>>,
    handler: SpinLock<Option<TickHandler>>,
}

impl Timer {
    pub(crate) fn new(interrupt: Arc<Interrupt>, period: u64, seed: Option<u64>) -> Arc<Self> {
        assert!(period > 0, "timer period must be positive");
        let timer = Arc::new(Self {
            interrupt,
            period,
            jitter: seed.map(|seed| SpinLock::new(SmallRng::seed_from_u64(seed))),
            handler: SpinLock::new(None),
        });
        Self::arm(&timer);
        timer
    }

    /// Current simulated time, in ticks.
    pub fn now(&self) -> u64 {
        self.interrupt.now()
    }

    /// The nominal period between two timer interrupts.
    pub fn period(&self) -> u64 {
        self.period
    }

    /// Installs the handler called on every timer interrupt.
    ///
    /// The handler runs with interrupts disabled. It replaces any handler
    /// installed before.
    pub fn set_tick_handler(&self, handler: impl Fn(u64) + Send + Sync + 'static) {
        let handler: TickHandler = Arc::new(handler);
        self.handler.with(|slot| *slot = Some(handler));
    }

    fn next_delay(&self) -> u64 {
        match &self.jitter {
            None => self.period,
            Some(rng) => {
                let spread = (self.period / 10).max(1);
                let offset = rng.with(|rng| rng.gen_range(0..spread));
                (self.period - self.period / 20 + offset).max(1)
            }
        }
    }

    fn arm(this: &Arc<Self>) {
        let timer: Weak<Self> = Arc::downgrade(this);
        this.interrupt.schedule(this.next_delay(), "timer", move || {
            if let Some(timer) = timer.upgrade() {
                Timer::fire(&timer);
            }
        });
    }

    fn fire(this: &Arc<Self>) {
        // The next interrupt is armed first: the handler may switch away.
        Self::arm(this);
        let handler = this.handler.with(|slot| slot.clone());
        if let Some(handler) = handler {
            handler(this.now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KERNEL_TICK;

    fn spin(interrupt: &Interrupt, ticks: u64) {
        for _ in 0..ticks / KERNEL_TICK {
            interrupt.enable();
            interrupt.disable();
        }
    }

    #[test]
    fn fires_every_period() {
        let interrupt = Arc::new(Interrupt::new());
        let timer = Timer::new(interrupt.clone(), 100, None);
        assert_eq!(timer.period(), 100);
        let fired = Arc::new(SpinLock::new(Vec::new()));
        let log = fired.clone();
        timer.set_tick_handler(move |now| log.with(|l| l.push(now)));

        spin(&interrupt, 500);
        assert_eq!(fired.with(|l| l.clone()), [100, 200, 300, 400, 500]);
    }

    #[test]
    fn jitter_is_bounded_and_reproducible() {
        let run = |seed| {
            let interrupt = Arc::new(Interrupt::new());
            let timer = Timer::new(interrupt.clone(), 200, Some(seed));
            let fired = Arc::new(SpinLock::new(Vec::new()));
            let log = fired.clone();
            timer.set_tick_handler(move |now| log.with(|l| l.push(now)));
            spin(&interrupt, 4000);
            fired.with(|l| l.clone())
        };

        let first = run(7);
        assert_eq!(first, run(7));
        assert!(first.len() >= 15);
        for pair in first.windows(2) {
            let gap = pair[1] - pair[0];
            assert!((180..=230).contains(&gap), "gap {gap}");
        }
    }
}
