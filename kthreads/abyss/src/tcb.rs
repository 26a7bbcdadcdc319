//! Execution contexts.
//!
//! Every context is backed by a host thread, and exactly one context holds
//! the processor at a time. Holding the processor is modelled as a baton:
//! [`Tcb::context_switch`] hands the baton to the target context and parks
//! the caller until somebody hands it back. Kernel code therefore observes
//! the usual single-processor contract, one logical thread executing at any
//! instant with explicit switch points, while the host scheduler only ever
//! sees one runnable thread per machine.
//!
//! ## Teardown
//!
//! [`Tcb::destroy`] takes the baton away for good. The parked host thread
//! wakes up, unwinds out of its kernel frames without executing any kernel
//! logic, and is joined.
//!
//! ## Faults
//!
//! A panic that escapes a context started with [`Tcb::start`] faults the
//! machine: the machine halts and the root context, the one adopted by
//! [`Machine::adopt_current`], resumes only to re-raise that panic. A failed
//! assertion anywhere in the kernel thus surfaces in the thread that booted
//! the machine.
//!
//! [`Machine::adopt_current`]: crate::machine::Machine::adopt_current

use crate::{
    dprintln,
    interrupt::Interrupt,
    kprint::{self, Console, DebugFlags},
    spinlock::SpinLock,
};
use crossbeam_utils::sync::{Parker, Unparker};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    thread::JoinHandle,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum Baton {
    Parked = 0,
    Running = 1,
    Destroyed = 2,
}

/// Unwinding payload of a context that is being torn down.
struct Teardown;

thread_local! {
    static PARKER: RefCell<Option<Parker>> = const { RefCell::new(None) };
    static TORN_DOWN: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling host thread belongs to a context that is being torn
/// down.
///
/// Such a context no longer owns the processor and must not touch machine
/// state while it unwinds.
pub fn is_torn_down() -> bool {
    TORN_DOWN.with(Cell::get)
}

struct Context {
    id: u64,
    name: String,
    baton: AtomicU8,
    unparker: SpinLock<Option<Unparker>>,
    host: SpinLock<Option<JoinHandle<()>>>,
}

impl Context {
    fn baton(&self) -> Baton {
        Baton::try_from(self.baton.load(Ordering::SeqCst)).unwrap_or(Baton::Destroyed)
    }

    fn pass(&self, baton: Baton) {
        self.baton.store(baton.into(), Ordering::SeqCst);
        if baton != Baton::Parked {
            self.unparker.with(|unparker| {
                if let Some(unparker) = unparker.as_ref() {
                    unparker.unpark();
                }
            });
        }
    }

    /// Parks the calling host thread until this context holds the baton or
    /// is destroyed.
    fn wait(&self) -> Baton {
        PARKER.with(|parker| {
            let parker = parker.borrow();
            let parker = parker
                .as_ref()
                .expect("host thread does not back an execution context");
            loop {
                match self.baton() {
                    Baton::Parked => parker.park(),
                    baton => return baton,
                }
            }
        })
    }

    fn teardown(&self) {
        dprintln!(DebugFlags::THREAD, "Destroying context {}", self.name);
        self.pass(Baton::Destroyed);
        let host = self.host.with(Option::take);
        if let Some(host) = host {
            let _ = host.join();
        }
    }
}

/// The processor shared by the contexts of one machine.
pub(crate) struct Cpu {
    interrupt: Arc<Interrupt>,
    console: Arc<Console>,
    current: SpinLock<Option<Arc<Context>>>,
    root: SpinLock<Option<Arc<Context>>>,
    fault: SpinLock<Option<Box<dyn Any + Send>>>,
    started: SpinLock<BTreeMap<u64, Arc<Context>>>,
    next_id: AtomicU64,
    switches: AtomicU64,
    halted: AtomicBool,
}

impl Cpu {
    pub(crate) fn new(interrupt: Arc<Interrupt>, console: Arc<Console>) -> Self {
        Self {
            interrupt,
            console,
            current: SpinLock::new(None),
            root: SpinLock::new(None),
            fault: SpinLock::new(None),
            started: SpinLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            switches: AtomicU64::new(0),
            halted: AtomicBool::new(false),
        }
    }

    pub(crate) fn context_switches(&self) -> u64 {
        self.switches.load(Ordering::SeqCst)
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn new_context(&self, name: String) -> Arc<Context> {
        Arc::new(Context {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            name,
            baton: AtomicU8::new(Baton::Parked.into()),
            unparker: SpinLock::new(None),
            host: SpinLock::new(None),
        })
    }

    /// Records the panic of a context and hands the processor to the root.
    fn fault(&self, ctx: &Context, payload: Box<dyn Any + Send>) {
        dprintln!(DebugFlags::THREAD, "Context {} faulted", ctx.name);
        self.halted.store(true, Ordering::SeqCst);
        self.interrupt.halt();
        self.fault.with(|fault| {
            if fault.is_none() {
                *fault = Some(payload);
            }
        });
        let root = self.root.with(|root| root.clone());
        if let Some(root) = root {
            self.current.with(|current| *current = Some(root.clone()));
            root.pass(Baton::Running);
        }
    }

    /// Destroys every context but the current one.
    pub(crate) fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.interrupt.halt();
        let current = self
            .current
            .with(|current| current.as_ref().map(|ctx| ctx.id));
        let victims: Vec<_> = self.started.with(|started| {
            let ids: Vec<u64> = started
                .keys()
                .copied()
                .filter(|id| Some(*id) != current)
                .collect();
            ids.iter().filter_map(|id| started.remove(id)).collect()
        });
        for victim in victims {
            victim.teardown();
        }
    }
}

/// A handle to an execution context.
#[derive(Clone)]
pub struct Tcb {
    ctx: Arc<Context>,
    cpu: Arc<Cpu>,
}

impl Tcb {
    pub(crate) fn new(cpu: &Arc<Cpu>, name: String) -> Self {
        Self {
            ctx: cpu.new_context(name),
            cpu: cpu.clone(),
        }
    }

    /// Turns the calling host thread into the running root context.
    pub(crate) fn adopt(cpu: &Arc<Cpu>, name: String) -> Self {
        let tcb = Self::new(cpu, name);
        let parker = Parker::new();
        tcb.ctx.unparker.with(|u| *u = Some(parker.unparker().clone()));
        tcb.ctx.baton.store(Baton::Running.into(), Ordering::SeqCst);
        PARKER.with(|slot| *slot.borrow_mut() = Some(parker));
        TORN_DOWN.with(|torn| torn.set(false));
        kprint::attach(cpu.console.clone());
        cpu.root.with(|root| *root = Some(tcb.ctx.clone()));
        cpu.current.with(|current| *current = Some(tcb.ctx.clone()));
        tcb
    }

    /// Name given to the context on creation.
    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    /// Whether this context holds the processor.
    pub fn is_current(&self) -> bool {
        self.cpu
            .current
            .with(|current| current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &self.ctx)))
    }

    /// Prepares the context to run `entry` the first time it is switched
    /// into.
    ///
    /// `entry` must never return: a context that runs off the end of its
    /// entry faults the machine.
    pub fn start(&self, entry: impl FnOnce() + Send + 'static) {
        let parker = Parker::new();
        let installed = self.ctx.unparker.with(|unparker| {
            if unparker.is_some() {
                false
            } else {
                *unparker = Some(parker.unparker().clone());
                true
            }
        });
        assert!(installed, "context {} is already started", self.ctx.name);

        let ctx = self.ctx.clone();
        let cpu = self.cpu.clone();
        let host = std::thread::Builder::new()
            .name(self.ctx.name.clone())
            .spawn(move || host_main(ctx, cpu, parker, entry))
            .unwrap_or_else(|e| panic!("cannot back context {}: {e}", self.ctx.name));
        self.ctx.host.with(|slot| *slot = Some(host));
        self.cpu
            .started
            .with(|started| started.insert(self.ctx.id, self.ctx.clone()));
    }

    /// Switches the processor from the current context to this one.
    ///
    /// Returns when some context switches back to the caller. Switching to
    /// the current context does nothing.
    pub fn context_switch(&self) {
        let prev = self
            .cpu
            .current
            .with(|current| current.replace(self.ctx.clone()))
            .expect("no context holds the processor");
        if Arc::ptr_eq(&prev, &self.ctx) {
            return;
        }
        assert!(
            self.ctx.unparker.with(|u| u.is_some()),
            "context {} was never started",
            self.ctx.name
        );
        self.cpu.switches.fetch_add(1, Ordering::SeqCst);

        prev.pass(Baton::Parked);
        self.ctx.pass(Baton::Running);
        match prev.wait() {
            Baton::Destroyed => {
                TORN_DOWN.with(|torn| torn.set(true));
                panic::resume_unwind(Box::new(Teardown));
            }
            _ => {
                if let Some(payload) = self.cpu.fault.with(Option::take) {
                    panic::resume_unwind(payload);
                }
            }
        }
    }

    /// Destroys this context.
    ///
    /// The context must not hold the processor.
    pub fn destroy(&self) {
        assert!(
            !self.is_current(),
            "context {} cannot destroy itself",
            self.ctx.name
        );
        self.cpu.started.with(|started| started.remove(&self.ctx.id));
        self.ctx.teardown();
    }
}

fn host_main(ctx: Arc<Context>, cpu: Arc<Cpu>, parker: Parker, entry: impl FnOnce()) {
    PARKER.with(|slot| *slot.borrow_mut() = Some(parker));
    kprint::attach(cpu.console.clone());
    if ctx.wait() == Baton::Destroyed {
        return;
    }
    let payload: Box<dyn Any + Send> = match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(()) => Box::new(format!("context {} returned from its entry", ctx.name)),
        Err(payload) if payload.is::<Teardown>() => return,
        Err(payload) => payload,
    };
    cpu.fault(&ctx, payload);
}

#[cfg(test)]
mod tests {
    use crate::{
        machine::{Machine, MachineConfig},
        spinlock::SpinLock,
    };
    use std::sync::Arc;

    #[test]
    fn baton_passes_between_contexts() {
        let machine = Machine::new(&MachineConfig::default());
        let main = machine.adopt_current("main");
        let log = Arc::new(SpinLock::new(Vec::new()));

        let child = machine.new_tcb("child");
        assert_eq!(child.name(), "child");
        let (trace, back) = (log.clone(), main.clone());
        child.start(move || {
            trace.with(|l| l.push("child"));
            back.context_switch();
            trace.with(|l| l.push("child again"));
            back.context_switch();
        });

        child.context_switch();
        log.with(|l| l.push("main"));
        assert!(main.is_current());
        child.context_switch();

        assert_eq!(log.with(|l| l.clone()), ["child", "main", "child again"]);
        assert_eq!(machine.stats().context_switches, 4);
        assert!(!machine.is_halted());
        machine.halt();
        assert!(machine.is_halted());
    }

    #[test]
    fn destroy_unstarted_context() {
        let machine = Machine::new(&MachineConfig::default());
        let _main = machine.adopt_current("main");
        let child = machine.new_tcb("never run");
        child.start(|| unreachable!());
        child.destroy();
        machine.halt();
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn panic_in_context_reaches_root() {
        let machine = Machine::new(&MachineConfig::default());
        let _main = machine.adopt_current("main");
        let child = machine.new_tcb("child");
        child.start(|| panic!("boom"));
        child.context_switch();
    }
}
