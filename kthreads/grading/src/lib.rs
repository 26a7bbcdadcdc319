//! Grading utilities.
//!
//! - [`kernel_test`] boots a kernel around a test body.
//! - [`Recorder`] observes scheduling events, with their time stamps.
//! - [`BoatGrader`] checks every ferry crossing against the rules and tracks
//!   where everybody is.
extern crate grading_derive;

pub use grading_derive::*;

use abyss::spinlock::SpinLock;
use crossbeam_queue::SegQueue;
use kthreads::{
    Observer, Thread,
    ferry::{AgentId, Crossing, Role, Seat, Shore, TransitHook},
};

/// Kind of a scheduling event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Thread went to the ready queue.
    Ready,
    /// Thread got the processor.
    Running,
    /// Thread is finishing.
    Finishing,
    /// Thread was designated as the idle thread.
    Idle,
    /// Timer interrupt.
    Timer,
}

/// A recorded scheduling event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// Simulated time of the event.
    pub time: u64,
    /// What happened.
    pub kind: EventKind,
    /// Name of the thread involved, empty for timer events.
    pub thread: String,
}

/// An [`Observer`] that records every event.
#[derive(Default)]
pub struct Recorder {
    events: SegQueue<Event>,
}

impl Recorder {
    fn record(&self, kind: EventKind, th: Option<&Thread>, time: u64) {
        self.events.push(Event {
            time,
            kind,
            thread: th.map(|th| th.name().to_owned()).unwrap_or_default(),
        });
    }

    /// Drains the events recorded so far, oldest first.
    pub fn take(&self) -> Vec<Event> {
        std::iter::from_fn(|| self.events.pop()).collect()
    }
}

impl Observer for Recorder {
    fn ready_thread(&self, th: &Thread, now: u64) {
        self.record(EventKind::Ready, Some(th), now);
    }

    fn running_thread(&self, th: &Thread, now: u64) {
        self.record(EventKind::Running, Some(th), now);
    }

    fn finishing_thread(&self, th: &Thread, now: u64) {
        self.record(EventKind::Finishing, Some(th), now);
    }

    fn set_idle_thread(&self, th: &Thread) {
        self.record(EventKind::Idle, Some(th), 0);
    }

    fn timer_interrupt(&self, now: u64) {
        self.record(EventKind::Timer, None, now);
    }
}

struct Positions {
    minors: Vec<Shore>,
    majors: Vec<Shore>,
    boat: Shore,
    crossings: Vec<Crossing>,
    violations: Vec<String>,
}

impl Positions {
    fn location(&mut self, agent: AgentId) -> Option<&mut Shore> {
        match agent.role {
            Role::Minor => self.minors.get_mut(agent.index),
            Role::Major => self.majors.get_mut(agent.index),
        }
    }

    fn complain(&mut self, crossing: &Crossing, msg: String) {
        self.violations.push(format!("{crossing}: {msg}"));
    }

    fn check(&mut self, crossing: &Crossing) {
        if crossing.seats.is_empty() {
            self.complain(crossing, "the boat crossed empty".into());
        }
        if crossing.from == crossing.to {
            self.complain(crossing, "the boat did not change shore".into());
        }
        let rowers = crossing
            .seats
            .iter()
            .filter(|b| b.seat == Seat::Rower)
            .count();
        if rowers != 1 {
            self.complain(crossing, format!("{rowers} rowers in the boat"));
        }
        if let Some(rower) = crossing.rower() {
            if rower.role != Role::Minor {
                self.complain(crossing, format!("{rower} cannot row"));
            }
        }
        if self.boat != crossing.from {
            let boat = self.boat;
            self.complain(crossing, format!("the boat is at {boat:?}"));
        }
        for boarding in &crossing.seats {
            let agent = boarding.agent;
            match self.location(agent).map(|at| *at) {
                None => self.complain(crossing, format!("unknown agent {agent}")),
                Some(at) if at != crossing.from => {
                    self.complain(crossing, format!("{agent} boards at {at:?}"))
                }
                Some(_) => {
                    if let Some(at) = self.location(agent) {
                        *at = crossing.to;
                    }
                }
            }
        }
        self.boat = crossing.to;
        self.crossings.push(crossing.clone());
    }
}

/// A [`TransitHook`] that validates every crossing.
pub struct BoatGrader {
    positions: SpinLock<Positions>,
}

impl BoatGrader {
    /// Starts with everybody and the boat at the origin.
    pub fn new(minors: usize, majors: usize) -> Self {
        Self {
            positions: SpinLock::new(Positions {
                minors: vec![Shore::Origin; minors],
                majors: vec![Shore::Origin; majors],
                boat: Shore::Origin,
                crossings: Vec::new(),
                violations: Vec::new(),
            }),
        }
    }

    /// Rule violations seen so far.
    pub fn violations(&self) -> Vec<String> {
        self.positions.with(|p| p.violations.clone())
    }

    /// Crossings seen so far, in order.
    pub fn crossings(&self) -> Vec<Crossing> {
        self.positions.with(|p| p.crossings.clone())
    }

    /// Whether everybody reached the destination.
    pub fn all_crossed(&self) -> bool {
        self.positions.with(|p| {
            p.minors
                .iter()
                .chain(p.majors.iter())
                .all(|at| *at == Shore::Destination)
        })
    }
}

impl TransitHook for BoatGrader {
    fn on_crossing(&self, crossing: &Crossing) {
        self.positions.with(|p| p.check(crossing));
    }
}
