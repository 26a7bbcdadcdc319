//! # Ferry.
//!
//! A group of agents must cross from the [`Shore::Origin`] to the
//! [`Shore::Destination`] with a single boat that seats two. Agents come in
//! two roles:
//!
//! - a [`Role::Minor`] may row, alone or with a passenger,
//! - a [`Role::Major`] may only ride as a passenger.
//!
//! Since only minors row, the boat can only come back with a minor aboard.
//! Every agent is a kernel thread. The shared state, where everybody is and
//! where the boat is, is guarded by one [`Mutex`], and each role sleeps on
//! its own [`Condition`].
//!
//! ## Crossing policy
//!
//! An agent standing next to the boat acts when the state allows it:
//!
//! - boat at the origin, majors left there: a minor rows one major across.
//! - boat at the origin, no major left: two minors cross together, or the
//!   last minor crosses alone.
//! - boat at the destination, agents left at the origin: a minor rows back
//!   alone.
//!
//! After a crossing to the destination only minors can make progress, so
//! only minors are woken; after a return trip everybody is. The first agent
//! that sees everybody at the destination marks the crossing done and wakes
//! all remaining sleepers.
//!
//! Every crossing is reported once to a [`TransitHook`] while the state is
//! still locked, so the hook observes crossings in order.

use crate::{
    Kernel, KernelError, ThreadBuilder,
    sync::{Condition, Mutex, MutexGuard},
};
use abyss::{dprintln, kprint::DebugFlags};
use arrayvec::ArrayVec;
use std::{fmt, sync::Arc};

/// What an agent is allowed to do in the boat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    /// Rows, alone or with a passenger.
    Minor,
    /// Only rides as a passenger.
    Major,
}

/// One of the two shores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Shore {
    /// Where everybody starts.
    Origin,
    /// Where everybody must end up.
    Destination,
}

impl Shore {
    /// The shore across the water.
    pub fn opposite(self) -> Self {
        match self {
            Shore::Origin => Shore::Destination,
            Shore::Destination => Shore::Origin,
        }
    }
}

/// Identity of an agent: its role and its index within that role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgentId {
    /// Role of the agent.
    pub role: Role,
    /// Index among the agents of the same role.
    pub index: usize,
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.role, self.index)
    }
}

/// A seat in the boat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Seat {
    /// Rows the boat.
    Rower,
    /// Rides along.
    Passenger,
}

/// An agent in a seat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Boarding {
    /// Who sits.
    pub agent: AgentId,
    /// Where.
    pub seat: Seat,
}

/// One trip of the boat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Crossing {
    /// Shore the boat leaves.
    pub from: Shore,
    /// Shore the boat reaches.
    pub to: Shore,
    /// Occupied seats, rower first.
    pub seats: ArrayVec<Boarding, 2>,
}

impl Crossing {
    fn new(from: Shore, rower: AgentId, passenger: Option<AgentId>) -> Self {
        let mut seats = ArrayVec::new();
        seats.push(Boarding {
            agent: rower,
            seat: Seat::Rower,
        });
        if let Some(agent) = passenger {
            seats.push(Boarding {
                agent,
                seat: Seat::Passenger,
            });
        }
        Self {
            from,
            to: from.opposite(),
            seats,
        }
    }

    /// The agent rowing, if any.
    pub fn rower(&self) -> Option<AgentId> {
        self.seats
            .iter()
            .find(|b| b.seat == Seat::Rower)
            .map(|b| b.agent)
    }

    /// The agents riding along.
    pub fn passengers(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.seats
            .iter()
            .filter(|b| b.seat == Seat::Passenger)
            .map(|b| b.agent)
    }
}

impl fmt::Display for Crossing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} -> {:?}:", self.from, self.to)?;
        for boarding in &self.seats {
            write!(f, " {} ({:?})", boarding.agent, boarding.seat)?;
        }
        Ok(())
    }
}

/// Callback told about every crossing.
///
/// The hook observes; it must not block or call back into the ferry.
pub trait TransitHook: Send + Sync {
    /// Called once per crossing, in crossing order.
    fn on_crossing(&self, crossing: &Crossing);
}

impl<F: Fn(&Crossing) + Send + Sync> TransitHook for F {
    fn on_crossing(&self, crossing: &Crossing) {
        self(crossing)
    }
}

/// Outcome of a completed ferry run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FerryReport {
    /// Number of minors carried.
    pub minors: usize,
    /// Number of majors carried.
    pub majors: usize,
    /// Number of trips the boat made.
    pub crossings: usize,
}

struct Harbor {
    minors: Vec<Shore>,
    majors: Vec<Shore>,
    boat: Shore,
    crossings: usize,
    done: bool,
}

impl Harbor {
    fn location(&self, agent: AgentId) -> Shore {
        match agent.role {
            Role::Minor => self.minors[agent.index],
            Role::Major => self.majors[agent.index],
        }
    }

    fn at(&self, role: Role, shore: Shore) -> impl Iterator<Item = AgentId> + '_ {
        let agents = match role {
            Role::Minor => &self.minors,
            Role::Major => &self.majors,
        };
        agents
            .iter()
            .enumerate()
            .filter(move |(_, at)| **at == shore)
            .map(move |(index, _)| AgentId { role, index })
    }

    fn is_complete(&self) -> bool {
        self.minors
            .iter()
            .chain(self.majors.iter())
            .all(|at| *at == Shore::Destination)
    }

    /// The crossing `me` can start now, if any.
    fn plan(&self, me: AgentId) -> Option<Crossing> {
        if self.location(me) != self.boat {
            return None;
        }
        match self.boat {
            Shore::Origin => match me.role {
                Role::Major => {
                    let rower = self.at(Role::Minor, Shore::Origin).next()?;
                    Some(Crossing::new(Shore::Origin, rower, Some(me)))
                }
                Role::Minor => {
                    let passenger = self.at(Role::Major, Shore::Origin).next().or_else(|| {
                        self.at(Role::Minor, Shore::Origin)
                            .find(|other| *other != me)
                    });
                    Some(Crossing::new(Shore::Origin, me, passenger))
                }
            },
            Shore::Destination => {
                let stranded = self.at(Role::Minor, Shore::Origin).next().is_some()
                    || self.at(Role::Major, Shore::Origin).next().is_some();
                (me.role == Role::Minor && stranded)
                    .then(|| Crossing::new(Shore::Destination, me, None))
            }
        }
    }

    fn apply(&mut self, crossing: &Crossing) {
        debug_assert_eq!(self.boat, crossing.from);
        for boarding in &crossing.seats {
            let agent = boarding.agent;
            match agent.role {
                Role::Minor => self.minors[agent.index] = crossing.to,
                Role::Major => self.majors[agent.index] = crossing.to,
            }
        }
        self.boat = crossing.to;
        self.crossings += 1;
    }
}

/// The ferry: one boat, its harbor, and the agents waiting on it.
pub struct Ferry {
    kernel: Kernel,
    harbor: Mutex<Harbor>,
    minors: Condition,
    majors: Condition,
    hook: Arc<dyn TransitHook>,
}

impl Ferry {
    /// Carries `minors` minors and `majors` majors across.
    ///
    /// Spawns one thread per agent, named after the agent, and waits for all
    /// of them.
    ///
    /// # Errors
    /// [`KernelError::InvalidArgument`] if majors must cross but no minor is
    /// there to row them.
    pub fn begin(
        kernel: &Kernel,
        minors: usize,
        majors: usize,
        hook: Arc<dyn TransitHook>,
    ) -> Result<FerryReport, KernelError> {
        if minors == 0 && majors > 0 {
            return Err(KernelError::InvalidArgument);
        }
        let harbor = Mutex::new(
            kernel,
            Harbor {
                minors: vec![Shore::Origin; minors],
                majors: vec![Shore::Origin; majors],
                boat: Shore::Origin,
                crossings: 0,
                done: false,
            },
        );
        let ferry = Arc::new(Ferry {
            kernel: kernel.clone(),
            minors: Condition::new(harbor.raw_lock()),
            majors: Condition::new(harbor.raw_lock()),
            harbor,
            hook,
        });

        let agents = (0..minors)
            .map(|index| AgentId {
                role: Role::Minor,
                index,
            })
            .chain((0..majors).map(|index| AgentId {
                role: Role::Major,
                index,
            }));
        let handles: Vec<_> = agents
            .map(|agent| {
                let ferry = ferry.clone();
                ThreadBuilder::new(agent.to_string()).spawn(kernel, move || ferry.voyage(agent))
            })
            .collect();
        for handle in handles {
            handle.join()?;
        }

        let harbor = ferry.harbor.lock();
        assert!(harbor.is_complete(), "ferry stopped with agents left behind");
        let crossings = harbor.crossings;
        harbor.unlock();
        Ok(FerryReport {
            minors,
            majors,
            crossings,
        })
    }

    fn sleepers(&self, role: Role) -> &Condition {
        match role {
            Role::Minor => &self.minors,
            Role::Major => &self.majors,
        }
    }

    /// Life of one agent.
    fn voyage(&self, me: AgentId) {
        let mut harbor = self.harbor.lock();
        loop {
            if harbor.done {
                assert!(harbor.is_complete(), "{me} saw the ferry done early");
                break;
            }
            if harbor.is_complete() {
                dprintln!(DebugFlags::FERRY, "{me}: everybody crossed");
                harbor.done = true;
                self.minors.wake_all();
                self.majors.wake_all();
                break;
            }
            match harbor.plan(me) {
                Some(crossing) => harbor = self.cross(harbor, crossing),
                None => harbor = self.sleepers(me.role).wait(harbor),
            }
        }
        harbor.unlock();
    }

    fn cross<'a>(&'a self, mut harbor: MutexGuard<'a, Harbor>, crossing: Crossing) -> MutexGuard<'a, Harbor> {
        dprintln!(DebugFlags::FERRY, "{crossing}");
        harbor.apply(&crossing);
        self.hook.on_crossing(&crossing);
        match harbor.boat {
            Shore::Destination => self.minors.wake_all(),
            Shore::Origin => {
                self.minors.wake_all();
                self.majors.wake_all();
            }
        }
        harbor.unlock();
        self.kernel.yield_now();
        self.harbor.lock()
    }
}
