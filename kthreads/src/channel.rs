//! # Rendezvous channel.
//!
//! A [`Communicator`] hands one value at a time from a speaker to a listener
//! without any buffering. [`Communicator::speak`] does not return before some
//! listener has taken the value, and [`Communicator::listen`] does not return
//! before some speaker has supplied one. Pairing is not first-come
//! first-served, but every value is received exactly once.
//!
//! The state is a single message slot and the number of waiting speakers and
//! listeners, guarded by one [`Mutex`]. Speakers and listeners sleep on
//! separate [`Condition`]s, and every state change wakes the side that may
//! now proceed. Speakers waiting for a listener and the speaker waiting for
//! its acknowledgement share one queue, so taking a message wakes all
//! speakers.

use crate::{
    Kernel,
    sync::{Condition, Mutex},
};
use abyss::{dprintln, kprint::DebugFlags};

struct Rendezvous<T> {
    waiting_speakers: usize,
    waiting_listeners: usize,
    message: Option<T>,
}

/// A synchronous, zero-capacity channel.
pub struct Communicator<T> {
    state: Mutex<Rendezvous<T>>,
    speakers: Condition,
    listeners: Condition,
}

impl<T: Send> Communicator<T> {
    /// Creates a channel with nobody waiting on either side.
    pub fn new(kernel: &Kernel) -> Self {
        let state = Mutex::new(
            kernel,
            Rendezvous {
                waiting_speakers: 0,
                waiting_listeners: 0,
                message: None,
            },
        );
        let speakers = Condition::new(state.raw_lock());
        let listeners = Condition::new(state.raw_lock());
        Self {
            state,
            speakers,
            listeners,
        }
    }

    /// Sends `value`, blocking until a listener has received it.
    pub fn speak(&self, value: T) {
        let mut state = self.state.lock();
        state.waiting_speakers += 1;

        // Wait for a listener and an empty slot.
        state = self.speakers.wait_while(state, |s| {
            s.waiting_listeners == 0 || s.message.is_some()
        });
        state.message = Some(value);
        dprintln!(DebugFlags::CHANNEL, "Message posted");
        self.listeners.wake();

        // Wait for the acknowledgement.
        state = self.speakers.wait_while(state, |s| s.message.is_some());
        state.waiting_speakers -= 1;
        self.speakers.wake();
        state.unlock();
    }

    /// Receives a value, blocking until a speaker has sent one.
    pub fn listen(&self) -> T {
        let mut state = self.state.lock();
        state.waiting_listeners += 1;
        self.speakers.wake();

        state = self.listeners.wait_while(state, |s| s.message.is_none());
        let Some(value) = state.message.take() else {
            unreachable!("listener woke up without a message");
        };
        dprintln!(DebugFlags::CHANNEL, "Message received");
        state.waiting_listeners -= 1;
        // The speaker that posted may sit behind speakers still waiting for a
        // listener.
        self.speakers.wake_all();
        state.unlock();
        value
    }

    /// Number of speakers and listeners currently inside the channel.
    pub fn waiting(&self) -> (usize, usize) {
        let state = self.state.lock();
        let waiting = (state.waiting_speakers, state.waiting_listeners);
        state.unlock();
        waiting
    }
}
