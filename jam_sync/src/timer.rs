// Contract for the external timer whose state a session shares.
//
// The sync layer never interprets timer state. A host reads a snapshot on
// every broadcast tick; a participant replaces its timer state wholesale with
// each snapshot it receives. "Jam mode" tells the timer that its state is
// driven from outside, so it can stop advancing on its own clock.
//
// The owning process usually needs the same timer for rendering, so the trait
// is also implemented for `Arc<Mutex<T>>`. A poisoned lock is recovered
// rather than propagated: the timer state is plain data and a panicked
// renderer should not take the session down with it.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A timer that can be mirrored across a jam session.
pub trait SessionTimer {
    /// Full snapshot of the timer, as carried in `state-sync` messages.
    type State: Serialize + DeserializeOwned;

    fn get_state(&self) -> Self::State;

    /// Replace the current state. Applying the same snapshot twice must be
    /// harmless.
    fn set_state(&mut self, state: Self::State);

    /// `true` while the timer accepts externally applied state.
    fn set_jam_mode(&mut self, enabled: bool);
}

impl<T: SessionTimer> SessionTimer for Arc<Mutex<T>> {
    type State = T::State;

    fn get_state(&self) -> Self::State {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_state()
    }

    fn set_state(&mut self, state: Self::State) {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_state(state);
    }

    fn set_jam_mode(&mut self, enabled: bool) {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_jam_mode(enabled);
    }
}
