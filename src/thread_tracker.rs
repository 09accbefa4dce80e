use crate::gdb::{ThreadId, MAIN_THREAD};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    /// The debugger delivers one new-thread event per birth, so the diff
    /// between snapshots must be a singleton when one is requested.
    #[error("expected exactly one newly born thread, found {0}")]
    AmbiguousBirth(usize),
}

/// Difference between two live-thread snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThreadDelta {
    pub newly_born: BTreeSet<ThreadId>,
    pub exited: BTreeSet<ThreadId>,
}

/// Maintains the set of live thread ids known to the orchestrator. The main
/// thread is live from the moment the target pauses at its entry point.
pub struct ThreadTracker {
    alive: BTreeSet<ThreadId>,
    last_delta: ThreadDelta,
}

impl ThreadTracker {
    pub fn new() -> ThreadTracker {
        let mut alive = BTreeSet::new();
        alive.insert(MAIN_THREAD);
        ThreadTracker {
            alive,
            last_delta: ThreadDelta::default(),
        }
    }

    pub fn alive(&self) -> &BTreeSet<ThreadId> {
        &self.alive
    }

    /// Replaces the snapshot with `current` and returns the diff.
    pub fn refresh<I: IntoIterator<Item = ThreadId>>(&mut self, current: I) -> ThreadDelta {
        let current: BTreeSet<ThreadId> = current.into_iter().collect();
        let delta = ThreadDelta {
            newly_born: current.difference(&self.alive).copied().collect(),
            exited: self.alive.difference(&current).copied().collect(),
        };
        self.alive = current;
        self.last_delta = delta.clone();
        delta
    }

    /// The one thread born since the previous snapshot.
    pub fn newly_born_singleton(&self) -> Result<ThreadId, TrackerError> {
        let born = &self.last_delta.newly_born;
        if born.len() != 1 {
            return Err(TrackerError::AmbiguousBirth(born.len()));
        }
        Ok(*born.iter().next().unwrap())
    }
}

impl Default for ThreadTracker {
    fn default() -> Self {
        ThreadTracker::new()
    }
}
