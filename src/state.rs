//! Coordinator state shared by the job coordinator and the shutdown path.
//!
//! One mutex guards every flag. It is only ever held for flag reads and
//! writes, never across a publish, a job execution or a wait.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::model::JobId;

#[derive(Debug, Default)]
pub struct CoordinatorState {
    /// Set once shutdown has begun. Never cleared.
    pub disconnect_called: bool,
    /// True from the moment a start-next request is issued until the job it
    /// produced (if any) has been reported and acknowledged.
    pub is_working: bool,
    /// A work-available signal arrived while working and is still unconsumed.
    pub is_retry_pending: bool,
    /// A start-next request is outstanding and its response not yet handled.
    pub awaiting_start: bool,
    /// Client tokens of the outstanding start-next requests, oldest first. A
    /// re-issue after a lost session adds a token; handling a response clears
    /// them all.
    pub start_tokens: Vec<String>,
    /// Job owned by the live work slot, if any.
    pub active_job: Option<JobId>,
}

/// Coarse lifecycle view of [`CoordinatorState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Working,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Working => "working",
        };
        write!(f, "{s}")
    }
}

impl CoordinatorState {
    pub fn phase(&self) -> Phase {
        match (self.is_working, self.awaiting_start) {
            (false, _) => Phase::Idle,
            (true, true) => Phase::Starting,
            (true, false) => Phase::Working,
        }
    }
}

/// The single lock around [`CoordinatorState`]. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<CoordinatorState>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the state. A poisoned lock is recovered: flags are plain values
    /// and stay consistent even if a holder panicked.
    pub fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase()
    }
}
