//! Shared in-flight decodes
//!
//! A [`Flight`] is the single decode for one cache key. Every caller that
//! asks for the key while the flight is live becomes a [`Waiter`] with its
//! own completion slot and cancellation token. A waiter that cancels is
//! resolved alone; the decode itself is abandoned only once no waiters
//! remain.

use crate::completion::Completion;
use crate::priority::ThumbnailPriority;
use lora_manager_cache::{CancellationToken, SharedBitmap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Unique waiter identifier
pub(crate) type WaiterId = u64;

static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1);

/// One caller waiting on a flight
pub(crate) struct Waiter {
    id: WaiterId,
    completion: Arc<Completion>,

    /// Linked caller, owner and shutdown token; held here so it stays
    /// reachable from its sources while the caller waits
    _cancel: CancellationToken,
}

impl Waiter {
    pub(crate) fn new(completion: Arc<Completion>, cancel: CancellationToken) -> Self {
        Self {
            id: NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed),
            completion,
            _cancel: cancel,
        }
    }

    pub(crate) fn id(&self) -> WaiterId {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting in the request queue
    Queued,
    /// Handed to a decode worker
    Dispatched,
    /// Result delivered to every waiter
    Finished,
    /// Every waiter cancelled before a result arrived
    Abandoned,
}

struct FlightState {
    waiters: Vec<Waiter>,
    priority: ThumbnailPriority,
    phase: Phase,
}

/// How a caller was attached to a flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attach {
    /// A new flight was started for the caller
    Created,
    /// The caller joined a live flight
    Joined,
    /// The caller joined a queued flight and raised its priority
    Raised(ThumbnailPriority),
}

/// The single decode for one cache key
pub(crate) struct Flight {
    pub key: String,
    pub path: PathBuf,
    pub target_width: u32,

    /// Cancelled on shutdown or once every waiter has left
    pub cancel: CancellationToken,

    state: Mutex<FlightState>,
}

impl Flight {
    pub(crate) fn new(
        key: String,
        path: PathBuf,
        target_width: u32,
        cancel: CancellationToken,
        first: Waiter,
        priority: ThumbnailPriority,
    ) -> Self {
        Self {
            key,
            path,
            target_width,
            cancel,
            state: Mutex::new(FlightState {
                waiters: vec![first],
                priority,
                phase: Phase::Queued,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlightState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a waiter to a live flight
    ///
    /// Gives the waiter back if the flight has finished or been abandoned.
    /// A queued flight takes the higher of its own and `priority`.
    pub(crate) fn join(&self, waiter: Waiter, priority: ThumbnailPriority) -> Result<Attach, Waiter> {
        let mut state = self.lock();
        let live = matches!(state.phase, Phase::Queued | Phase::Dispatched);
        if !live || self.cancel.is_cancelled() {
            return Err(waiter);
        }

        state.waiters.push(waiter);
        if state.phase == Phase::Queued && priority > state.priority {
            state.priority = priority;
            return Ok(Attach::Raised(priority));
        }
        Ok(Attach::Joined)
    }

    /// Remove a waiter after it was cancelled
    ///
    /// Returns `true` if this left the flight without waiters, in which case
    /// the flight is abandoned and its decode token cancelled.
    pub(crate) fn detach(&self, id: WaiterId) -> bool {
        let abandoned = {
            let mut state = self.lock();
            state.waiters.retain(|waiter| waiter.id != id);
            let live = matches!(state.phase, Phase::Queued | Phase::Dispatched);
            if live && state.waiters.is_empty() {
                state.phase = Phase::Abandoned;
                true
            } else {
                false
            }
        };

        if abandoned {
            self.cancel.cancel();
        }
        abandoned
    }

    /// Move a queued flight to a decode worker
    ///
    /// Returns `false` if the flight is no longer worth decoding.
    pub(crate) fn start(&self) -> bool {
        let mut state = self.lock();
        if state.phase != Phase::Queued || self.cancel.is_cancelled() {
            return false;
        }
        state.phase = Phase::Dispatched;
        true
    }

    /// Deliver the result to every remaining waiter
    pub(crate) fn finish(&self, result: Option<SharedBitmap>) {
        let waiters = {
            let mut state = self.lock();
            if state.phase != Phase::Abandoned {
                state.phase = Phase::Finished;
            }
            std::mem::take(&mut state.waiters)
        };

        for waiter in waiters {
            waiter.completion.complete(result.clone());
        }
    }

    /// Queued or decoding with at least one waiter
    pub(crate) fn is_live(&self) -> bool {
        let state = self.lock();
        matches!(state.phase, Phase::Queued | Phase::Dispatched) && !self.cancel.is_cancelled()
    }

    /// Effective priority of the flight
    pub(crate) fn priority(&self) -> ThumbnailPriority {
        self.lock().priority
    }

    #[cfg(test)]
    fn waiters(&self) -> usize {
        self.lock().waiters.len()
    }
}
