//! Decode concurrency limiter
//!
//! A counting semaphore bounding how many decodes run at once, independent of
//! how many requests are waiting. Permits are owned values so the dispatch
//! loop can acquire one and hand it to a decode worker.

use crate::cancel::CancellationToken;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// How long a waiter sleeps before re-checking its cancellation token
pub const PERMIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

struct PermitState {
    available: Mutex<usize>,
    released: Condvar,
    limit: usize,
}

/// Counting semaphore for decode work
#[derive(Clone)]
pub struct DecodePermits {
    state: Arc<PermitState>,
}

impl DecodePermits {
    /// Create a limiter allowing `limit` simultaneous decodes (at least one)
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            state: Arc::new(PermitState {
                available: Mutex::new(limit),
                released: Condvar::new(),
                limit,
            }),
        }
    }

    /// Wait for a permit
    ///
    /// Returns `None` if `cancel` fires before a permit becomes available.
    pub fn acquire(&self, cancel: &CancellationToken) -> Option<DecodePermit> {
        let mut available = self
            .state
            .available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if *available > 0 {
                *available -= 1;
                return Some(DecodePermit {
                    state: Arc::clone(&self.state),
                });
            }
            available = match self.state.released.wait_timeout(available, PERMIT_POLL_INTERVAL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Take a permit without waiting
    pub fn try_acquire(&self) -> Option<DecodePermit> {
        let mut available = self
            .state
            .available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(DecodePermit {
            state: Arc::clone(&self.state),
        })
    }

    /// Number of permits currently free
    pub fn available(&self) -> usize {
        *self
            .state
            .available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Maximum number of simultaneous permits
    pub fn limit(&self) -> usize {
        self.state.limit
    }
}

impl std::fmt::Debug for DecodePermits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodePermits")
            .field("available", &self.available())
            .field("limit", &self.limit())
            .finish()
    }
}

/// A held decode slot, returned to the limiter on drop
pub struct DecodePermit {
    state: Arc<PermitState>,
}

impl Drop for DecodePermit {
    fn drop(&mut self) {
        let mut available = self
            .state
            .available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *available += 1;
        self.state.released.notify_one();
    }
}

impl std::fmt::Debug for DecodePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DecodePermit")
    }
}
