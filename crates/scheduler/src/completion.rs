//! One-shot completion handles for thumbnail requests
//!
//! Each caller owns a [`Completion`] slot. The first writer (decode result,
//! cache hit, or a cancellation) wins; later writers are ignored. Callers
//! hold [`PendingThumbnail`] handles that read the slot.

use lora_manager_cache::SharedBitmap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Result slot for one caller's request
pub(crate) struct Completion {
    slot: Mutex<Option<Option<SharedBitmap>>>,
    ready: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn resolved(value: Option<SharedBitmap>) -> Self {
        Self {
            slot: Mutex::new(Some(value)),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Option<SharedBitmap>>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store the result unless one is already stored
    ///
    /// Returns `true` if this call resolved the request.
    pub(crate) fn complete(&self, value: Option<SharedBitmap>) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.ready.notify_all();
        true
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.lock().is_some()
    }

    pub(crate) fn peek(&self) -> Option<Option<SharedBitmap>> {
        self.lock().clone()
    }

    pub(crate) fn wait(&self) -> Option<SharedBitmap> {
        let mut slot = self.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<Option<SharedBitmap>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return Some(value.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            slot = match self.ready.wait_timeout(slot, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// Observable state of a thumbnail request
#[derive(Debug, Clone)]
pub enum ThumbnailState {
    /// Still queued or decoding
    Pending,
    /// Decoded (or found in the cache)
    Ready(SharedBitmap),
    /// Failed or cancelled; the caller may ask again later
    Unavailable,
}

impl ThumbnailState {
    fn from_slot(slot: Option<Option<SharedBitmap>>) -> Self {
        match slot {
            None => ThumbnailState::Pending,
            Some(Some(bitmap)) => ThumbnailState::Ready(bitmap),
            Some(None) => ThumbnailState::Unavailable,
        }
    }

    /// The bitmap, if ready
    pub fn bitmap(&self) -> Option<&SharedBitmap> {
        match self {
            ThumbnailState::Ready(bitmap) => Some(bitmap),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ThumbnailState::Pending)
    }
}

/// Handle to the outcome of a thumbnail request
///
/// UI code can poll [`state`](Self::state) once per frame, worker code can
/// block on [`wait`](Self::wait). Every request gets its own handle, even
/// when it shares a decode with other requests; clones share the result.
#[derive(Clone)]
pub struct PendingThumbnail {
    completion: Arc<Completion>,
}

impl PendingThumbnail {
    pub(crate) fn new(completion: Arc<Completion>) -> Self {
        Self { completion }
    }

    pub(crate) fn ready(bitmap: SharedBitmap) -> Self {
        Self::new(Arc::new(Completion::resolved(Some(bitmap))))
    }

    pub(crate) fn unavailable() -> Self {
        Self::new(Arc::new(Completion::resolved(None)))
    }

    /// Block until the request resolves
    pub fn wait(&self) -> Option<SharedBitmap> {
        self.completion.wait()
    }

    /// Block until the request resolves or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> ThumbnailState {
        ThumbnailState::from_slot(self.completion.wait_timeout(timeout))
    }

    /// Current state without blocking
    pub fn state(&self) -> ThumbnailState {
        ThumbnailState::from_slot(self.completion.peek())
    }

    pub fn is_resolved(&self) -> bool {
        self.completion.is_resolved()
    }

    /// True if both handles are clones of one request's handle
    pub fn same_request(&self, other: &PendingThumbnail) -> bool {
        Arc::ptr_eq(&self.completion, &other.completion)
    }
}

impl std::fmt::Debug for PendingThumbnail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PendingThumbnail").field(&self.state()).finish()
    }
}
