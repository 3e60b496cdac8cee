//! Cancellation tokens for thumbnail work
//!
//! Provides cancellation tokens that allow queued and running thumbnail
//! loads to be abandoned cooperatively. Tokens can be chained: a child token
//! is cancelled with its parent, and a linked token is cancelled as soon as
//! any of its sources is.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};

type CancelCallback = Box<dyn FnOnce() + Send>;

struct TokenState {
    cancelled: AtomicBool,
    children: Mutex<Vec<Weak<TokenState>>>,
    callbacks: Mutex<Vec<CancelCallback>>,
}

impl TokenState {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self) {
        // Only the first caller fans out
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        let children = std::mem::take(&mut *lock(&self.children));
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }

        let callbacks = std::mem::take(&mut *lock(&self.callbacks));
        for callback in callbacks {
            callback();
        }
    }

    fn attach_child(&self, child: &Arc<TokenState>) {
        let mut children = lock(&self.children);
        if self.cancelled.load(Ordering::Acquire) {
            drop(children);
            child.cancel();
            return;
        }
        children.retain(|existing| existing.strong_count() > 0);
        children.push(Arc::downgrade(child));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cancellation token for cooperative cancellation
///
/// Workers can periodically check `is_cancelled()` to determine if they
/// should stop. Clones share the same underlying state.
///
/// # Example
///
/// ```
/// use lora_manager_cache::CancellationToken;
///
/// let owner = CancellationToken::new();
/// let caller = CancellationToken::new();
/// let request = CancellationToken::linked(&[&owner, &caller]);
///
/// owner.cancel();
/// assert!(request.is_cancelled());
/// assert!(!caller.is_cancelled());
/// ```
#[derive(Clone)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Create a new cancellation token
    ///
    /// The token starts in a non-cancelled state.
    pub fn new() -> Self {
        Self {
            state: Arc::new(TokenState::new()),
        }
    }

    /// Create a token that is cancelled when this one is
    ///
    /// Cancelling the child does not affect the parent.
    pub fn child(&self) -> Self {
        let child = Self::new();
        self.state.attach_child(&child.state);
        child
    }

    /// Create a token that is cancelled when any of `sources` is
    ///
    /// If a source is already cancelled the new token starts cancelled.
    pub fn linked(sources: &[&CancellationToken]) -> Self {
        let linked = Self::new();
        for source in sources {
            source.state.attach_child(&linked.state);
        }
        linked
    }

    /// Cancel this token
    ///
    /// All clones and children observe the cancellation and registered
    /// callbacks run on the calling thread. Calling it again is a no-op.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Check if this token has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Run `callback` once when the token is cancelled
    ///
    /// Runs immediately on the calling thread if the token is already
    /// cancelled.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callbacks = lock(&self.state.callbacks);
        if self.is_cancelled() {
            drop(callbacks);
            callback();
            return;
        }
        callbacks.push(Box::new(callback));
    }

    /// True if both handles refer to the same token
    pub fn same_as(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    #[cfg(test)]
    pub(crate) fn child_slots(&self) -> usize {
        lock(&self.state.children).len()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
