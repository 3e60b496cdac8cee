//! Owner tokens and per-owner cancellation
//!
//! Every view that shows thumbnails holds a [`ThumbnailOwner`]. The
//! orchestrator boosts the active owner's requests and keeps one
//! cancellation token per owner so a view's outstanding work can be dropped
//! when it loses focus.

use lora_manager_cache::CancellationToken;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Unique owner identifier
pub type OwnerId = u64;

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a requesting view
///
/// Compared by identity: two owners created separately are never equal, a
/// clone is equal to its original.
///
/// # Example
///
/// ```
/// use lora_manager_scheduler::ThumbnailOwner;
///
/// let gallery = ThumbnailOwner::new();
/// let captions = ThumbnailOwner::new();
///
/// assert_eq!(gallery, gallery.clone());
/// assert_ne!(gallery, captions);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThumbnailOwner {
    id: OwnerId,
}

impl ThumbnailOwner {
    /// Create a new owner identity
    pub fn new() -> Self {
        Self {
            id: NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// The owner's identifier
    pub fn id(&self) -> OwnerId {
        self.id
    }
}

impl Default for ThumbnailOwner {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-owner cancellation tokens
///
/// Tokens are created lazily on first use and dropped when the owner's
/// requests are cancelled, so the next request starts with a fresh token.
pub struct OwnerRegistry {
    tokens: Mutex<HashMap<OwnerId, CancellationToken>>,
}

impl OwnerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<OwnerId, CancellationToken>> {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get the owner's current token, creating it if needed
    pub fn token_for(&self, owner: &ThumbnailOwner) -> CancellationToken {
        self.lock().entry(owner.id()).or_default().clone()
    }

    /// Get the owner's current token, if one exists
    pub fn get(&self, owner: &ThumbnailOwner) -> Option<CancellationToken> {
        self.lock().get(&owner.id()).cloned()
    }

    /// Remove and cancel the owner's token
    ///
    /// Returns `true` if the owner had a token. The token is cancelled after
    /// the registry lock is released, so cancellation callbacks may use the
    /// registry.
    pub fn cancel(&self, owner: &ThumbnailOwner) -> bool {
        let token = self.lock().remove(&owner.id());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove and cancel every token
    ///
    /// Returns the number of owners cancelled.
    pub fn cancel_all(&self) -> usize {
        let tokens: Vec<_> = self.lock().drain().map(|(_, token)| token).collect();
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    /// Get the number of owners with a live token
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for OwnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
