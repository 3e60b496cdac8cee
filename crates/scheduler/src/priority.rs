//! Priority ordering for queued thumbnail requests
//!
//! Requests are dequeued by priority, highest first, then in the order they
//! were queued.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Thumbnail request priority
///
/// Higher values are dequeued first. Requests from the active owner are
/// raised to [`ThumbnailPriority::Critical`] when they are queued or join a
/// queued request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThumbnailPriority {
    /// Prefetch for rows outside the viewport
    Low = 0,

    /// Visible thumbnails in a background view
    #[default]
    Normal = 1,

    /// Visible thumbnails in the focused view
    Critical = 2,
}

/// A queued item with its effective priority
struct Entry<T> {
    item: T,
    priority: ThumbnailPriority,
    insertion_order: u64,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.insertion_order == other.insertion_order
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            // BinaryHeap is a max heap, so earlier insertions must compare greater
            Ordering::Equal => other.insertion_order.cmp(&self.insertion_order),
            ordering => ordering,
        }
    }
}

/// Priority queue of pending thumbnail work
///
/// Not synchronized; the orchestrator guards it with the same mutex its
/// dispatcher waits on.
pub(crate) struct RequestQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    insertion_counter: u64,
}

impl<T> Default for RequestQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            insertion_counter: 0,
        }
    }
}

impl<T> RequestQueue<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, item: T, priority: ThumbnailPriority) {
        let insertion_order = self.insertion_counter;
        self.insertion_counter += 1;
        self.heap.push(Entry {
            item,
            priority,
            insertion_order,
        });
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        self.heap.pop().map(|entry| entry.item)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove every item matching the predicate and return them
    pub(crate) fn remove_if<F>(&mut self, mut predicate: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .partition(|entry| predicate(&entry.item));
        self.heap = BinaryHeap::from(kept);
        removed.into_iter().map(|entry| entry.item).collect()
    }

    /// Raise matching items to at least `priority`
    ///
    /// Raised items keep their original queue position among items of the
    /// new priority. Returns the number of items raised.
    pub(crate) fn reprioritize<F>(&mut self, mut predicate: F, priority: ThumbnailPriority) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        let mut raised = 0;
        for entry in &mut entries {
            if entry.priority < priority && predicate(&entry.item) {
                entry.priority = priority;
                raised += 1;
            }
        }
        self.heap = BinaryHeap::from(entries);
        raised
    }

    /// Remove every item
    pub(crate) fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .map(|entry| entry.item)
            .collect()
    }
}
