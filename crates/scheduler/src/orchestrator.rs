//! Thumbnail request orchestrator
//!
//! Accepts thumbnail requests from any thread, collapses duplicate requests
//! for the same path, orders queued work by priority, and hands decodes to a
//! worker pool bounded by the cache's decode permits.

use crate::completion::{Completion, PendingThumbnail};
use crate::flight::{Attach, Flight, Waiter, WaiterId};
use crate::owner::{OwnerRegistry, ThumbnailOwner};
use crate::priority::{RequestQueue, ThumbnailPriority};
use crate::worker::{JobExecutor, WorkerPool};
use lora_manager_cache::{
    cache_key, is_video_path, CacheStats, CancellationToken, DecodePermit, ImageDecoder,
    SharedBitmap, ThumbnailCache, ThumbnailConfig,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the dispatcher sleeps between shutdown checks when idle
const WORK_POLL_INTERVAL: Duration = Duration::from_millis(100);

const DISPATCH_THREAD_NAME: &str = "thumbnail-dispatch";
const DECODE_THREAD_NAME: &str = "thumbnail-decode";

/// Request counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestStats {
    /// Requests that started a new decode
    pub submitted: u64,

    /// Requests answered from the cache, on request or on dequeue
    pub cache_hits: u64,

    /// Requests that joined an identical in-flight request
    pub joined: u64,

    /// Decodes handed to a worker
    pub decodes: u64,

    /// Requests resolved empty by their own cancellation
    pub cancelled: u64,

    /// Current queue length
    pub pending: usize,

    /// Current number of distinct paths in flight
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    cache_hits: AtomicU64,
    joined: AtomicU64,
    decodes: AtomicU64,
    cancelled: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A flight paired with the permit it will decode under
struct DecodeJob {
    flight: Arc<Flight>,
    permit: DecodePermit,
}

/// State shared with the dispatch thread and decode workers
///
/// Lock order: `in_flight` before a flight's state, `queue` before a
/// flight's state. A flight's state is never held while taking either.
struct Shared {
    cache: Arc<ThumbnailCache>,
    queue: Mutex<RequestQueue<Arc<Flight>>>,
    work_available: Condvar,
    in_flight: Mutex<HashMap<String, Arc<Flight>>>,
    owners: OwnerRegistry,
    active_owner: Mutex<Option<ThumbnailOwner>>,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
    counters: Counters,
}

impl Shared {
    /// Block until the queue has work; `false` once shutting down
    fn wait_for_work(&self) -> bool {
        let mut queue = lock(&self.queue);
        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }
            if !queue.is_empty() {
                return true;
            }
            queue = match self.work_available.wait_timeout(queue, WORK_POLL_INTERVAL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Join the live flight for `key` or start a new one
    fn attach(
        &self,
        key: String,
        path: &Path,
        target_width: u32,
        waiter: Waiter,
        priority: ThumbnailPriority,
    ) -> (Arc<Flight>, Attach) {
        let mut in_flight = lock(&self.in_flight);
        let waiter = match in_flight.get(&key) {
            Some(existing) => match existing.join(waiter, priority) {
                Ok(attach) => return (Arc::clone(existing), attach),
                Err(waiter) => waiter,
            },
            None => waiter,
        };

        let flight = Arc::new(Flight::new(
            key.clone(),
            path.to_path_buf(),
            target_width,
            self.shutdown.child(),
            waiter,
            priority,
        ));
        in_flight.insert(key, Arc::clone(&flight));
        (flight, Attach::Created)
    }

    /// Pop flights until one actually needs a decode
    fn next_dispatchable(&self) -> Option<Arc<Flight>> {
        loop {
            let flight = lock(&self.queue).pop()?;

            if !flight.start() {
                self.finish(&flight, None);
                continue;
            }
            if let Some(bitmap) = self.cache.try_get_cached(&flight.path) {
                log::trace!("cache hit on dequeue for {}", flight.path.display());
                bump(&self.counters.cache_hits);
                self.finish(&flight, Some(bitmap));
                continue;
            }
            return Some(flight);
        }
    }

    fn run_decode(&self, job: DecodeJob) {
        let DecodeJob { flight, permit } = job;
        let result =
            self.cache
                .load_with_permit(&flight.path, flight.target_width, &flight.cancel, permit);
        self.finish(&flight, result);
    }

    fn finish(&self, flight: &Arc<Flight>, result: Option<SharedBitmap>) {
        flight.finish(result);
        self.forget_in_flight(flight);
    }

    /// Drop the in-flight entry for the flight's key if it is still this flight
    fn forget_in_flight(&self, flight: &Arc<Flight>) {
        let mut in_flight = lock(&self.in_flight);
        if in_flight
            .get(&flight.key)
            .is_some_and(|current| Arc::ptr_eq(current, flight))
        {
            in_flight.remove(&flight.key);
        }
    }

    /// Finish flights that lost every waiter while queued
    fn purge_abandoned(&self) -> usize {
        let purged = lock(&self.queue).remove_if(|flight| !flight.is_live());
        for flight in &purged {
            self.finish(flight, None);
        }
        purged.len()
    }

    fn is_active(&self, owner: &ThumbnailOwner) -> bool {
        lock(&self.active_owner).as_ref() == Some(owner)
    }
}

fn run_dispatch_loop(shared: &Shared, pool: WorkerPool<DecodeJob>) {
    while shared.wait_for_work() {
        // Priority is decided only once a decode slot is free
        let Some(permit) = shared.cache.permits().acquire(&shared.shutdown) else {
            break;
        };
        let Some(flight) = shared.next_dispatchable() else {
            continue;
        };

        log::trace!(
            "dispatching {:?} thumbnail decode for {}",
            flight.priority(),
            flight.path.display()
        );
        bump(&shared.counters.decodes);
        if let Err(job) = pool.dispatch(DecodeJob { flight, permit }) {
            shared.finish(&job.flight, None);
        }
    }

    pool.shutdown(shared.shutdown_timeout);
}

/// Handle to the dispatch thread
struct Dispatcher {
    thread: JoinHandle<()>,
    finished: Receiver<()>,
}

impl Dispatcher {
    fn spawn(shared: Arc<Shared>) -> Self {
        let executor: JobExecutor<DecodeJob> = {
            let shared = Arc::clone(&shared);
            Arc::new(move |job| shared.run_decode(job))
        };
        let pool = WorkerPool::new(
            DECODE_THREAD_NAME,
            shared.cache.permits().limit(),
            executor,
        );

        let (finished_tx, finished) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(DISPATCH_THREAD_NAME.to_string())
            .spawn(move || {
                run_dispatch_loop(&shared, pool);
                let _ = finished_tx.send(());
            })
            .expect("Failed to spawn thumbnail dispatch thread");

        Self { thread, finished }
    }

    fn join(self, timeout: Duration) {
        match self.finished.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.thread.join().is_err() {
                    log::error!("thumbnail dispatch thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "thumbnail dispatcher still busy after {:?}, detaching",
                    timeout
                );
            }
        }
    }
}

/// Priority request orchestrator for thumbnails
///
/// Any thread may call into the orchestrator. Decodes run on dedicated worker
/// threads; results are delivered through [`PendingThumbnail`] handles.
///
/// - Only one decode runs per path at a time; concurrent callers share it.
/// - Queued requests are dequeued by effective priority, then FIFO.
/// - Requests from the active owner are queued as
///   [`ThumbnailPriority::Critical`], and raise a queued request they join.
/// - Cancelling an owner resolves its own requests to `None`. A shared
///   decode keeps running for the other callers and is dropped only when
///   every caller has cancelled.
///
/// # Example
///
/// ```
/// use lora_manager_cache::{Bitmap, CancellationToken, ImageDecoder, ThumbnailCache};
/// use lora_manager_scheduler::{ThumbnailOrchestrator, ThumbnailOwner, ThumbnailPriority};
/// use std::path::Path;
/// use std::sync::Arc;
///
/// let decoder: Arc<dyn ImageDecoder> =
///     Arc::new(|_: &Path, width: u32| Some(Bitmap::solid(width, width, [0, 0, 0, 255])));
/// let cache = Arc::new(ThumbnailCache::new(decoder, 100, 2));
/// let orchestrator = ThumbnailOrchestrator::new(cache);
///
/// let gallery = ThumbnailOwner::new();
/// orchestrator.set_active_owner(&gallery);
///
/// let pending = orchestrator.request_thumbnail(
///     "dataset/001.png",
///     &gallery,
///     ThumbnailPriority::Normal,
///     64,
///     &CancellationToken::new(),
/// );
/// let bitmap = pending.wait().unwrap();
/// assert_eq!(bitmap.width, 64);
///
/// orchestrator.shutdown();
/// ```
pub struct ThumbnailOrchestrator {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl ThumbnailOrchestrator {
    /// Create an orchestrator over `cache` with the default configuration
    pub fn new(cache: Arc<ThumbnailCache>) -> Self {
        Self::with_config(cache, &ThumbnailConfig::default())
    }

    /// Create an orchestrator over `cache`
    ///
    /// Only the shutdown timeout is taken from `config`; capacity and decode
    /// concurrency belong to the cache.
    pub fn with_config(cache: Arc<ThumbnailCache>, config: &ThumbnailConfig) -> Self {
        let shared = Arc::new(Shared {
            cache,
            queue: Mutex::new(RequestQueue::new()),
            work_available: Condvar::new(),
            in_flight: Mutex::new(HashMap::new()),
            owners: OwnerRegistry::new(),
            active_owner: Mutex::new(None),
            shutdown: CancellationToken::new(),
            shutdown_timeout: config.shutdown_timeout(),
            counters: Counters::default(),
        });
        let dispatcher = Dispatcher::spawn(Arc::clone(&shared));

        Self {
            shared,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Build the cache and the orchestrator from one configuration
    pub fn from_config(decoder: Arc<dyn ImageDecoder>, config: &ThumbnailConfig) -> Self {
        let cache = Arc::new(ThumbnailCache::with_config(decoder, config));
        Self::with_config(cache, config)
    }

    /// The underlying cache
    pub fn cache(&self) -> &Arc<ThumbnailCache> {
        &self.shared.cache
    }

    /// Request a thumbnail
    ///
    /// Cached thumbnails come back already resolved. Otherwise the request
    /// joins an identical in-flight request or is queued. Every call gets its
    /// own handle, which resolves to `None` on decode failure or when the
    /// caller's token, the owner's token or orchestrator shutdown cancels it.
    /// Cancelling one caller never resolves another caller's handle.
    pub fn request_thumbnail(
        &self,
        path: impl AsRef<Path>,
        owner: &ThumbnailOwner,
        priority: ThumbnailPriority,
        target_width: u32,
        cancel: &CancellationToken,
    ) -> PendingThumbnail {
        let path = path.as_ref();
        let shared = &self.shared;

        if path.as_os_str().is_empty() || shared.shutdown.is_cancelled() || cancel.is_cancelled()
        {
            return PendingThumbnail::unavailable();
        }
        if let Some(bitmap) = shared.cache.try_get_cached(path) {
            bump(&shared.counters.cache_hits);
            return PendingThumbnail::ready(bitmap);
        }
        if is_video_path(path) {
            return match shared.cache.load(path, target_width, cancel) {
                Some(bitmap) => PendingThumbnail::ready(bitmap),
                None => PendingThumbnail::unavailable(),
            };
        }

        let priority = if shared.is_active(owner) {
            ThumbnailPriority::Critical
        } else {
            priority
        };

        let completion = Arc::new(Completion::new());
        let owner_token = shared.owners.token_for(owner);
        let linked = CancellationToken::linked(&[cancel, &owner_token, &shared.shutdown]);
        let waiter = Waiter::new(Arc::clone(&completion), linked.clone());
        let waiter_id = waiter.id();

        let (flight, attach) = shared.attach(cache_key(path), path, target_width, waiter, priority);
        {
            let shared = Arc::downgrade(&self.shared);
            let flight = Arc::downgrade(&flight);
            let completion = Arc::clone(&completion);
            linked.on_cancel(move || resolve_cancelled(&shared, &flight, waiter_id, &completion));
        }

        match attach {
            Attach::Created => {
                bump(&shared.counters.submitted);
                if flight.is_live() {
                    let mut queue = lock(&shared.queue);
                    let priority = flight.priority();
                    queue.push(Arc::clone(&flight), priority);
                    drop(queue);
                    shared.work_available.notify_one();
                }
            }
            Attach::Joined => {
                log::trace!("joining in-flight thumbnail request for {}", path.display());
                bump(&shared.counters.joined);
            }
            Attach::Raised(raised) => {
                log::trace!(
                    "joining in-flight thumbnail request for {} at {:?}",
                    path.display(),
                    raised
                );
                bump(&shared.counters.joined);
                lock(&shared.queue).reprioritize(|queued| Arc::ptr_eq(queued, &flight), raised);
            }
        }

        PendingThumbnail::new(completion)
    }

    /// Look up a cached thumbnail without queuing anything
    pub fn try_get_cached(&self, path: impl AsRef<Path>) -> Option<SharedBitmap> {
        self.shared.cache.try_get_cached(path.as_ref())
    }

    /// Make `owner` the active owner
    ///
    /// Only requests made after this call are boosted; queued requests keep
    /// their priority and nothing is cancelled.
    pub fn set_active_owner(&self, owner: &ThumbnailOwner) {
        *lock(&self.shared.active_owner) = Some(owner.clone());
    }

    /// The current active owner, if any has been set
    pub fn active_owner(&self) -> Option<ThumbnailOwner> {
        lock(&self.shared.active_owner).clone()
    }

    /// Cancel every outstanding request from `owner`
    ///
    /// The owner's handles resolve to `None`. Queued decodes that no other
    /// caller is waiting on are removed, and running ones observe the
    /// cancellation. The owner's next request gets a fresh token. Returns the
    /// number of queued decodes removed.
    pub fn cancel_requests(&self, owner: &ThumbnailOwner) -> usize {
        let shared = &self.shared;

        shared.owners.cancel(owner);
        let purged = shared.purge_abandoned();

        if purged > 0 {
            log::debug!(
                "cancelled {} queued thumbnail request(s) for owner {}",
                purged,
                owner.id()
            );
        }
        purged
    }

    /// Remove one thumbnail from the cache
    pub fn invalidate(&self, path: impl AsRef<Path>) -> bool {
        self.shared.cache.invalidate(path.as_ref())
    }

    /// Remove every thumbnail from the cache
    pub fn clear_cache(&self) {
        self.shared.cache.clear_cache();
    }

    /// Cache statistics
    pub fn stats(&self) -> CacheStats {
        self.shared.cache.stats()
    }

    /// Number of queued requests
    pub fn pending_requests(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Number of distinct paths with an unresolved request
    pub fn in_flight(&self) -> usize {
        lock(&self.shared.in_flight).len()
    }

    /// Request counters
    pub fn request_stats(&self) -> RequestStats {
        let counters = &self.shared.counters;
        RequestStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            joined: counters.joined.load(Ordering::Relaxed),
            decodes: counters.decodes.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            pending: self.pending_requests(),
            in_flight: self.in_flight(),
        }
    }

    /// Check if the orchestrator has been shut down
    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Stop the orchestrator
    ///
    /// Every outstanding request resolves to `None`. Waits up to the
    /// configured shutdown timeout for the dispatch and decode threads, then
    /// detaches any that are still busy. Later requests resolve to `None`
    /// immediately. Calling this more than once is a no-op.
    pub fn shutdown(&self) {
        let Some(dispatcher) = lock(&self.dispatcher).take() else {
            return;
        };
        let shared = &self.shared;

        shared.shutdown.cancel();
        shared.owners.cancel_all();

        let drained = lock(&shared.queue).drain();
        for flight in &drained {
            shared.finish(flight, None);
        }
        shared.work_available.notify_all();

        log::debug!(
            "thumbnail orchestrator shutting down, {} queued request(s) dropped",
            drained.len()
        );
        dispatcher.join(shared.shutdown_timeout);
    }
}

impl Drop for ThumbnailOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resolve one cancelled caller and release the flight if it was the last
fn resolve_cancelled(
    shared: &Weak<Shared>,
    flight: &Weak<Flight>,
    waiter: WaiterId,
    completion: &Completion,
) {
    let resolved = completion.complete(None);
    let abandoned = flight.upgrade().map(|flight| (flight.detach(waiter), flight));

    if let Some(shared) = shared.upgrade() {
        if resolved {
            bump(&shared.counters.cancelled);
        }
        if let Some((true, flight)) = abandoned {
            shared.forget_in_flight(&flight);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ThumbnailState;
    use lora_manager_cache::Bitmap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(5);

    /// Decoder that blocks until released and records decode order
    struct GateDecoder {
        open: Mutex<bool>,
        opened: Condvar,
        started: AtomicUsize,
        order: Mutex<Vec<String>>,
        failing: Vec<&'static str>,
    }

    impl GateDecoder {
        fn closed() -> Arc<Self> {
            Arc::new(Self {
                open: Mutex::new(false),
                opened: Condvar::new(),
                started: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
                failing: Vec::new(),
            })
        }

        fn open() -> Arc<Self> {
            let decoder = Self::closed();
            decoder.release();
            decoder
        }

        fn failing(paths: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                open: Mutex::new(true),
                opened: Condvar::new(),
                started: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
                failing: paths,
            })
        }

        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.opened.notify_all();
        }

        fn started(&self) -> usize {
            self.started.load(Ordering::SeqCst)
        }

        fn order(&self) -> Vec<String> {
            self.order.lock().unwrap().clone()
        }

        fn decodes_of(&self, name: &str) -> usize {
            self.order().iter().filter(|entry| *entry == name).count()
        }
    }

    impl ImageDecoder for GateDecoder {
        fn decode(&self, path: &Path, target_width: u32) -> Option<Bitmap> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.opened.wait(open).unwrap();
            }
            drop(open);

            let name = path.to_string_lossy().into_owned();
            self.order.lock().unwrap().push(name.clone());
            if self.failing.contains(&name.as_str()) {
                return None;
            }
            Some(Bitmap::solid(target_width.max(1), target_width.max(1), [1, 2, 3, 255]))
        }
    }

    fn orchestrator(decoder: Arc<GateDecoder>, decodes: usize) -> ThumbnailOrchestrator {
        let config = ThumbnailConfig::default()
            .with_capacity(50)
            .with_max_concurrent_decodes(decodes)
            .with_shutdown_timeout(Duration::from_secs(2));
        ThumbnailOrchestrator::from_config(decoder, &config)
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn request(
        orchestrator: &ThumbnailOrchestrator,
        path: &str,
        owner: &ThumbnailOwner,
        priority: ThumbnailPriority,
    ) -> PendingThumbnail {
        orchestrator.request_thumbnail(path, owner, priority, 32, &CancellationToken::new())
    }

    fn is_unavailable(state: ThumbnailState) -> bool {
        matches!(state, ThumbnailState::Unavailable)
    }

    #[test]
    fn test_decode_and_cache() {
        let decoder = GateDecoder::open();
        let orchestrator = orchestrator(decoder.clone(), 2);
        let owner = ThumbnailOwner::new();

        let bitmap = request(&orchestrator, "a.png", &owner, ThumbnailPriority::Normal)
            .wait()
            .unwrap();
        assert_eq!(bitmap.width, 32);

        let cached = orchestrator.try_get_cached("A.PNG").unwrap();
        assert!(Arc::ptr_eq(&cached, &bitmap));
        assert_eq!(orchestrator.in_flight(), 0);
    }

    #[test]
    fn test_cached_request_resolves_immediately() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 1);
        let bitmap = Bitmap::solid(4, 4, [0; 4]).into_shared();
        orchestrator.cache().insert(Path::new("hit.png"), bitmap.clone());

        let pending = request(
            &orchestrator,
            "hit.png",
            &ThumbnailOwner::new(),
            ThumbnailPriority::Low,
        );

        assert!(pending.is_resolved());
        assert!(Arc::ptr_eq(&pending.wait().unwrap(), &bitmap));
        assert_eq!(decoder.started(), 0);
        assert_eq!(orchestrator.request_stats().cache_hits, 1);
    }

    #[test]
    fn test_single_flight_across_owners() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 2);
        let owner_a = ThumbnailOwner::new();
        let owner_b = ThumbnailOwner::new();

        let first = request(&orchestrator, "x.png", &owner_a, ThumbnailPriority::Normal);
        wait_until(|| decoder.started() == 1);
        let second = request(&orchestrator, "x.png", &owner_b, ThumbnailPriority::Critical);

        assert!(!first.same_request(&second));
        assert_eq!(orchestrator.in_flight(), 1);

        decoder.release();
        let a = first.wait().unwrap();
        let b = second.wait().unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(decoder.decodes_of("x.png"), 1);
        assert_eq!(orchestrator.request_stats().joined, 1);
    }

    #[test]
    fn test_single_flight_under_contention() {
        let decoder = GateDecoder::closed();
        let orchestrator = Arc::new(orchestrator(decoder.clone(), 4));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let orchestrator = orchestrator.clone();
                thread::spawn(move || {
                    request(
                        &orchestrator,
                        "shared.png",
                        &ThumbnailOwner::new(),
                        ThumbnailPriority::Normal,
                    )
                })
            })
            .collect();
        let pending: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        decoder.release();
        let bitmaps: Vec<_> = pending.iter().map(|p| p.wait().unwrap()).collect();

        assert!(bitmaps.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(decoder.decodes_of("shared.png"), 1);
    }

    #[test]
    fn test_priority_ordering() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 1);
        let owner = ThumbnailOwner::new();

        let blocker = request(&orchestrator, "blocker.png", &owner, ThumbnailPriority::Low);
        wait_until(|| decoder.started() == 1);

        let low = request(&orchestrator, "low.png", &owner, ThumbnailPriority::Low);
        let normal = request(&orchestrator, "normal.png", &owner, ThumbnailPriority::Normal);
        let critical = request(&orchestrator, "critical.png", &owner, ThumbnailPriority::Critical);

        decoder.release();
        for pending in [&blocker, &low, &normal, &critical] {
            assert!(pending.wait().is_some());
        }

        assert_eq!(
            decoder.order(),
            ["blocker.png", "critical.png", "normal.png", "low.png"]
        );
    }

    #[test]
    fn test_fifo_within_priority() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 1);
        let owner = ThumbnailOwner::new();

        let blocker = request(&orchestrator, "blocker.png", &owner, ThumbnailPriority::Normal);
        wait_until(|| decoder.started() == 1);

        let queued: Vec<_> = ["1.png", "2.png", "3.png"]
            .iter()
            .map(|path| request(&orchestrator, path, &owner, ThumbnailPriority::Normal))
            .collect();

        decoder.release();
        blocker.wait();
        queued.iter().for_each(|pending| {
            pending.wait();
        });

        assert_eq!(decoder.order(), ["blocker.png", "1.png", "2.png", "3.png"]);
    }

    #[test]
    fn test_active_owner_boost() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 1);
        let owner_a = ThumbnailOwner::new();
        let owner_b = ThumbnailOwner::new();

        let blocker = request(&orchestrator, "blocker.png", &owner_b, ThumbnailPriority::Normal);
        wait_until(|| decoder.started() == 1);

        orchestrator.set_active_owner(&owner_a);
        assert_eq!(orchestrator.active_owner(), Some(owner_a.clone()));

        let background = request(&orchestrator, "b.png", &owner_b, ThumbnailPriority::Normal);
        let focused = request(&orchestrator, "a.png", &owner_a, ThumbnailPriority::Low);

        decoder.release();
        for pending in [&blocker, &background, &focused] {
            pending.wait();
        }

        assert_eq!(decoder.order(), ["blocker.png", "a.png", "b.png"]);
    }

    #[test]
    fn test_active_owner_change_is_not_retroactive() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 1);
        let owner_a = ThumbnailOwner::new();
        let owner_b = ThumbnailOwner::new();

        let blocker = request(&orchestrator, "blocker.png", &owner_b, ThumbnailPriority::Normal);
        wait_until(|| decoder.started() == 1);

        let early = request(&orchestrator, "early.png", &owner_a, ThumbnailPriority::Low);
        orchestrator.set_active_owner(&owner_a);
        let later = request(&orchestrator, "later.png", &owner_b, ThumbnailPriority::Normal);

        assert!(!early.is_resolved());

        decoder.release();
        for pending in [&blocker, &early, &later] {
            pending.wait();
        }

        assert_eq!(decoder.order(), ["blocker.png", "later.png", "early.png"]);
    }

    #[test]
    fn test_cancel_requests_for_owner() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 1);
        let owner_a = ThumbnailOwner::new();
        let owner_b = ThumbnailOwner::new();

        let blocker = request(&orchestrator, "blocker.png", &owner_b, ThumbnailPriority::Normal);
        wait_until(|| decoder.started() == 1);

        let a1 = request(&orchestrator, "a1.png", &owner_a, ThumbnailPriority::Normal);
        let a2 = request(&orchestrator, "a2.png", &owner_a, ThumbnailPriority::Critical);
        let b1 = request(&orchestrator, "b1.png", &owner_b, ThumbnailPriority::Normal);
        assert_eq!(orchestrator.pending_requests(), 3);

        assert_eq!(orchestrator.cancel_requests(&owner_a), 2);
        assert!(is_unavailable(a1.state()));
        assert!(is_unavailable(a2.state()));
        assert!(!b1.is_resolved());
        assert_eq!(orchestrator.pending_requests(), 1);

        decoder.release();
        assert!(blocker.wait().is_some());
        assert!(b1.wait().is_some());
        assert_eq!(decoder.decodes_of("a1.png"), 0);
        assert_eq!(decoder.decodes_of("a2.png"), 0);
    }

    #[test]
    fn test_cancel_running_decode() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 1);
        let owner = ThumbnailOwner::new();

        let running = request(&orchestrator, "running.png", &owner, ThumbnailPriority::Normal);
        wait_until(|| decoder.started() == 1);

        orchestrator.cancel_requests(&owner);
        assert!(is_unavailable(running.wait_timeout(WAIT)));
        assert_eq!(orchestrator.in_flight(), 0);

        // The finished decode still lands in the cache
        decoder.release();
        wait_until(|| orchestrator.try_get_cached("running.png").is_some());
    }

    #[test]
    fn test_cancel_owner_keeps_joined_request() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 1);
        let owner_a = ThumbnailOwner::new();
        let owner_b = ThumbnailOwner::new();

        let blocker = request(&orchestrator, "blocker.png", &owner_b, ThumbnailPriority::Normal);
        wait_until(|| decoder.started() == 1);

        let a = request(&orchestrator, "x.png", &owner_a, ThumbnailPriority::Normal);
        let b = request(&orchestrator, "x.png", &owner_b, ThumbnailPriority::Critical);

        assert_eq!(orchestrator.cancel_requests(&owner_a), 0);
        assert!(is_unavailable(a.state()));
        assert!(!b.is_resolved());
        assert_eq!(orchestrator.pending_requests(), 1);

        decoder.release();
        assert!(blocker.wait().is_some());
        assert!(b.wait().is_some());
        assert!(a.wait().is_none());
        assert_eq!(decoder.decodes_of("x.png"), 1);
    }

    #[test]
    fn test_first_caller_token_keeps_joined_request() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 1);
        let owner = ThumbnailOwner::new();

        let blocker = request(&orchestrator, "blocker.png", &owner, ThumbnailPriority::Normal);
        wait_until(|| decoder.started() == 1);

        let token_a = CancellationToken::new();
        let a = orchestrator.request_thumbnail("x.png", &owner, ThumbnailPriority::Normal, 32, &token_a);
        let b = request(&orchestrator, "x.png", &ThumbnailOwner::new(), ThumbnailPriority::Normal);

        token_a.cancel();
        assert!(is_unavailable(a.state()));
        assert!(!b.is_resolved());

        decoder.release();
        blocker.wait();
        assert!(b.wait().is_some());
        assert_eq!(decoder.decodes_of("x.png"), 1);
        assert_eq!(orchestrator.request_stats().cancelled, 1);
    }

    #[test]
    fn test_running_decode_survives_first_caller_cancel() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 1);

        let token_a = CancellationToken::new();
        let a = orchestrator.request_thumbnail(
            "x.png",
            &ThumbnailOwner::new(),
            ThumbnailPriority::Normal,
            32,
            &token_a,
        );
        wait_until(|| decoder.started() == 1);
        let b = request(&orchestrator, "x.png", &ThumbnailOwner::new(), ThumbnailPriority::Normal);

        token_a.cancel();
        assert!(is_unavailable(a.state()));
        assert_eq!(orchestrator.in_flight(), 1);

        decoder.release();
        assert!(b.wait().is_some());
        assert_eq!(decoder.decodes_of("x.png"), 1);
    }

    #[test]
    fn test_joiner_token_cancels_only_joiner() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 1);
        let owner = ThumbnailOwner::new();

        let blocker = request(&orchestrator, "blocker.png", &owner, ThumbnailPriority::Normal);
        wait_until(|| decoder.started() == 1);

        let a = request(&orchestrator, "x.png", &owner, ThumbnailPriority::Normal);
        let token_b = CancellationToken::new();
        let b = orchestrator.request_thumbnail("x.png", &owner, ThumbnailPriority::Normal, 32, &token_b);

        token_b.cancel();
        assert!(is_unavailable(b.state()));
        assert!(!a.is_resolved());

        decoder.release();
        blocker.wait();
        assert!(a.wait().is_some());
        assert_eq!(decoder.decodes_of("x.png"), 1);
    }

    #[test]
    fn test_all_callers_cancelled_drops_decode() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 1);
        let owner_a = ThumbnailOwner::new();
        let owner_b = ThumbnailOwner::new();

        let blocker = request(&orchestrator, "blocker.png", &ThumbnailOwner::new(), ThumbnailPriority::Normal);
        wait_until(|| decoder.started() == 1);

        let a = request(&orchestrator, "x.png", &owner_a, ThumbnailPriority::Normal);
        let b = request(&orchestrator, "x.png", &owner_b, ThumbnailPriority::Normal);

        assert_eq!(orchestrator.cancel_requests(&owner_a), 0);
        assert_eq!(orchestrator.in_flight(), 2);
        assert_eq!(orchestrator.cancel_requests(&owner_b), 1);
        assert!(is_unavailable(a.state()));
        assert!(is_unavailable(b.state()));
        assert_eq!(orchestrator.pending_requests(), 0);
        assert_eq!(orchestrator.in_flight(), 1);

        decoder.release();
        blocker.wait();
        assert_eq!(decoder.decodes_of("x.png"), 0);
        assert_eq!(orchestrator.request_stats().cancelled, 2);

        // A fresh request after abandonment decodes normally
        assert!(request(&orchestrator, "x.png", &owner_a, ThumbnailPriority::Normal)
            .wait()
            .is_some());
        assert_eq!(decoder.decodes_of("x.png"), 1);
    }

    #[test]
    fn test_active_owner_join_raises_priority() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 1);
        let background_1 = ThumbnailOwner::new();
        let background_2 = ThumbnailOwner::new();
        let focused = ThumbnailOwner::new();

        let blocker = request(&orchestrator, "blocker.png", &background_1, ThumbnailPriority::Normal);
        wait_until(|| decoder.started() == 1);

        let prefetch = request(&orchestrator, "p.png", &background_1, ThumbnailPriority::Low);
        let normal = request(&orchestrator, "n.png", &background_2, ThumbnailPriority::Normal);

        orchestrator.set_active_owner(&focused);
        let joined = request(&orchestrator, "p.png", &focused, ThumbnailPriority::Low);
        assert_eq!(orchestrator.request_stats().joined, 1);

        decoder.release();
        for pending in [&blocker, &prefetch, &normal, &joined] {
            assert!(pending.wait().is_some());
        }

        assert_eq!(decoder.order(), ["blocker.png", "p.png", "n.png"]);
    }

    #[test]
    fn test_join_with_higher_priority_raises_queued_request() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 1);
        let owner = ThumbnailOwner::new();

        let blocker = request(&orchestrator, "blocker.png", &owner, ThumbnailPriority::Normal);
        wait_until(|| decoder.started() == 1);

        let low = request(&orchestrator, "low.png", &owner, ThumbnailPriority::Low);
        let normal = request(&orchestrator, "normal.png", &owner, ThumbnailPriority::Normal);
        let raised = request(&orchestrator, "low.png", &ThumbnailOwner::new(), ThumbnailPriority::Critical);

        decoder.release();
        for pending in [&blocker, &low, &normal, &raised] {
            pending.wait();
        }

        assert_eq!(decoder.order(), ["blocker.png", "low.png", "normal.png"]);
    }

    #[test]
    fn test_owner_usable_after_cancel() {
        let decoder = GateDecoder::open();
        let orchestrator = orchestrator(decoder, 1);
        let owner = ThumbnailOwner::new();

        orchestrator.cancel_requests(&owner);
        let pending = request(&orchestrator, "again.png", &owner, ThumbnailPriority::Normal);
        assert!(pending.wait().is_some());
    }

    #[test]
    fn test_caller_token_cancellation() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 1);
        let owner = ThumbnailOwner::new();

        let blocker = request(&orchestrator, "blocker.png", &owner, ThumbnailPriority::Normal);
        wait_until(|| decoder.started() == 1);

        let token = CancellationToken::new();
        let pending =
            orchestrator.request_thumbnail("c.png", &owner, ThumbnailPriority::Normal, 32, &token);
        token.cancel();
        assert!(is_unavailable(pending.state()));

        let already = orchestrator.request_thumbnail("d.png", &owner, ThumbnailPriority::Normal, 32, &token);
        assert!(is_unavailable(already.state()));

        decoder.release();
        blocker.wait();
        wait_until(|| orchestrator.pending_requests() == 0);
        assert_eq!(decoder.decodes_of("c.png"), 0);
        assert!(orchestrator.request_stats().cancelled >= 1);
    }

    #[test]
    fn test_failed_decode_resolves_none() {
        let decoder = GateDecoder::failing(vec!["broken.png"]);
        let orchestrator = orchestrator(decoder.clone(), 2);
        let owner = ThumbnailOwner::new();

        let pending = request(&orchestrator, "broken.png", &owner, ThumbnailPriority::Normal);
        assert!(pending.wait().is_none());
        assert!(orchestrator.try_get_cached("broken.png").is_none());
        assert_eq!(orchestrator.in_flight(), 0);

        // Not remembered as failed; a later request decodes again
        request(&orchestrator, "broken.png", &owner, ThumbnailPriority::Normal).wait();
        assert_eq!(decoder.decodes_of("broken.png"), 2);
    }

    #[test]
    fn test_empty_path_unavailable() {
        let orchestrator = orchestrator(GateDecoder::open(), 1);
        let pending = request(&orchestrator, "", &ThumbnailOwner::new(), ThumbnailPriority::Normal);
        assert!(is_unavailable(pending.state()));
    }

    #[test]
    fn test_video_placeholder_without_decode() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 1);

        let pending = orchestrator.request_thumbnail(
            "clips/intro.MP4",
            &ThumbnailOwner::new(),
            ThumbnailPriority::Normal,
            160,
            &CancellationToken::new(),
        );
        let bitmap = pending.wait().unwrap();

        assert_eq!((bitmap.width, bitmap.height), (160, 90));
        assert_eq!(decoder.started(), 0);
    }

    #[test]
    fn test_delegation() {
        let orchestrator = orchestrator(GateDecoder::open(), 2);
        let owner = ThumbnailOwner::new();

        request(&orchestrator, "one.png", &owner, ThumbnailPriority::Normal).wait();
        request(&orchestrator, "two.png", &owner, ThumbnailPriority::Normal).wait();
        assert_eq!(orchestrator.stats().count, 2);

        assert!(orchestrator.invalidate("ONE.png"));
        assert!(!orchestrator.invalidate("one.png"));
        assert_eq!(orchestrator.stats().count, 1);

        orchestrator.clear_cache();
        assert_eq!(orchestrator.stats().count, 0);
    }

    #[test]
    fn test_shutdown_resolves_pending() {
        let decoder = GateDecoder::closed();
        let orchestrator = orchestrator(decoder.clone(), 1);
        let owner = ThumbnailOwner::new();

        let running = request(&orchestrator, "running.png", &owner, ThumbnailPriority::Normal);
        wait_until(|| decoder.started() == 1);
        let queued = request(&orchestrator, "queued.png", &owner, ThumbnailPriority::Normal);

        let releaser = {
            let decoder = decoder.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                decoder.release();
            })
        };

        orchestrator.shutdown();
        releaser.join().unwrap();

        assert!(orchestrator.is_shut_down());
        assert!(is_unavailable(running.state()));
        assert!(is_unavailable(queued.state()));
        assert_eq!(orchestrator.pending_requests(), 0);

        let late = request(&orchestrator, "late.png", &owner, ThumbnailPriority::Critical);
        assert!(is_unavailable(late.state()));

        // Second call is a no-op
        orchestrator.shutdown();
    }

    #[test]
    fn test_drop_shuts_down() {
        let decoder = GateDecoder::open();
        let orchestrator = orchestrator(decoder, 2);
        let pending = request(&orchestrator, "a.png", &ThumbnailOwner::new(), ThumbnailPriority::Normal);
        pending.wait();
        drop(orchestrator);
        assert!(pending.is_resolved());
    }
}
