//! Decode worker pool.
//!
//! A fixed set of named threads that pull jobs from a shared channel and hand
//! each one to an executor callback. The dispatcher decides what runs and when;
//! the pool only provides the threads.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Callback invoked by a worker for each job it receives.
pub type JobExecutor<J> = Arc<dyn Fn(J) + Send + Sync>;

/// Fixed-size pool of worker threads.
pub struct WorkerPool<J: Send + 'static> {
    sender: Option<Sender<J>>,
    workers: Vec<Worker>,
    finished: Receiver<usize>,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Create and start a pool with `num_workers` threads (at least one).
    ///
    /// Threads are named `{name}-{index}`.
    pub fn new(name: &str, num_workers: usize, executor: JobExecutor<J>) -> Self {
        let (sender, receiver) = mpsc::channel::<J>();
        let receiver = Arc::new(Mutex::new(receiver));
        let (finished_tx, finished) = mpsc::channel();

        let workers = (0..num_workers.max(1))
            .map(|id| {
                Worker::new(
                    id,
                    format!("{name}-{id}"),
                    Arc::clone(&receiver),
                    Arc::clone(&executor),
                    finished_tx.clone(),
                )
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
            finished,
        }
    }

    /// Get the number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Hand a job to the next idle worker.
    ///
    /// Gives the job back if the pool has shut down.
    pub fn dispatch(&self, job: J) -> Result<(), J> {
        match &self.sender {
            Some(sender) => sender.send(job).map_err(|error| error.0),
            None => Err(job),
        }
    }

    /// Stop accepting jobs and wait up to `timeout` for workers to exit.
    ///
    /// Jobs already dispatched still run. Workers that have not exited when
    /// the timeout elapses are detached.
    pub fn shutdown(mut self, timeout: Duration) {
        self.sender = None;

        let deadline = Instant::now() + timeout;
        let mut remaining = self.workers.len();
        while remaining > 0 {
            let wait = deadline.saturating_duration_since(Instant::now());
            match self.finished.recv_timeout(wait) {
                Ok(id) => {
                    if let Some(worker) = self.workers.iter_mut().find(|w| w.id == id) {
                        worker.join();
                    }
                    remaining -= 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "{} decode worker(s) still busy after {:?}, detaching",
                        remaining,
                        timeout
                    );
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

/// A single worker thread.
struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn new<J: Send + 'static>(
        id: usize,
        name: String,
        receiver: Arc<Mutex<Receiver<J>>>,
        executor: JobExecutor<J>,
        finished: Sender<usize>,
    ) -> Self {
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                Self::run(receiver, executor);
                let _ = finished.send(id);
            })
            .expect("Failed to spawn decode worker thread");

        Self {
            id,
            thread: Some(thread),
        }
    }

    /// Main worker loop.
    ///
    /// Runs until the pool drops its sender.
    fn run<J>(receiver: Arc<Mutex<Receiver<J>>>, executor: JobExecutor<J>) {
        loop {
            let job = {
                let receiver = match receiver.lock() {
                    Ok(receiver) => receiver,
                    Err(poisoned) => poisoned.into_inner(),
                };
                receiver.recv()
            };

            match job {
                Ok(job) => executor(job),
                Err(_) => break,
            }
        }
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("decode worker {} panicked", self.id);
            }
        }
    }
}
