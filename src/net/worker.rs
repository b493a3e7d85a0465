use std::{
    collections::VecDeque,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering::*},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, debug_span, error, warn};

use super::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerKind {
    /// Runs receptors for messages read off a socket.
    Reader,
    /// Runs affectors for messages flushed to a socket.
    Writer,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerKind::Reader => "reader",
            WorkerKind::Writer => "writer",
        })
    }
}

/// What a pool's workers do with each job.
pub trait Dispatch<J>: Send + Sync {
    fn dispatch(&self, job: J) -> Result<(), Error>;
}

/// Outcome of [`WorkerPool::submit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    /// The queue was full. The job was kept in the pool's rejected queue and
    /// will run once [`WorkerPool::retry_rejected`] finds room for it.
    /// `first` is set when this rejection started a backpressure episode.
    Rejected { first: bool },
    /// The pool has been shut down and the job was dropped.
    Closed,
}

#[derive(Debug, Default)]
pub struct PoolMetrics {
    active: AtomicU64,
    total_created: AtomicU64,
    total_successful: AtomicU64,
    total_rejected: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub active: u64,
    pub total_created: u64,
    pub total_successful: u64,
    pub total_rejected: u64,
    pub queued: usize,
    pub rejected_backlog: usize,
    pub backpressure_initiated: bool,
}

struct ActiveGuard<'a>(&'a AtomicU64);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, SeqCst);
    }
}

/// A fixed set of named threads draining a bounded queue. Handler logic runs
/// here and never on a reactor thread. A full queue is not an error: the job
/// is parked in a side queue and the caller is told so it can ask the peer
/// to slow down.
pub struct WorkerPool<J> {
    kind: WorkerKind,
    port: u16,
    capacity: usize,
    tx: Mutex<Option<mpsc::Sender<J>>>,
    rejected: Mutex<VecDeque<J>>,
    backpressure_initiated: AtomicBool,
    metrics: Arc<PoolMetrics>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<J: Send + 'static> WorkerPool<J> {
    pub fn new(
        kind: WorkerKind,
        port: u16,
        threads: usize,
        capacity: usize,
        dispatch: Arc<dyn Dispatch<J>>,
    ) -> Result<Self, Error> {
        let (tx, rx) = mpsc::channel::<J>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let metrics = Arc::new(PoolMetrics::default());
        let mut handles = Vec::with_capacity(threads);
        for id in 0..threads.max(1) {
            let rx = rx.clone();
            let dispatch = dispatch.clone();
            let metrics = metrics.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}-{}", kind, port, id))
                .spawn(move || {
                    let span = debug_span!("worker", %kind, port, id);
                    let _guard = span.enter();
                    loop {
                        let job = rx
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .blocking_recv();
                        let Some(job) = job else {
                            debug!("queue closed, stopping");
                            break;
                        };
                        metrics.active.fetch_add(1, SeqCst);
                        let _active = ActiveGuard(&metrics.active);
                        match catch_unwind(AssertUnwindSafe(|| dispatch.dispatch(job))) {
                            Ok(Ok(())) => {
                                metrics.total_successful.fetch_add(1, SeqCst);
                            }
                            Ok(Err(e)) => debug!("job failed: {}", e),
                            Err(_) => error!("job panicked"),
                        }
                    }
                })?;
            handles.push(handle);
        }
        Ok(Self {
            kind,
            port,
            capacity: capacity.max(1),
            tx: Mutex::new(Some(tx)),
            rejected: Mutex::new(VecDeque::new()),
            backpressure_initiated: AtomicBool::new(false),
            metrics,
            threads: Mutex::new(handles),
        })
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    fn sender(&self) -> Option<mpsc::Sender<J>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Queues a job. Once anything has been rejected, new jobs queue up
    /// behind the rejected ones so a connection's messages keep their order.
    pub fn submit(&self, job: J) -> Submission {
        let Some(tx) = self.sender() else {
            return Submission::Closed;
        };
        let mut rejected = self.rejected.lock().unwrap_or_else(PoisonError::into_inner);
        let job = if rejected.is_empty() {
            match tx.try_send(job) {
                Ok(()) => {
                    self.metrics.total_created.fetch_add(1, SeqCst);
                    return Submission::Accepted;
                }
                Err(TrySendError::Full(job)) => job,
                Err(TrySendError::Closed(_)) => return Submission::Closed,
            }
        } else {
            job
        };
        rejected.push_back(job);
        self.metrics.total_rejected.fetch_add(1, SeqCst);
        let first = self
            .backpressure_initiated
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok();
        if first {
            warn!(kind = %self.kind, port = self.port, "worker pool saturated");
        }
        Submission::Rejected { first }
    }

    /// Moves rejected jobs back onto the queue while there's room. Returns
    /// how many were moved.
    pub fn retry_rejected(&self) -> usize {
        let Some(tx) = self.sender() else {
            return 0;
        };
        let mut rejected = self.rejected.lock().unwrap_or_else(PoisonError::into_inner);
        let mut moved = 0;
        while let Some(job) = rejected.pop_front() {
            match tx.try_send(job) {
                Ok(()) => {
                    self.metrics.total_created.fetch_add(1, SeqCst);
                    moved += 1;
                }
                Err(TrySendError::Full(job)) => {
                    rejected.push_front(job);
                    break;
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }
        moved
    }

    /// Jobs waiting in the queue, not counting rejected ones.
    pub fn queued(&self) -> usize {
        self.sender()
            .map_or(0, |tx| self.capacity.saturating_sub(tx.capacity()))
    }

    pub fn rejected_backlog(&self) -> usize {
        self.rejected.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True once nothing is waiting in the rejected queue and the queue is at
    /// most half full.
    pub fn is_relieved(&self) -> bool {
        self.rejected_backlog() == 0 && self.queued() <= self.capacity / 2
    }

    pub fn backpressure_initiated(&self) -> bool {
        self.backpressure_initiated.load(SeqCst)
    }

    /// Ends a backpressure episode, returning whether one was in progress.
    pub fn clear_backpressure(&self) -> bool {
        self.backpressure_initiated.swap(false, SeqCst)
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            active: self.metrics.active.load(SeqCst),
            total_created: self.metrics.total_created.load(SeqCst),
            total_successful: self.metrics.total_successful.load(SeqCst),
            total_rejected: self.metrics.total_rejected.load(SeqCst),
            queued: self.queued(),
            rejected_backlog: self.rejected_backlog(),
            backpressure_initiated: self.backpressure_initiated(),
        }
    }

    /// Closes the queue and waits for the workers to finish what's already
    /// queued. Rejected jobs are dropped. Blocks, so call it off the async
    /// runtime.
    pub fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let dropped = std::mem::take(&mut *self.rejected.lock().unwrap_or_else(PoisonError::into_inner));
        if !dropped.is_empty() {
            warn!(kind = %self.kind, port = self.port, "dropping {} rejected jobs", dropped.len());
        }
        let handles = std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if handle.join().is_err() {
                error!(kind = %self.kind, port = self.port, "worker thread panicked");
            }
        }
    }
}
