//! Concurrent execution of scan jobs.
//!
//! A fixed pool of workers pulls jobs FIFO from one shared queue and runs
//! each in its own isolation unit (see [`IsolationMode`]). Every submitted
//! job produces exactly one outcome, in completion order.
//!
//! There is no per-server concurrency cap: jobs against the same server run
//! as concurrently as the pool allows.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connectivity::ServerConnectivityInfo;
use crate::errors::{ScanErrorKind, SchedulerError};
use crate::scanner::{PluginRegistry, ScanCommand, ScanResult};
use crate::tls::TlsHandshaker;

pub mod worker;

pub use worker::{IsolationMode, JobExecutor};

pub type JobId = u64;

/// One scan command to run against one probed server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanJob {
    /// Assigned by the scanner on submission.
    pub id: JobId,
    pub server_info: Arc<ServerConnectivityInfo>,
    pub command: ScanCommand,
    pub timeout: Option<Duration>,
}

impl ScanJob {
    pub fn new(server_info: Arc<ServerConnectivityInfo>, command: ScanCommand) -> Self {
        Self {
            id: 0,
            server_info,
            command,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A job that ended without a result.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("job {} ({}) against {}: {kind}: {message}", .job.id, .job.command, .job.server_info.location)]
pub struct ScanError {
    pub job: ScanJob,
    pub kind: ScanErrorKind,
    pub message: String,
}

impl ScanError {
    pub fn new(job: ScanJob, kind: ScanErrorKind, message: impl Into<String>) -> Self {
        Self {
            job,
            kind,
            message: message.into(),
        }
    }
}

pub type ScanOutcome = Result<ScanResult, ScanError>;

#[derive(Debug, Clone)]
pub struct ScannerOptions {
    pub workers: usize,
    /// Applies to jobs that carry no timeout of their own.
    pub default_timeout: Option<Duration>,
    pub isolation: IsolationMode,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            default_timeout: None,
            isolation: IsolationMode::Thread,
        }
    }
}

impl ScannerOptions {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationMode) -> Self {
        self.isolation = isolation;
        self
    }
}

pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// A queued job and the batch it reports back to.
///
/// Dropping it unanswered reports the job as cancelled, so a batch always
/// receives one outcome per job.
struct QueuedJob {
    job: ScanJob,
    reply: mpsc::UnboundedSender<(ScanJob, ScanOutcome)>,
    answered: bool,
}

impl QueuedJob {
    fn answer(mut self, outcome: ScanOutcome) {
        self.answered = true;
        let _ = self.reply.send((self.job.clone(), outcome));
    }

    fn cancel(self, reason: &str) {
        let error = ScanError::new(self.job.clone(), ScanErrorKind::Cancelled, reason);
        self.answer(Err(error));
    }
}

impl Drop for QueuedJob {
    fn drop(&mut self) {
        if !self.answered {
            let error = ScanError::new(
                self.job.clone(),
                ScanErrorKind::Cancelled,
                "job was discarded before it finished",
            );
            let _ = self.reply.send((self.job.clone(), Err(error)));
        }
    }
}

type SharedQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedJob>>>;

/// Outcomes of one `submit` call, yielded as jobs complete.
pub struct ScanOutcomes {
    rx: mpsc::UnboundedReceiver<(ScanJob, ScanOutcome)>,
    remaining: usize,
}

impl ScanOutcomes {
    /// Outcomes not yet yielded.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub async fn next(&mut self) -> Option<(ScanJob, ScanOutcome)> {
        if self.remaining == 0 {
            return None;
        }
        let item = self.rx.recv().await;
        if item.is_some() {
            self.remaining -= 1;
        }
        item
    }

    /// Blocking variant of [`next`](Self::next). Must not be called from
    /// inside an async context.
    pub fn blocking_next(&mut self) -> Option<(ScanJob, ScanOutcome)> {
        if self.remaining == 0 {
            return None;
        }
        let item = self.rx.blocking_recv();
        if item.is_some() {
            self.remaining -= 1;
        }
        item
    }

    pub async fn collect_all(mut self) -> Vec<(ScanJob, ScanOutcome)> {
        let mut all = Vec::with_capacity(self.remaining);
        while let Some(item) = self.next().await {
            all.push(item);
        }
        all
    }
}

/// Runs scan jobs on a fixed pool of isolated workers.
pub struct ConcurrentScanner {
    queue: Mutex<Option<mpsc::UnboundedSender<QueuedJob>>>,
    pending: SharedQueue,
    accepting: AtomicBool,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConcurrentScanner {
    /// Starts the worker pool. Must be called inside a Tokio runtime.
    pub fn new(
        registry: Arc<PluginRegistry>,
        handshaker: Arc<dyn TlsHandshaker>,
        options: ScannerOptions,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let pending: SharedQueue = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let executor = Arc::new(JobExecutor::new(
            registry,
            handshaker,
            options.isolation.clone(),
            options.default_timeout,
        ));

        let worker_count = options.workers.max(1);
        let workers = (0..worker_count)
            .map(|index| {
                tokio::spawn(worker_loop(
                    index,
                    pending.clone(),
                    executor.clone(),
                    shutdown.subscribe(),
                ))
            })
            .collect();

        info!(
            "started {} scan workers ({:?} isolation)",
            worker_count, options.isolation
        );

        Self {
            queue: Mutex::new(Some(queue_tx)),
            pending,
            accepting: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            shutdown,
            workers: Mutex::new(workers),
        }
    }

    /// Queues `jobs` and returns immediately. Job ids are assigned here.
    pub fn submit(
        &self,
        jobs: impl IntoIterator<Item = ScanJob>,
    ) -> Result<ScanOutcomes, SchedulerError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SchedulerError::Draining);
        }
        let queue = lock(&self.queue);
        let Some(sender) = queue.as_ref() else {
            return Err(SchedulerError::Draining);
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut count = 0;
        for mut job in jobs {
            job.id = self.next_id.fetch_add(1, Ordering::SeqCst);
            debug!("queued job {} ({} against {})", job.id, job.command, job.server_info.location);
            // A send error hands the job back; dropping it reports it cancelled.
            let _ = sender.send(QueuedJob {
                job,
                reply: tx.clone(),
                answered: false,
            });
            count += 1;
        }

        Ok(ScanOutcomes {
            rx,
            remaining: count,
        })
    }

    pub fn is_draining(&self) -> bool {
        !self.accepting.load(Ordering::SeqCst)
    }

    /// Stops accepting jobs, lets queued and running jobs finish for up to
    /// `grace`, then cancels whatever is left and stops the workers.
    pub async fn drain(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        // Workers exit once the queue is empty and this sender is gone.
        drop(lock(&self.queue).take());

        let mut workers = std::mem::take(&mut *lock(&self.workers));
        let finished = tokio::time::timeout(grace, async {
            while let Some(handle) = workers.last_mut() {
                let _ = handle.await;
                workers.pop();
            }
        })
        .await;

        if finished.is_err() {
            warn!("drain grace period of {:?} elapsed, cancelling remaining jobs", grace);
            let _ = self.shutdown.send(true);
            for handle in workers {
                let _ = handle.await;
            }

            let mut pending = self.pending.lock().await;
            while let Ok(queued) = pending.try_recv() {
                queued.cancel("scanner drained before the job started");
            }
        }

        info!("scanner drained");
    }
}

impl Drop for ConcurrentScanner {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn worker_loop(
    index: usize,
    queue: SharedQueue,
    executor: Arc<JobExecutor>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => None,
                job = rx.recv() => job,
            }
        };
        let Some(queued) = next else {
            break;
        };

        debug!("worker {} picked up job {}", index, queued.job.id);
        let outcome = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => None,
            outcome = executor.execute(&queued.job) => Some(outcome),
        };
        let Some((outcome, lingering)) = outcome else {
            queued.cancel("scanner drained before the job finished");
            continue;
        };

        match &outcome {
            Ok(_) => debug!("job {} completed", queued.job.id),
            Err(e) => debug!("job {} failed: {}", queued.job.id, e),
        }
        let job_id = queued.job.id;
        queued.answer(outcome);

        // the slot stays taken until a timed-out thread is really gone
        if let Some(thread) = lingering {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => {
                    warn!("worker {} abandoning the thread of job {}", index, job_id);
                    break;
                }
                _ = thread.exited() => {}
            }
        }
    }

    debug!("worker {} stopped", index);
}
