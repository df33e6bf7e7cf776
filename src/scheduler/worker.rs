//! Isolated execution of a single scan job.
//!
//! Whatever the isolation unit, the job goes in and the reply comes out as
//! wire-encoded bytes, so a thread worker and a process worker are held to
//! the same contract.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::errors::ScanErrorKind;
use crate::scanner::{PluginRegistry, ScanResult};
use crate::tls::TlsHandshaker;
use crate::wire;

use super::{ScanError, ScanJob, ScanOutcome};

/// How each job is kept apart from the scheduler and its siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationMode {
    /// A dedicated OS thread with its own runtime. Panics are contained;
    /// on timeout the runtime is stopped, but a plugin blocked outside it
    /// holds its worker slot until it returns.
    Thread,
    /// A child process running `<program> worker`. Crashes and hangs are
    /// contained; the child is killed on timeout or drain.
    Process { program: PathBuf },
}

/// What a worker sends back for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReply {
    Completed { result: ScanResult },
    Failed { kind: ScanErrorKind, message: String },
}

impl WorkerReply {
    fn into_outcome(self, job: &ScanJob) -> ScanOutcome {
        match self {
            WorkerReply::Completed { result } => Ok(result),
            WorkerReply::Failed { kind, message } => Err(ScanError::new(job.clone(), kind, message)),
        }
    }
}

/// Looks up the plugin for the job's command and runs it.
pub async fn run_job(registry: &PluginRegistry, tls: &dyn TlsHandshaker, job: &ScanJob) -> WorkerReply {
    let Some(plugin) = registry.get(job.command.id()) else {
        return WorkerReply::Failed {
            kind: ScanErrorKind::Plugin,
            message: format!("no plugin registered for {}", job.command),
        };
    };

    debug!("job {}: {} running {}", job.id, plugin.name(), job.command);
    match plugin.process(&job.server_info, &job.command, tls).await {
        Ok(result) => WorkerReply::Completed { result },
        Err(err) => WorkerReply::Failed {
            kind: ScanErrorKind::from(&err),
            message: err.to_string(),
        },
    }
}

/// Runs jobs in isolation units and applies their time limits.
pub struct JobExecutor {
    registry: Arc<PluginRegistry>,
    handshaker: Arc<dyn TlsHandshaker>,
    isolation: IsolationMode,
    default_timeout: Option<Duration>,
}

/// A job thread that may outlive the outcome it reported.
///
/// Its runtime has already been told to stop; a plugin stuck in blocking
/// code keeps the thread alive until it returns.
pub struct LingeringThread {
    exited: oneshot::Receiver<()>,
}

impl LingeringThread {
    /// Resolves once the thread has exited, panicked or not.
    pub async fn exited(self) {
        let _ = self.exited.await;
    }
}

/// Channels to one spawned job thread. Dropping it cancels the job.
struct JobThread {
    reply: oneshot::Receiver<Vec<u8>>,
    cancel: oneshot::Sender<()>,
    exited: oneshot::Receiver<()>,
}

impl JobExecutor {
    pub fn new(
        registry: Arc<PluginRegistry>,
        handshaker: Arc<dyn TlsHandshaker>,
        isolation: IsolationMode,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            handshaker,
            isolation,
            default_timeout,
        }
    }

    /// Runs `job` to an outcome. In thread isolation the job's thread is
    /// handed back too: the caller must not reuse its slot before the
    /// thread has exited.
    pub async fn execute(&self, job: &ScanJob) -> (ScanOutcome, Option<LingeringThread>) {
        let limit = job.timeout.or(self.default_timeout);

        match &self.isolation {
            IsolationMode::Process { program } => {
                (with_limit(job, limit, run_in_process(program, job)).await, None)
            }
            IsolationMode::Thread => {
                let mut thread = match self.spawn_thread(job) {
                    Ok(thread) => thread,
                    Err(e) => return (Err(e), None),
                };

                let outcome = with_limit(job, limit, async {
                    match (&mut thread.reply).await {
                        Ok(bytes) => decode_reply(job, &bytes),
                        Err(_) => Err(ScanError::new(
                            job.clone(),
                            ScanErrorKind::WorkerCrashed,
                            "worker thread exited without a reply",
                        )),
                    }
                })
                .await;

                let _ = thread.cancel.send(());
                (outcome, Some(LingeringThread { exited: thread.exited }))
            }
        }
    }

    fn spawn_thread(&self, job: &ScanJob) -> Result<JobThread, ScanError> {
        let (reply_tx, reply_rx) = oneshot::channel::<Vec<u8>>();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let (exited_tx, exited_rx) = oneshot::channel::<()>();
        let registry = self.registry.clone();
        let handshaker = self.handshaker.clone();
        let thread_job = job.clone();

        std::thread::Builder::new()
            .name(format!("scan-job-{}", job.id))
            .spawn(move || {
                // dropped last, also when the plugin panics
                let _exited = exited_tx;

                let reply = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(async {
                        tokio::select! {
                            reply = run_job(&registry, handshaker.as_ref(), &thread_job) => Some(reply),
                            _ = cancel_rx => None,
                        }
                    }),
                    Err(e) => Some(WorkerReply::Failed {
                        kind: ScanErrorKind::WorkerCrashed,
                        message: format!("failed to start worker runtime: {e}"),
                    }),
                };

                let Some(reply) = reply else {
                    debug!("job {} cancelled inside its thread", thread_job.id);
                    return;
                };
                match encode_reply(&reply) {
                    Ok(bytes) => {
                        let _ = reply_tx.send(bytes);
                    }
                    Err(e) => warn!("job {}: {}", thread_job.id, e),
                }
            })
            .map_err(|e| {
                ScanError::new(
                    job.clone(),
                    ScanErrorKind::WorkerCrashed,
                    format!("failed to spawn worker thread: {e}"),
                )
            })?;

        Ok(JobThread {
            reply: reply_rx,
            cancel: cancel_tx,
            exited: exited_rx,
        })
    }
}

async fn with_limit(
    job: &ScanJob,
    limit: Option<Duration>,
    run: impl Future<Output = ScanOutcome>,
) -> ScanOutcome {
    let Some(limit) = limit else {
        return run.await;
    };
    match tokio::time::timeout(limit, run).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!("job {} ({}) timed out after {:?}", job.id, job.command, limit);
            Err(ScanError::new(
                job.clone(),
                ScanErrorKind::Timeout,
                format!("no result within {limit:?}"),
            ))
        }
    }
}

async fn run_in_process(program: &Path, job: &ScanJob) -> ScanOutcome {
    let crashed = |message: String| ScanError::new(job.clone(), ScanErrorKind::WorkerCrashed, message);

    let payload = wire::encode(job).map_err(|e| crashed(e.to_string()))?;

    let mut child = Command::new(program)
        .arg("worker")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| crashed(format!("failed to start {}: {e}", program.display())))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(&payload)
            .await
            .map_err(|e| crashed(format!("failed to send job to worker: {e}")))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| crashed(format!("failed to wait for worker: {e}")))?;

    if !output.status.success() {
        return Err(crashed(format!("worker process exited with {}", output.status)));
    }
    decode_reply(job, &output.stdout)
}

fn encode_reply(reply: &WorkerReply) -> Result<Vec<u8>, crate::errors::WireError> {
    wire::encode(reply).or_else(|e| {
        wire::encode(&WorkerReply::Failed {
            kind: ScanErrorKind::WorkerCrashed,
            message: format!("result could not be encoded: {e}"),
        })
    })
}

fn decode_reply(job: &ScanJob, bytes: &[u8]) -> ScanOutcome {
    match wire::decode::<WorkerReply>(bytes) {
        Ok(reply) => reply.into_outcome(job),
        Err(e) => Err(ScanError::new(
            job.clone(),
            ScanErrorKind::WorkerCrashed,
            format!("undecodable worker reply: {e}"),
        )),
    }
}

/// Body of the `worker` subcommand: one job in on stdin, one reply out on stdout.
pub async fn serve_worker_process(
    registry: &PluginRegistry,
    tls: &dyn TlsHandshaker,
) -> std::io::Result<()> {
    let mut input = Vec::new();
    tokio::io::stdin().read_to_end(&mut input).await?;

    let reply = match wire::decode::<ScanJob>(&input) {
        Ok(job) => run_job(registry, tls, &job).await,
        Err(e) => WorkerReply::Failed {
            kind: ScanErrorKind::WorkerCrashed,
            message: format!("undecodable job: {e}"),
        },
    };

    let bytes = encode_reply(&reply).map_err(std::io::Error::other)?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&bytes).await?;
    stdout.flush().await
}
