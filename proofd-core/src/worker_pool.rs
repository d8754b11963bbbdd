//! Proof worker pool.
//!
//! A fixed number of OS-thread workers pull proof tasks from a shared queue.
//! The slot semaphore bounds in-flight tasks to the number of workers, so a
//! task that gets a slot always has a worker ready for it.
//!
//! ```text
//!   reserve(deadline) ──► slot permit ──► WorkerLease::submit ──► queue ──► worker N (gen G)
//!                                                  ▲                            │
//!                                                  └──── reply / deadline ◄─────┘
//! ```
//!
//! The permit travels with the task and is only released when the worker
//! finishes, so a timed-out session stops waiting but its slot stays busy
//! until the prover actually returns. After `recycle_after` tasks (or a
//! panic) a worker drops its backend, spawns its replacement with the next
//! generation number and exits.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::prover::{ProofJob, ProverFactory};
use crate::types::{ProofOutput, SessionError, SessionId};

struct Task {
    session_id: SessionId,
    job: ProofJob,
    reply: oneshot::Sender<Result<ProofOutput, String>>,
    /// Held until the worker is done with the task, timed out or not.
    permit: OwnedSemaphorePermit,
    /// Dropped once the prover has returned.
    done: oneshot::Sender<()>,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    recycled: AtomicU64,
    abandoned: AtomicU64,
    generations: AtomicU64,
}

struct Shared {
    queue: Mutex<mpsc::UnboundedReceiver<Task>>,
    factory: Arc<dyn ProverFactory>,
    recycle_after: u32,
    counters: Counters,
}

/// Why a slot could not be reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveError {
    /// The deadline passed while every worker was busy.
    TimedOut,
    /// The pool has been shut down.
    Closed,
}

/// Pool counters snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub busy: usize,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
    pub recycled: u64,
    /// Results that arrived after the session stopped waiting.
    pub abandoned: u64,
    /// Worker generations started so far (initial workers included).
    pub generations: u64,
}

/// Bounded pool of isolated proof workers.
pub struct WorkerPool {
    size: usize,
    slots: Arc<Semaphore>,
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Start `size` workers, each replaced after `recycle_after` tasks.
    pub fn new(size: usize, recycle_after: u32, factory: Arc<dyn ProverFactory>) -> anyhow::Result<Self> {
        let size = size.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            queue: Mutex::new(rx),
            factory,
            recycle_after: recycle_after.max(1),
            counters: Counters::default(),
        });
        for index in 0..size {
            spawn_worker(Arc::clone(&shared), index)?;
        }
        info!(size, recycle_after, "proof worker pool started");
        Ok(Self {
            size,
            slots: Arc::new(Semaphore::new(size)),
            sender: Mutex::new(Some(tx)),
            shared,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for a free worker slot until `deadline`.
    pub async fn reserve(&self, deadline: Instant) -> Result<WorkerLease, ReserveError> {
        let acquire = Arc::clone(&self.slots).acquire_owned();
        let permit = match tokio::time::timeout_at(deadline.into(), acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ReserveError::Closed),
            Err(_) => return Err(ReserveError::TimedOut),
        };
        let sender = self.sender.lock().await.clone().ok_or(ReserveError::Closed)?;
        Ok(WorkerLease { permit, sender })
    }

    /// Reserve a slot and run `job` on it, all under one deadline.
    pub async fn submit(
        &self,
        session_id: SessionId,
        job: ProofJob,
        deadline: Instant,
    ) -> Result<ProofOutput, SessionError> {
        let lease = match self.reserve(deadline).await {
            Ok(lease) => lease,
            Err(ReserveError::TimedOut) => return Err(SessionError::ProofTimeout { remaining_ms: 0 }),
            Err(ReserveError::Closed) => return Err(SessionError::ShuttingDown),
        };
        lease.submit(session_id, job, deadline).await
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            size: self.size,
            busy: self.size.saturating_sub(self.slots.available_permits()),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            recycled: c.recycled.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            generations: c.generations.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work. Idle workers exit once the queue drains; busy
    /// workers finish their current task first.
    pub async fn shutdown(&self) {
        self.slots.close();
        if self.sender.lock().await.take().is_some() {
            info!("proof worker pool shutting down");
        }
    }
}

/// Resolves once the worker has finished with a submitted task, including
/// one whose session already gave up on it.
pub struct TaskCompletion(Option<oneshot::Receiver<()>>);

impl TaskCompletion {
    pub async fn finished(self) {
        if let Some(rx) = self.0 {
            let _ = rx.await;
        }
    }
}

/// A reserved worker slot.
pub struct WorkerLease {
    permit: OwnedSemaphorePermit,
    sender: mpsc::UnboundedSender<Task>,
}

impl WorkerLease {
    /// Hand the job to a worker and wait for it until `deadline`.
    ///
    /// On timeout the worker keeps running; its result is discarded when it
    /// arrives. Nothing is retried.
    pub async fn submit(
        self,
        session_id: SessionId,
        job: ProofJob,
        deadline: Instant,
    ) -> Result<ProofOutput, SessionError> {
        self.submit_tracked(session_id, job, deadline).await.0
    }

    /// Like [`WorkerLease::submit`], also returning a handle that resolves
    /// when the worker is really done with the job.
    pub async fn submit_tracked(
        self,
        session_id: SessionId,
        job: ProofJob,
        deadline: Instant,
    ) -> (Result<ProofOutput, SessionError>, TaskCompletion) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return (
                Err(SessionError::ProofTimeout { remaining_ms: 0 }),
                TaskCompletion(None),
            );
        }

        let (reply, rx) = oneshot::channel();
        let (done, finished) = oneshot::channel();
        let task = Task {
            session_id: session_id.clone(),
            job,
            reply,
            permit: self.permit,
            done,
        };
        if self.sender.send(task).is_err() {
            return (Err(SessionError::ShuttingDown), TaskCompletion(None));
        }
        let completion = TaskCompletion(Some(finished));

        let result = match tokio::time::timeout_at(deadline.into(), rx).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(message))) => Err(SessionError::ProofVerificationFailed(message)),
            Ok(Err(_)) => Err(SessionError::ProofVerificationFailed(
                "worker exited without replying".to_string(),
            )),
            Err(_) => {
                warn!(
                    session_id = %session_id,
                    remaining_ms = remaining.as_millis(),
                    "proof deadline exceeded, abandoning result"
                );
                Err(SessionError::ProofTimeout {
                    remaining_ms: remaining.as_millis() as u64,
                })
            }
        };
        (result, completion)
    }
}

fn spawn_worker(shared: Arc<Shared>, index: usize) -> std::io::Result<()> {
    let generation = shared.counters.generations.fetch_add(1, Ordering::Relaxed) + 1;
    std::thread::Builder::new()
        .name(format!("proof-worker-{}", index))
        .spawn(move || worker_loop(shared, index, generation))?;
    Ok(())
}

fn worker_loop(shared: Arc<Shared>, index: usize, generation: u64) {
    let mut backend = shared.factory.create();
    let mut tasks_done: u32 = 0;
    debug!(worker = index, generation, "proof worker started");

    loop {
        let task = {
            let mut queue = shared.queue.blocking_lock();
            queue.blocking_recv()
        };
        let Some(Task {
            session_id,
            job,
            reply,
            permit,
            done,
        }) = task
        else {
            debug!(worker = index, generation, "proof worker exiting");
            return;
        };

        debug!(worker = index, generation, session_id = %session_id, circuit_id = %job.circuit.id, "proof started");
        let start = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| backend.prove(&job)));
        let proof_time = start.elapsed();
        tasks_done += 1;

        let mut poisoned = false;
        let result = match outcome {
            Ok(Ok(proof)) => {
                shared.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    worker = index,
                    session_id = %session_id,
                    proof_ms = proof_time.as_millis(),
                    proof_len = proof.bytes.len(),
                    "proof completed"
                );
                Ok(ProofOutput {
                    proof: proof.bytes,
                    public_outputs: proof.public_outputs,
                    proof_time,
                })
            }
            Ok(Err(e)) => {
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(worker = index, session_id = %session_id, error = %e, "proof failed");
                Err(format!("{:#}", e))
            }
            Err(payload) => {
                poisoned = true;
                shared.counters.panicked.fetch_add(1, Ordering::Relaxed);
                let message = panic_message(payload.as_ref());
                error!(worker = index, session_id = %session_id, panic = %message, "prover panicked");
                Err(format!("prover panicked: {}", message))
            }
        };

        if reply.send(result).is_err() {
            shared.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            debug!(session_id = %session_id, "session stopped waiting, result discarded");
        }
        drop(done);

        if poisoned || tasks_done >= shared.recycle_after {
            drop(backend);
            shared.counters.recycled.fetch_add(1, Ordering::Relaxed);
            info!(worker = index, generation, tasks_done, poisoned, "recycling proof worker");
            if let Err(e) = spawn_worker(Arc::clone(&shared), index) {
                // Without a replacement the pool is one worker short; shrink
                // the slot count to match.
                error!(worker = index, error = %e, "failed to spawn replacement worker");
                permit.forget();
                return;
            }
            drop(permit);
            return;
        }
        drop(permit);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
