//! Session dispatcher: drives each proof request from arrival to response.
//!
//! Owns the circuit store, scratch manager, worker pool and deadline
//! supervisor, and moves each request through its lifecycle:
//!
//! ```text
//!   Received → Queued ─┬─► Admitted ─► Proving ─┬─► Completed
//!                      │       │                ├─► TimedOut
//!                      │       └─► TimedOut     └─► VerificationFailed
//!                      └─► Rejected
//!   (every outcome) → Cleaned once scratch is released
//! ```
//!
//! [`Dispatcher::handle`] never fails: every error becomes a structured
//! [`ProofResponse`], and scratch is released on every path. When a proof
//! times out the prover may still be writing into scratch, so that release
//! waits in the background until the worker is done.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::circuit_store::{CacheStats, CircuitSource, CircuitStore};
use crate::config::Config;
use crate::deadline::{DeadlineSupervisor, SessionDeadlines, SessionTrace};
use crate::prover::{ProofJob, ProverFactory};
use crate::response::ProofResponse;
use crate::scratch::{
    ScratchManager, ScratchSession, INPUT_FILENAME, PROOF_FILENAME, WITNESS_FILENAME,
};
use crate::stats::{PerformanceStats, PerformanceSummary};
use crate::types::*;
use crate::worker_pool::{PoolStats, ReserveError, TaskCompletion, WorkerPool};

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    rejected: AtomicU64,
}

/// Status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatus {
    pub uptime_seconds: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub in_flight: usize,
    pub scratch_sessions: usize,
    pub cache: CacheStats,
    pub pool: PoolStats,
    pub performance: PerformanceSummary,
}

pub struct Dispatcher {
    store: CircuitStore,
    scratch: Arc<ScratchManager>,
    pool: WorkerPool,
    supervisor: DeadlineSupervisor,
    stats: PerformanceStats,
    counters: Counters,
    in_flight: AtomicUsize,
    started_at: Instant,
}

/// Resources a session may still hold when it ends.
#[derive(Default)]
struct Held {
    scratch: Option<ScratchSession>,
    worker: Option<TaskCompletion>,
}

/// Decrements the in-flight gauge when a session ends, however it ends.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Dispatcher {
    /// Build every component from configuration, sweep stale scratch and
    /// warm the circuit cache.
    pub async fn init(
        config: &Config,
        source: Arc<dyn CircuitSource>,
        prover: Arc<dyn ProverFactory>,
    ) -> anyhow::Result<Self> {
        info!("starting proof-session dispatcher");
        let scratch = ScratchManager::new(&config.scratch)?;
        if config.scratch.sweep_on_start {
            scratch.sweep_stale();
        }
        let pool = WorkerPool::new(
            config.workers.pool_size(),
            config.workers.worker_recycle_after_n_tasks,
            prover,
        )?;
        let dispatcher = Self::new(
            CircuitStore::new(source, config.cache.cache_capacity),
            scratch,
            pool,
            DeadlineSupervisor::new(&config.deadline),
        );

        for (circuit_id, result) in dispatcher.store.preload(&config.circuits.preload).await {
            if let Ok(elapsed) = result {
                info!(circuit_id = %circuit_id, elapsed_ms = elapsed.as_millis(), "circuit preloaded");
            }
        }
        info!(
            workers = dispatcher.pool.size(),
            cache_capacity = dispatcher.store.capacity(),
            scratch_root = %dispatcher.scratch.root().display(),
            "proof-session dispatcher started"
        );
        Ok(dispatcher)
    }

    /// Assemble a dispatcher from already-built parts.
    pub fn new(
        store: CircuitStore,
        scratch: ScratchManager,
        pool: WorkerPool,
        supervisor: DeadlineSupervisor,
    ) -> Self {
        Self {
            store,
            scratch: Arc::new(scratch),
            pool,
            supervisor,
            stats: PerformanceStats::new(),
            counters: Counters::default(),
            in_flight: AtomicUsize::new(0),
            started_at: Instant::now(),
        }
    }

    /// Run one proof session to completion.
    pub async fn handle(&self, request: ProofRequest) -> ProofResponse {
        let _in_flight = InFlight::enter(&self.in_flight);
        let session_id = request.session_id.clone();
        let mut trace = SessionTrace::new(session_id.clone(), request.received_at);
        trace.advance(SessionState::Queued);
        debug!(session_id = %session_id, circuit_id = %request.circuit_id, "session queued");

        let deadlines = self.supervisor.plan(&request);
        let mut held = Held::default();
        let outcome = self.run(&request, deadlines, &mut trace, &mut held).await;
        let total = request.received_at.elapsed();
        let prover_overran = matches!(outcome, Err(SessionError::ProofTimeout { .. }));

        let response = match outcome {
            Ok(output) => {
                trace.advance(SessionState::Completed);
                let result = ProofResult {
                    session_id: session_id.clone(),
                    circuit_id: request.circuit_id.clone(),
                    proof: output.proof,
                    public_outputs: output.public_outputs,
                    timings: ProofTimings::new(total, output.proof_time),
                };
                ProofResponse::completed(&result)
            }
            Err(e) => {
                let proving = trace.state() == SessionState::Proving;
                trace.advance(e.terminal_state(proving));
                ProofResponse::failed(
                    &session_id,
                    &request.circuit_id,
                    &e,
                    ProofTimings::overhead_only(total),
                )
            }
        };

        let outcome = trace.outcome();
        match (held.scratch, held.worker) {
            (Some(session), Some(worker)) if prover_overran => {
                debug!(session_id = %session_id, "scratch release deferred until the worker finishes");
                tokio::spawn(async move {
                    worker.finished().await;
                    release_scratch(session).await;
                    trace.advance(SessionState::Cleaned);
                });
            }
            (scratch, _) => {
                if let Some(session) = scratch {
                    release_scratch(session).await;
                }
                trace.advance(SessionState::Cleaned);
            }
        }

        self.count(outcome);
        self.stats.record(&response).await;
        info!(
            session_id = %session_id,
            circuit_id = %request.circuit_id,
            status = ?response.status,
            proof_time = response.proof_time,
            overhead_time = response.overhead_time,
            total_time = response.total_time,
            "session finished"
        );
        response
    }

    async fn run(
        &self,
        request: &ProofRequest,
        deadlines: SessionDeadlines,
        trace: &mut SessionTrace,
        held: &mut Held,
    ) -> Result<ProofOutput, SessionError> {
        let resolve = self.store.resolve(&request.circuit_id);
        let circuit = match tokio::time::timeout_at(deadlines.admission.into(), resolve).await {
            Ok(result) => result?,
            Err(_) => return Err(self.supervisor.admission_timeout(&deadlines)),
        };
        let deadlines = self.supervisor.refine(deadlines, &circuit);

        if !request.input.matches_shapes(&circuit.input_shapes) {
            let lengths: Vec<usize> = request.input.0.iter().map(Vec::len).collect();
            return Err(SessionError::InvalidInput(format!(
                "circuit {} expects input shapes {:?}, got buffers of length {:?}",
                circuit.id, circuit.input_shapes, lengths
            )));
        }

        let session = self.acquire_scratch(&request.session_id).await?;
        let scratch_dir = session.dir().to_path_buf();
        held.scratch = Some(session);

        let lease = match self.pool.reserve(deadlines.admission).await {
            Ok(lease) => lease,
            Err(ReserveError::TimedOut) => return Err(self.supervisor.admission_timeout(&deadlines)),
            Err(ReserveError::Closed) => return Err(SessionError::ShuttingDown),
        };
        self.supervisor.check_admission(&deadlines, Instant::now())?;
        trace.advance(SessionState::Admitted);

        let proving_deadline = self
            .supervisor
            .proving_deadline(&deadlines, &circuit, Instant::now())?;
        trace.advance(SessionState::Proving);

        let job = ProofJob {
            circuit,
            input: request.input.clone(),
            scratch_dir,
        };
        let (result, worker) = lease
            .submit_tracked(request.session_id.clone(), job, proving_deadline)
            .await;
        held.worker = Some(worker);
        result
    }

    async fn acquire_scratch(&self, session_id: &SessionId) -> Result<ScratchSession, SessionError> {
        let manager = Arc::clone(&self.scratch);
        let id = session_id.clone();
        let mut session = tokio::task::spawn_blocking(move || manager.acquire(&id))
            .await
            .map_err(|e| SessionError::Storage(format!("scratch allocation task failed: {}", e)))??;
        for name in [INPUT_FILENAME, WITNESS_FILENAME, PROOF_FILENAME] {
            let path = session.path(name);
            session.track(path);
        }
        Ok(session)
    }

    fn count(&self, outcome: SessionState) {
        let counter = match outcome {
            SessionState::Completed => &self.counters.completed,
            SessionState::TimedOut => &self.counters.timed_out,
            SessionState::VerificationFailed => &self.counters.failed,
            _ => &self.counters.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn status(&self) -> DispatcherStatus {
        DispatcherStatus {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            scratch_sessions: self.scratch.active_sessions(),
            cache: self.store.stats().await,
            pool: self.pool.stats(),
            performance: self.stats.summary().await,
        }
    }

    /// Cached circuits, sorted by id.
    pub async fn list_circuits(&self) -> Vec<CircuitSummary> {
        self.store.list().await
    }

    /// Look a circuit up by name, at `version` or the highest available.
    pub async fn find_circuit(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<CircuitSummary, SessionError> {
        let descriptor = self.store.resolve_by_name(name, version).await?;
        Ok(CircuitSummary::from(descriptor.as_ref()))
    }

    /// Drop every cached circuit so the next request reloads from disk.
    pub async fn reload_circuits(&self) {
        self.store.clear().await;
    }

    /// Stop accepting proofs. In-flight proofs finish on their workers.
    pub async fn shutdown(&self) {
        info!("shutting down proof-session dispatcher");
        self.pool.shutdown().await;
    }
}

async fn release_scratch(mut session: ScratchSession) {
    let session_id = session.session_id().clone();
    // A panic inside release still drops the session, which retries it.
    match tokio::task::spawn_blocking(move || session.release()).await {
        Ok(report) if report.failures > 0 => {
            warn!(session_id = %session_id, failures = report.failures, "scratch release incomplete")
        }
        Ok(_) => {}
        Err(e) => warn!(session_id = %session_id, error = %e, "scratch release task failed"),
    }
}
