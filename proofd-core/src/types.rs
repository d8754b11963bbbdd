//! Common types used throughout the proof-session manager.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Unique identifier for a proof session.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a fresh random session id.
    pub fn generate() -> Self {
        SessionId(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Input tensor for a circuit: one flattened buffer per declared model input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputTensor(pub Vec<Vec<f64>>);

impl InputTensor {
    /// Check the tensor against declared input shapes.
    ///
    /// Each buffer must hold exactly as many elements as the product of the
    /// corresponding shape's dimensions.
    pub fn matches_shapes(&self, shapes: &[Vec<usize>]) -> bool {
        self.0.len() == shapes.len()
            && self
                .0
                .iter()
                .zip(shapes)
                .all(|(values, shape)| values.len() == shape.iter().product::<usize>())
    }

    pub fn element_count(&self) -> usize {
        self.0.iter().map(Vec::len).sum()
    }
}

/// A loaded, validated circuit artifact.
///
/// Immutable once loaded. Shared read-only (behind an `Arc`) between the
/// circuit cache and any worker currently proving against it.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitDescriptor {
    pub id: String,
    /// Directory holding the circuit's artifacts.
    pub dir: PathBuf,
    pub compiled_path: PathBuf,
    pub settings_path: PathBuf,
    pub proving_key_path: PathBuf,
    /// Circuit size parameter: 2^logrows rows.
    pub logrows: u32,
    pub input_shapes: Vec<Vec<usize>>,
    pub output_shapes: Vec<Vec<usize>>,
    /// Circuit-specific response budget, if the settings declare one.
    pub timeout: Option<Duration>,
    /// Typical proving time, used to fail fast when the remaining budget is
    /// already too small.
    pub expected_proof_time: Option<Duration>,
    pub name: String,
    pub version: String,
    pub proof_system: String,
}

/// JSON-safe circuit metadata for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub proof_system: String,
    pub logrows: u32,
    pub input_shapes: Vec<Vec<usize>>,
}

impl From<&CircuitDescriptor> for CircuitSummary {
    fn from(d: &CircuitDescriptor) -> Self {
        Self {
            id: d.id.clone(),
            name: d.name.clone(),
            version: d.version.clone(),
            proof_system: d.proof_system.clone(),
            logrows: d.logrows,
            input_shapes: d.input_shapes.clone(),
        }
    }
}

/// A proof request handed to the dispatcher by the transport layer.
#[derive(Debug, Clone)]
pub struct ProofRequest {
    pub session_id: SessionId,
    pub circuit_id: String,
    pub input: InputTensor,
    /// When the request arrived.
    pub received_at: Instant,
    /// Client-requested absolute deadline. Clamped to the configured
    /// response budget by the deadline supervisor.
    pub deadline: Option<Instant>,
}

impl ProofRequest {
    pub fn new(circuit_id: impl Into<String>, input: InputTensor) -> Self {
        Self {
            session_id: SessionId::generate(),
            circuit_id: circuit_id.into(),
            input,
            received_at: Instant::now(),
            deadline: None,
        }
    }

    /// Attach a client deadline hint relative to arrival.
    pub fn with_deadline_hint(mut self, hint: Duration) -> Self {
        self.deadline = Some(self.received_at + hint);
        self
    }

    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Raw output of the proving capability, as returned by a worker.
#[derive(Debug, Clone)]
pub struct ProofOutput {
    pub proof: Vec<u8>,
    pub public_outputs: Vec<f64>,
    /// Monotonic delta around the proving call.
    pub proof_time: Duration,
}

/// Timing breakdown for a session.
///
/// Stored at millisecond resolution so that `total == proof_phase + overhead`
/// holds exactly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProofTimings {
    pub proof_phase: Duration,
    pub overhead: Duration,
    pub total: Duration,
}

impl ProofTimings {
    pub fn new(total: Duration, proof_phase: Duration) -> Self {
        let total_ms = total.as_millis() as u64;
        let proof_ms = (proof_phase.as_millis() as u64).min(total_ms);
        Self {
            proof_phase: Duration::from_millis(proof_ms),
            overhead: Duration::from_millis(total_ms - proof_ms),
            total: Duration::from_millis(total_ms),
        }
    }

    /// Timings for a session that never reached the proving phase.
    pub fn overhead_only(total: Duration) -> Self {
        Self::new(total, Duration::ZERO)
    }
}

/// Result of a completed proof session. Produced once, never mutated.
#[derive(Debug, Clone)]
pub struct ProofResult {
    pub session_id: SessionId,
    pub circuit_id: String,
    pub proof: Vec<u8>,
    pub public_outputs: Vec<f64>,
    pub timings: ProofTimings,
}

/// Per-session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Received,
    Queued,
    Admitted,
    Rejected,
    Proving,
    Completed,
    TimedOut,
    VerificationFailed,
    Cleaned,
}

impl SessionState {
    /// Whether the session has reached an outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Rejected
                | SessionState::Completed
                | SessionState::TimedOut
                | SessionState::VerificationFailed
        )
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Received, Queued) => true,
            (Queued, Admitted) | (Queued, Rejected) => true,
            (Admitted, Proving) | (Admitted, Rejected) | (Admitted, TimedOut) => true,
            (Proving, Completed) | (Proving, TimedOut) | (Proving, VerificationFailed) => true,
            (Cleaned, _) => false,
            (Received, Cleaned) => false,
            (_, Cleaned) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Received => "received",
            SessionState::Queued => "queued",
            SessionState::Admitted => "admitted",
            SessionState::Rejected => "rejected",
            SessionState::Proving => "proving",
            SessionState::Completed => "completed",
            SessionState::TimedOut => "timed-out",
            SessionState::VerificationFailed => "verification-failed",
            SessionState::Cleaned => "cleaned",
        };
        f.write_str(s)
    }
}

/// Externally visible outcome of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProofStatus {
    Completed,
    CircuitNotFound,
    AdmissionTimeout,
    ProofTimeout,
    ProofVerificationFailed,
    StorageError,
    InvalidInput,
    ShuttingDown,
}

/// Error taxonomy for a proof session. Every variant is terminal; none are
/// retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("circuit not found: {circuit_id}: {reason}")]
    CircuitNotFound { circuit_id: String, reason: String },
    #[error("admission budget of {budget_ms}ms exceeded before proving started")]
    AdmissionTimeout { budget_ms: u64 },
    #[error("proving exceeded remaining deadline of {remaining_ms}ms")]
    ProofTimeout { remaining_ms: u64 },
    #[error("proof generation failed: {0}")]
    ProofVerificationFailed(String),
    #[error("scratch storage error: {0}")]
    Storage(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("proof service shutting down")]
    ShuttingDown,
}

impl SessionError {
    pub fn status(&self) -> ProofStatus {
        match self {
            SessionError::CircuitNotFound { .. } => ProofStatus::CircuitNotFound,
            SessionError::AdmissionTimeout { .. } => ProofStatus::AdmissionTimeout,
            SessionError::ProofTimeout { .. } => ProofStatus::ProofTimeout,
            SessionError::ProofVerificationFailed(_) => ProofStatus::ProofVerificationFailed,
            SessionError::Storage(_) => ProofStatus::StorageError,
            SessionError::InvalidInput(_) => ProofStatus::InvalidInput,
            SessionError::ShuttingDown => ProofStatus::ShuttingDown,
        }
    }

    /// Terminal state this error drives a session into. Anything other than
    /// a timeout that happens once proving has started counts as a failed
    /// proof.
    pub fn terminal_state(&self, proving_started: bool) -> SessionState {
        match self {
            SessionError::ProofTimeout { .. } => SessionState::TimedOut,
            SessionError::ProofVerificationFailed(_) => SessionState::VerificationFailed,
            _ if proving_started => SessionState::VerificationFailed,
            _ => SessionState::Rejected,
        }
    }

    pub(crate) fn not_found(circuit_id: &str, reason: impl fmt::Display) -> Self {
        SessionError::CircuitNotFound {
            circuit_id: circuit_id.to_string(),
            reason: reason.to_string(),
        }
    }
}
