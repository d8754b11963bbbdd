//! Wire response for a proof session.
//!
//! Field order is the struct's declaration order, so the serialized form is
//! stable. Timing fields are seconds derived from whole milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{ProofResult, ProofStatus, ProofTimings, SessionError, SessionId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofResponse {
    pub status: ProofStatus,
    pub session_id: String,
    pub circuit_id: String,
    /// Lowercase hex, absent on failure.
    pub proof: Option<String>,
    pub public_outputs: Vec<f64>,
    pub proof_time: f64,
    pub overhead_time: f64,
    pub total_time: f64,
    pub error: Option<String>,
}

fn seconds(d: Duration) -> f64 {
    d.as_millis() as f64 / 1000.0
}

impl ProofResponse {
    pub fn completed(result: &ProofResult) -> Self {
        Self {
            status: ProofStatus::Completed,
            session_id: result.session_id.to_string(),
            circuit_id: result.circuit_id.clone(),
            proof: Some(hex::encode(&result.proof)),
            public_outputs: result.public_outputs.clone(),
            proof_time: seconds(result.timings.proof_phase),
            overhead_time: seconds(result.timings.overhead),
            total_time: seconds(result.timings.total),
            error: None,
        }
    }

    pub fn failed(
        session_id: &SessionId,
        circuit_id: &str,
        error: &SessionError,
        timings: ProofTimings,
    ) -> Self {
        Self {
            status: error.status(),
            session_id: session_id.to_string(),
            circuit_id: circuit_id.to_string(),
            proof: None,
            public_outputs: Vec::new(),
            proof_time: seconds(timings.proof_phase),
            overhead_time: seconds(timings.overhead),
            total_time: seconds(timings.total),
            error: Some(error.to_string()),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ProofStatus::Completed
    }

    /// Compact single-line JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
