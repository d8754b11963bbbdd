//! Line-delimited JSON protocol spoken on stdin/stdout.
//!
//! Each input line is either a proof request
//! (`{"circuit_id": "age_v1", "input": [[...]], "deadline_ms": 1000}`) or a
//! control command (`{"command": "status"}`,
//! `{"command": "find_circuit", "name": "age", "version": "1.0.0"}`). Each
//! output line is one JSON object.

use std::time::Duration;

use serde::Deserialize;

use proofd_core::{InputTensor, ProofRequest, ProofResponse, ProofTimings, SessionError, SessionId};

#[derive(Debug, Deserialize)]
pub struct RequestLine {
    pub circuit_id: String,
    pub input: InputTensor,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl RequestLine {
    pub fn into_request(self) -> ProofRequest {
        let mut request = ProofRequest::new(self.circuit_id, self.input);
        if let Some(id) = self.session_id {
            request = request.with_session_id(SessionId(id));
        }
        if let Some(ms) = self.deadline_ms {
            request = request.with_deadline_hint(Duration::from_millis(ms));
        }
        request
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Print the dispatcher status snapshot.
    Status,
    /// Clear the circuit cache.
    Reload,
    /// Print the cached circuits.
    ListCircuits,
    /// Look a circuit up by `name`, optionally at `version`.
    FindCircuit,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Line {
    Control {
        command: Command,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },
    Proof(RequestLine),
}

/// Parse one input line. On failure, returns the response to emit instead.
pub fn parse_line(line: &str) -> Result<Line, ProofResponse> {
    serde_json::from_str(line).map_err(|e| {
        // Echo back whatever circuit id we can find.
        let circuit_id = serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .and_then(|v| v.get("circuit_id").and_then(|c| c.as_str()).map(str::to_string))
            .unwrap_or_default();
        ProofResponse::failed(
            &SessionId::generate(),
            &circuit_id,
            &SessionError::InvalidInput(format!("malformed request: {}", e)),
            ProofTimings::default(),
        )
    })
}
