//! Admission and response deadlines per session.
//!
//! Every session carries two deadlines measured from arrival:
//!
//! - **admission**: proving must start before it (circuit resolution,
//!   scratch allocation and waiting for a worker slot all count against it);
//! - **response**: the whole session must finish before it. The worker pool
//!   gets whatever is left of it once proving starts.
//!
//! A client deadline hint can only tighten the response deadline, and the
//! admission deadline never extends past the response deadline.
//!
//! The response budget depends on the circuit, which is unknown at arrival.
//! [`DeadlineSupervisor::plan`] therefore starts from the largest configured
//! budget and [`DeadlineSupervisor::refine`] replaces it with the circuit's
//! own budget once resolution succeeds.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::DeadlineConfig;
use crate::types::{CircuitDescriptor, ProofRequest, SessionError, SessionId, SessionState};

/// Absolute deadlines for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionDeadlines {
    pub received_at: Instant,
    pub admission: Instant,
    pub response: Instant,
    /// Client hint, kept so `refine` can reapply it.
    pub hint: Option<Instant>,
}

impl SessionDeadlines {
    pub fn admission_budget(&self) -> Duration {
        self.admission.saturating_duration_since(self.received_at)
    }

    pub fn response_budget(&self) -> Duration {
        self.response.saturating_duration_since(self.received_at)
    }
}

pub struct DeadlineSupervisor {
    admission_budget: Duration,
    response_budget: Duration,
    overrides: HashMap<String, Duration>,
    /// Largest of the global budget and every override.
    widest_budget: Duration,
}

impl DeadlineSupervisor {
    pub fn new(config: &DeadlineConfig) -> Self {
        let response_budget = config.response_budget();
        let overrides: HashMap<String, Duration> = config
            .circuit_overrides
            .keys()
            .filter_map(|id| config.override_for(id).map(|d| (id.clone(), d)))
            .collect();
        let widest_budget = overrides.values().copied().fold(response_budget, Duration::max);
        Self {
            admission_budget: config.admission_budget(),
            response_budget,
            overrides,
            widest_budget,
        }
    }

    pub fn admission_budget(&self) -> Duration {
        self.admission_budget
    }

    /// Response budget for a circuit.
    ///
    /// An operator override wins; otherwise the circuit's own timeout, which
    /// may tighten but never extend the global budget.
    pub fn response_budget_for(&self, circuit: &CircuitDescriptor) -> Duration {
        if let Some(budget) = self.overrides.get(&circuit.id) {
            return *budget;
        }
        match circuit.timeout {
            Some(t) => t.min(self.response_budget),
            None => self.response_budget,
        }
    }

    fn deadlines(&self, received_at: Instant, budget: Duration, hint: Option<Instant>) -> SessionDeadlines {
        let mut response = received_at + budget;
        if let Some(hint) = hint {
            response = response.min(hint.max(received_at));
        }
        SessionDeadlines {
            received_at,
            admission: (received_at + self.admission_budget).min(response),
            response,
            hint,
        }
    }

    /// Provisional deadlines at arrival, before the circuit is known.
    pub fn plan(&self, request: &ProofRequest) -> SessionDeadlines {
        self.deadlines(request.received_at, self.widest_budget, request.deadline)
    }

    /// Final deadlines once the circuit is resolved.
    pub fn refine(&self, deadlines: SessionDeadlines, circuit: &CircuitDescriptor) -> SessionDeadlines {
        self.deadlines(
            deadlines.received_at,
            self.response_budget_for(circuit),
            deadlines.hint,
        )
    }

    pub fn admission_timeout(&self, deadlines: &SessionDeadlines) -> SessionError {
        SessionError::AdmissionTimeout {
            budget_ms: deadlines.admission_budget().as_millis() as u64,
        }
    }

    /// Fail if the admission deadline has passed.
    pub fn check_admission(&self, deadlines: &SessionDeadlines, now: Instant) -> Result<(), SessionError> {
        if now > deadlines.admission {
            Err(self.admission_timeout(deadlines))
        } else {
            Ok(())
        }
    }

    /// Hard deadline to hand to the worker pool.
    ///
    /// Fails fast with `ProofTimeout` when nothing is left of the response
    /// budget or when the circuit's expected proving time does not fit.
    pub fn proving_deadline(
        &self,
        deadlines: &SessionDeadlines,
        circuit: &CircuitDescriptor,
        now: Instant,
    ) -> Result<Instant, SessionError> {
        let remaining = deadlines.response.saturating_duration_since(now);
        let too_slow = circuit
            .expected_proof_time
            .is_some_and(|expected| expected > remaining);
        if remaining.is_zero() || too_slow {
            debug!(
                circuit_id = %circuit.id,
                remaining_ms = remaining.as_millis(),
                expected = ?circuit.expected_proof_time,
                "remaining budget too small to prove"
            );
            return Err(SessionError::ProofTimeout {
                remaining_ms: remaining.as_millis() as u64,
            });
        }
        Ok(deadlines.response)
    }
}

/// Lifecycle record of one session.
#[derive(Debug, Clone)]
pub struct SessionTrace {
    session_id: SessionId,
    received_at: Instant,
    state: SessionState,
    history: Vec<(SessionState, Duration)>,
}

impl SessionTrace {
    pub fn new(session_id: SessionId, received_at: Instant) -> Self {
        Self {
            session_id,
            received_at,
            state: SessionState::Received,
            history: vec![(SessionState::Received, Duration::ZERO)],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// States visited so far, with the time since arrival.
    pub fn history(&self) -> &[(SessionState, Duration)] {
        &self.history
    }

    /// Move to `next` if the transition is legal. Illegal transitions are
    /// logged and ignored.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(session_id = %self.session_id, from = %self.state, to = %next, "illegal session transition");
            return false;
        }
        let at = self.received_at.elapsed();
        debug!(session_id = %self.session_id, from = %self.state, to = %next, at_ms = at.as_millis(), "session transition");
        self.state = next;
        self.history.push((next, at));
        true
    }

    /// Last non-`Cleaned` state.
    pub fn outcome(&self) -> SessionState {
        self.history
            .iter()
            .rev()
            .map(|(s, _)| *s)
            .find(|s| *s != SessionState::Cleaned)
            .unwrap_or(SessionState::Received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InputTensor;
    use std::path::PathBuf;

    fn supervisor(admission: f64, response: f64) -> DeadlineSupervisor {
        DeadlineSupervisor::new(&DeadlineConfig {
            circuit_timeout_seconds: response,
            admission_timeout_seconds: admission,
            circuit_overrides: HashMap::from([("pinned".to_string(), 60.0)]),
        })
    }

    fn circuit(id: &str, timeout: Option<u64>, expected_ms: Option<u64>) -> CircuitDescriptor {
        CircuitDescriptor {
            id: id.to_string(),
            dir: PathBuf::new(),
            compiled_path: PathBuf::new(),
            settings_path: PathBuf::new(),
            proving_key_path: PathBuf::new(),
            logrows: 17,
            input_shapes: vec![vec![1]],
            output_shapes: vec![],
            timeout: timeout.map(Duration::from_secs),
            expected_proof_time: expected_ms.map(Duration::from_millis),
            name: id.to_string(),
            version: "1".to_string(),
            proof_system: "ezkl".to_string(),
        }
    }

    fn request() -> ProofRequest {
        ProofRequest::new("age_v1", InputTensor(vec![vec![1.0]]))
    }

    #[test]
    fn test_plan_uses_configured_budgets() {
        let sup = supervisor(5.0, 45.0);
        let d = sup.refine(sup.plan(&request()), &circuit("a", None, None));
        assert_eq!(d.admission_budget(), Duration::from_secs(5));
        assert_eq!(d.response_budget(), Duration::from_secs(45));
    }

    #[test]
    fn test_client_hint_only_tightens() {
        let sup = supervisor(5.0, 45.0);

        let d = sup.plan(&request().with_deadline_hint(Duration::from_secs(1)));
        assert_eq!(d.response_budget(), Duration::from_secs(1));
        // admission can never outlive the response deadline
        assert_eq!(d.admission_budget(), Duration::from_secs(1));

        let d = sup.plan(&request().with_deadline_hint(Duration::from_secs(600)));
        let d = sup.refine(d, &circuit("a", None, None));
        assert_eq!(d.response_budget(), Duration::from_secs(45));
    }

    #[test]
    fn test_circuit_budget_precedence() {
        let sup = supervisor(5.0, 45.0);
        assert_eq!(sup.response_budget_for(&circuit("a", None, None)), Duration::from_secs(45));
        assert_eq!(sup.response_budget_for(&circuit("a", Some(20), None)), Duration::from_secs(20));
        // settings cannot extend the global budget
        assert_eq!(sup.response_budget_for(&circuit("a", Some(90), None)), Duration::from_secs(45));
        // operator override wins
        assert_eq!(sup.response_budget_for(&circuit("pinned", Some(10), None)), Duration::from_secs(60));

        let d = sup.refine(sup.plan(&request()), &circuit("a", Some(3), None));
        assert_eq!(d.response_budget(), Duration::from_secs(3));
        assert_eq!(d.admission_budget(), Duration::from_secs(3));
    }

    #[test]
    fn test_override_extends_past_global_budget() {
        let sup = supervisor(5.0, 45.0);
        let pinned = circuit("pinned", None, None);

        // before resolution the widest budget applies
        let planned = sup.plan(&request());
        assert_eq!(planned.response_budget(), Duration::from_secs(60));
        assert_eq!(planned.admission_budget(), Duration::from_secs(5));

        let d = sup.refine(planned, &pinned);
        assert_eq!(d.response_budget(), Duration::from_secs(60));
        let d = sup.refine(planned, &circuit("a", None, None));
        assert_eq!(d.response_budget(), Duration::from_secs(45));

        // the client hint still tightens an override
        let hinted = sup.plan(&request().with_deadline_hint(Duration::from_secs(50)));
        assert_eq!(sup.refine(hinted, &pinned).response_budget(), Duration::from_secs(50));
        assert_eq!(
            sup.refine(hinted, &circuit("a", None, None)).response_budget(),
            Duration::from_secs(45)
        );
    }

    #[test]
    fn test_unbounded_config_does_not_panic() {
        let sup = DeadlineSupervisor::new(&DeadlineConfig {
            circuit_timeout_seconds: f64::INFINITY,
            admission_timeout_seconds: 5.0,
            circuit_overrides: HashMap::from([("huge".to_string(), 1e20)]),
        });
        let d = sup.plan(&request());
        assert_eq!(d.response_budget(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_admission_check() {
        let sup = supervisor(5.0, 45.0);
        let d = sup.plan(&request());
        assert!(sup.check_admission(&d, d.received_at + Duration::from_secs(4)).is_ok());
        let err = sup
            .check_admission(&d, d.received_at + Duration::from_millis(5001))
            .unwrap_err();
        assert_eq!(err, SessionError::AdmissionTimeout { budget_ms: 5000 });
    }

    #[test]
    fn test_proving_deadline_fails_fast() {
        let sup = supervisor(5.0, 45.0);
        let c = circuit("age_v1", None, Some(22_000));
        let d = sup.refine(sup.plan(&request()), &c);

        let now = d.received_at + Duration::from_secs(2);
        assert_eq!(sup.proving_deadline(&d, &c, now), Ok(d.response));

        // 22s expected, only 20s left
        let now = d.received_at + Duration::from_secs(25);
        assert_eq!(
            sup.proving_deadline(&d, &c, now),
            Err(SessionError::ProofTimeout { remaining_ms: 20_000 })
        );

        // nothing left at all
        let now = d.received_at + Duration::from_secs(50);
        let unknown = circuit("x", None, None);
        assert!(matches!(
            sup.proving_deadline(&d, &unknown, now),
            Err(SessionError::ProofTimeout { remaining_ms: 0 })
        ));
    }

    #[test]
    fn test_trace_follows_state_machine() {
        let mut trace = SessionTrace::new(SessionId("t".to_string()), Instant::now());
        assert!(trace.advance(SessionState::Queued));
        assert!(!trace.advance(SessionState::Completed));
        assert!(trace.advance(SessionState::Admitted));
        assert!(trace.advance(SessionState::Proving));
        assert!(trace.advance(SessionState::Completed));
        assert!(trace.advance(SessionState::Cleaned));
        assert!(!trace.advance(SessionState::Cleaned));

        assert_eq!(trace.state(), SessionState::Cleaned);
        assert_eq!(trace.outcome(), SessionState::Completed);
        let states: Vec<SessionState> = trace.history().iter().map(|(s, _)| *s).collect();
        assert_eq!(
            states,
            vec![
                SessionState::Received,
                SessionState::Queued,
                SessionState::Admitted,
                SessionState::Proving,
                SessionState::Completed,
                SessionState::Cleaned,
            ]
        );
    }
}
