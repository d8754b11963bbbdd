//! Rolling performance statistics over recent sessions.

use std::collections::VecDeque;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::response::ProofResponse;
use crate::types::ProofStatus;

/// Number of recent completed sessions kept for timing statistics.
pub const WINDOW_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimingSummary {
    pub samples: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Default)]
struct Window {
    values: VecDeque<f64>,
}

impl Window {
    fn push(&mut self, v: f64) {
        if self.values.len() == WINDOW_SIZE {
            self.values.pop_front();
        }
        self.values.push_back(v);
    }

    fn summary(&self) -> Option<TimingSummary> {
        if self.values.is_empty() {
            return None;
        }
        let sum: f64 = self.values.iter().sum();
        let min = self.values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(TimingSummary {
            samples: self.values.len(),
            avg: sum / self.values.len() as f64,
            min,
            max,
        })
    }
}

#[derive(Debug, Default)]
struct Inner {
    requests: u64,
    completed: u64,
    failed: u64,
    timeouts: u64,
    proof: Window,
    overhead: Window,
    total: Window,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub uptime_seconds: u64,
    pub requests: u64,
    pub completed: u64,
    pub failed: u64,
    /// Admission and proof timeouts.
    pub timeouts: u64,
    /// Completed / requests, 0 before the first request.
    pub success_rate: f64,
    pub proof_time: Option<TimingSummary>,
    pub overhead_time: Option<TimingSummary>,
    pub total_time: Option<TimingSummary>,
}

pub struct PerformanceStats {
    started_at: Instant,
    inner: Mutex<Inner>,
}

impl Default for PerformanceStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub async fn record(&self, response: &ProofResponse) {
        let mut inner = self.inner.lock().await;
        inner.requests += 1;
        match response.status {
            ProofStatus::Completed => {
                inner.completed += 1;
                inner.proof.push(response.proof_time);
                inner.overhead.push(response.overhead_time);
                inner.total.push(response.total_time);
            }
            ProofStatus::AdmissionTimeout | ProofStatus::ProofTimeout => {
                inner.failed += 1;
                inner.timeouts += 1;
            }
            _ => inner.failed += 1,
        }
    }

    pub async fn summary(&self) -> PerformanceSummary {
        let inner = self.inner.lock().await;
        let success_rate = if inner.requests == 0 {
            0.0
        } else {
            inner.completed as f64 / inner.requests as f64
        };
        PerformanceSummary {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            requests: inner.requests,
            completed: inner.completed,
            failed: inner.failed,
            timeouts: inner.timeouts,
            success_rate,
            proof_time: inner.proof.summary(),
            overhead_time: inner.overhead.summary(),
            total_time: inner.total.summary(),
        }
    }
}
