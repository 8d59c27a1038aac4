//! Per-step circuit breaker.
//!
//! The breaker is a plain state machine: callers pass `now` and report the
//! outcome of every admitted invocation. `CLOSED` admits everything, `OPEN`
//! rejects until the cool-down elapses, `HALF_OPEN` admits exactly one trial.

use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitState {
    pub step_id: String,
    pub phase: CircuitPhase,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
}

/// How an invocation was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single probe allowed after the cool-down.
    Trial,
}

/// Invocation refused because the circuit is open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit open for step '{step_id}' (retry after {retry_after:?})")]
pub struct CircuitOpen {
    pub step_id: String,
    pub retry_after: Duration,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_threshold: u32,
    cooldown: Duration,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(step_id: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState {
                step_id: step_id.into(),
                phase: CircuitPhase::Closed,
                consecutive_failures: 0,
                opened_at: None,
            },
            failure_threshold: failure_threshold.max(1),
            cooldown,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> &CircuitState {
        &self.state
    }

    pub fn phase(&self) -> CircuitPhase {
        self.state.phase
    }

    /// Ask permission to invoke the step.
    ///
    /// An admitted invocation must be followed by exactly one
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn try_acquire(&mut self, now: Instant) -> Result<Admission, CircuitOpen> {
        match self.state.phase {
            CircuitPhase::Closed => Ok(Admission::Normal),
            CircuitPhase::Open => {
                let opened_at = self.state.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.cooldown {
                    self.state.phase = CircuitPhase::HalfOpen;
                    self.trial_in_flight = true;
                    Ok(Admission::Trial)
                } else {
                    Err(self.refusal(self.cooldown - elapsed))
                }
            }
            CircuitPhase::HalfOpen => {
                if self.trial_in_flight {
                    Err(self.refusal(Duration::ZERO))
                } else {
                    self.trial_in_flight = true;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state.phase = CircuitPhase::Closed;
        self.state.consecutive_failures = 0;
        self.state.opened_at = None;
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        self.trial_in_flight = false;
        let trips = match self.state.phase {
            CircuitPhase::HalfOpen => true,
            CircuitPhase::Closed => self.state.consecutive_failures >= self.failure_threshold,
            CircuitPhase::Open => false,
        };
        if trips {
            self.state.phase = CircuitPhase::Open;
            self.state.opened_at = Some(now);
        }
    }

    fn refusal(&self, retry_after: Duration) -> CircuitOpen {
        CircuitOpen {
            step_id: self.state.step_id.clone(),
            retry_after,
        }
    }
}
