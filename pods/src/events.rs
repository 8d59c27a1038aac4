//! Telemetry events emitted by the orchestration core.
//!
//! The core never depends on what a sink does with an event; the default
//! sink forwards to `tracing`.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::circuit::CircuitPhase;
use crate::core::types::{PodState, StepStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PodTransition {
        pod_id: String,
        from: PodState,
        to: PodState,
        attempt: u32,
    },
    StepStatus {
        step_id: String,
        status: StepStatus,
        tries: u32,
    },
    CircuitTransition {
        step_id: String,
        from: CircuitPhase,
        to: CircuitPhase,
    },
    Timing {
        name: String,
        elapsed: Duration,
    },
    Rollback {
        chain: String,
        removed: usize,
        already_absent: usize,
        errors: usize,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match event {
            Event::PodTransition {
                pod_id,
                from,
                to,
                attempt,
            } => debug!(pod_id = %pod_id, %from, %to, attempt, "pod transition"),
            Event::StepStatus {
                step_id,
                status,
                tries,
            } => info!(step_id = %step_id, %status, tries, "step status"),
            Event::CircuitTransition { step_id, from, to } => {
                warn!(step_id = %step_id, ?from, ?to, "circuit transition");
            }
            Event::Timing { name, elapsed } => {
                debug!(operation = %name, elapsed_ms = elapsed.as_millis() as u64, "timing");
            }
            Event::Rollback {
                chain,
                removed,
                already_absent,
                errors,
            } => warn!(chain = %chain, removed, already_absent, errors, "chain rolled back"),
        }
    }
}
