//! Per-run registries shared by every Pod, chain and step of a workflow.

pub mod perf;
pub mod state;

use std::sync::Arc;

use crate::events::{Event, EventSink, TracingSink};
use crate::io::config::OrchestratorConfig;

pub use perf::{PerformanceTracker, Timing};
pub use state::{PodRecord, PodStateManager};

/// Explicitly constructed run context; clones share the same registries.
#[derive(Clone)]
pub struct RunContext {
    pub config: Arc<OrchestratorConfig>,
    pub states: PodStateManager,
    pub perf: PerformanceTracker,
    sink: Arc<dyn EventSink>,
}

impl RunContext {
    pub fn new(config: OrchestratorConfig) -> Self {
        let perf = PerformanceTracker::new(config.slow_pod_threshold);
        Self {
            config: Arc::new(config),
            states: PodStateManager::default(),
            perf,
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn emit(&self, event: Event) {
        self.sink.emit(event);
    }
}
