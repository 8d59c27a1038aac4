//! Latency tracking for pods, attempts and steps.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Aggregated latency of one named operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timing {
    pub count: u32,
    pub total: Duration,
    pub last: Duration,
    pub max: Duration,
}

impl Timing {
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count
        }
    }
}

#[derive(Debug, Clone)]
pub struct PerformanceTracker {
    timings: Arc<Mutex<BTreeMap<String, Timing>>>,
    slow_threshold: Duration,
}

impl PerformanceTracker {
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            timings: Arc::default(),
            slow_threshold,
        }
    }

    pub fn record(&self, name: &str, elapsed: Duration) {
        let mut timings = self.lock();
        let timing = timings.entry(name.to_string()).or_default();
        timing.count = timing.count.saturating_add(1);
        timing.total = timing.total.saturating_add(elapsed);
        timing.last = elapsed;
        timing.max = timing.max.max(elapsed);
    }

    /// Await `fut`, recording its latency under `name`.
    pub async fn track<F: Future>(&self, name: &str, fut: F) -> F::Output {
        let started = Instant::now();
        let output = fut.await;
        self.record(name, started.elapsed());
        output
    }

    pub fn get(&self, name: &str) -> Option<Timing> {
        self.lock().get(name).copied()
    }

    pub fn is_slow(&self, elapsed: Duration) -> bool {
        elapsed > self.slow_threshold
    }

    /// Operations whose slowest run exceeded the slow threshold.
    pub fn slow_operations(&self) -> Vec<(String, Duration)> {
        self.lock()
            .iter()
            .filter(|(_, timing)| self.is_slow(timing.max))
            .map(|(name, timing)| (name.clone(), timing.max))
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Timing> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Timing>> {
        self.timings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_aggregates_samples() {
        let perf = PerformanceTracker::new(Duration::from_secs(1));
        perf.record("pod", Duration::from_millis(100));
        perf.record("pod", Duration::from_millis(300));
        let timing = perf.get("pod").expect("timing");
        assert_eq!(timing.count, 2);
        assert_eq!(timing.last, Duration::from_millis(300));
        assert_eq!(timing.max, Duration::from_millis(300));
        assert_eq!(timing.mean(), Duration::from_millis(200));
    }

    #[test]
    fn slow_operations_use_threshold() {
        let perf = PerformanceTracker::new(Duration::from_millis(500));
        perf.record("fast", Duration::from_millis(10));
        perf.record("slow", Duration::from_secs(2));
        assert_eq!(
            perf.slow_operations(),
            [("slow".to_string(), Duration::from_secs(2))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn track_measures_awaited_future() {
        let perf = PerformanceTracker::new(Duration::from_secs(1));
        let value = perf
            .track("sleepy", async {
                tokio::time::sleep(Duration::from_millis(250)).await;
                7
            })
            .await;
        assert_eq!(value, 7);
        assert!(perf.get("sleepy").expect("timing").last >= Duration::from_millis(250));
    }
}
