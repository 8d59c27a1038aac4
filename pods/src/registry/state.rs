//! Pod state registry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::types::{Feedback, PodState};
use crate::error::StateError;

/// Current state of one Pod instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PodRecord {
    pub pod_id: String,
    pub state: PodState,
    pub attempt_count: u32,
    pub last_feedback: Option<Feedback>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when an infrastructure failure aborted the Pod.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

/// Records every Pod of a run. Records are never removed.
#[derive(Debug, Clone, Default)]
pub struct PodStateManager {
    records: Arc<Mutex<BTreeMap<String, PodRecord>>>,
}

impl PodStateManager {
    pub fn register(&self, pod_id: &str) -> Result<PodRecord, StateError> {
        let mut records = self.lock();
        if records.contains_key(pod_id) {
            return Err(StateError::AlreadyRegistered(pod_id.to_string()));
        }
        let now = Utc::now();
        let record = PodRecord {
            pod_id: pod_id.to_string(),
            state: PodState::Created,
            attempt_count: 0,
            last_feedback: None,
            created_at: now,
            updated_at: now,
            abort_reason: None,
        };
        records.insert(pod_id.to_string(), record.clone());
        Ok(record)
    }

    /// Move a Pod to `to`, refusing transitions the lifecycle forbids.
    /// Returns the previous state.
    pub fn transition(&self, pod_id: &str, to: PodState) -> Result<PodState, StateError> {
        self.update(pod_id, |record| {
            let from = record.state;
            if !from.can_transition_to(to) {
                return Err(StateError::IllegalTransition {
                    pod_id: pod_id.to_string(),
                    from,
                    to,
                });
            }
            record.state = to;
            Ok(from)
        })
    }

    pub fn record_attempt(&self, pod_id: &str, attempt: u32) -> Result<(), StateError> {
        self.update(pod_id, |record| {
            record.attempt_count = attempt;
            Ok(())
        })
    }

    pub fn record_feedback(&self, pod_id: &str, feedback: Feedback) -> Result<(), StateError> {
        self.update(pod_id, |record| {
            record.last_feedback = Some(feedback);
            Ok(())
        })
    }

    pub fn record_abort(&self, pod_id: &str, reason: String) -> Result<(), StateError> {
        self.update(pod_id, |record| {
            record.abort_reason = Some(reason);
            Ok(())
        })
    }

    pub fn get(&self, pod_id: &str) -> Option<PodRecord> {
        self.lock().get(pod_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<PodRecord> {
        self.lock().values().cloned().collect()
    }

    pub fn count_in(&self, state: PodState) -> usize {
        self.lock().values().filter(|r| r.state == state).count()
    }

    fn update<T>(
        &self,
        pod_id: &str,
        f: impl FnOnce(&mut PodRecord) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        let mut records = self.lock();
        let record = records
            .get_mut(pod_id)
            .ok_or_else(|| StateError::Unknown(pod_id.to_string()))?;
        let out = f(record)?;
        record.updated_at = Utc::now();
        Ok(out)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, PodRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_walk_the_happy_path() {
        let states = PodStateManager::default();
        states.register("p").expect("register");
        for next in [
            PodState::Instructing,
            PodState::Executing,
            PodState::Evaluating,
            PodState::Accepted,
        ] {
            states.transition("p", next).expect("legal transition");
        }
        let record = states.get("p").expect("record");
        assert_eq!(record.state, PodState::Accepted);
        assert!(record.updated_at >= record.created_at);
        assert_eq!(states.count_in(PodState::Accepted), 1);
    }

    #[test]
    fn illegal_transitions_are_refused_and_state_is_kept() {
        let states = PodStateManager::default();
        states.register("p").expect("register");
        let err = states
            .transition("p", PodState::Accepted)
            .expect_err("illegal");
        assert!(matches!(err, StateError::IllegalTransition { .. }));
        assert_eq!(states.get("p").expect("record").state, PodState::Created);
    }

    #[test]
    fn duplicate_and_unknown_pods_are_errors() {
        let states = PodStateManager::default();
        states.register("p").expect("register");
        assert!(matches!(
            states.register("p"),
            Err(StateError::AlreadyRegistered(_))
        ));
        assert!(matches!(
            states.record_attempt("ghost", 1),
            Err(StateError::Unknown(_))
        ));
    }

    #[test]
    fn abort_reason_is_recorded() {
        let states = PodStateManager::default();
        states.register("p").expect("register");
        states.transition("p", PodState::Instructing).expect("start");
        states.transition("p", PodState::Rejected).expect("abort");
        states
            .record_abort("p", "disk full".to_string())
            .expect("record abort");
        let record = states.get("p").expect("record");
        assert_eq!(record.state, PodState::Rejected);
        assert_eq!(record.abort_reason.as_deref(), Some("disk full"));
    }
}
