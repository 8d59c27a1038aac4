//! Worker and Evaluator roles.
//!
//! The [`Worker`] and [`Evaluator`] traits decouple the Pod loop from what
//! actually does the work. Production runs use [`CommandWorker`] and
//! [`RequirementEvaluator`] (or the LLM adapters in [`llm`]); tests use the
//! scripted doubles in `test_support`.

pub mod command;
pub mod evaluator;
pub mod llm;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::types::{Instruction, ResultDoc, Verdict};
use crate::error::ChainError;
use crate::pod::PodSpec;

pub use command::CommandWorker;
pub use evaluator::RequirementEvaluator;

/// Executes one instruction and returns the result payload.
///
/// Workers are stateless across attempts: everything they need is in the
/// instruction. An `Err` becomes a gap, never a Pod failure.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(&self, instruction: &Instruction) -> anyhow::Result<Value>;
}

/// Binary judge of a result against its instruction.
///
/// Must fail closed: anything short of certain satisfaction is a `Fail`.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, instruction: &Instruction, result: &ResultDoc) -> Verdict;
}

/// Named worker roles plus the supervisor's evaluator.
#[derive(Clone)]
pub struct Roles {
    workers: BTreeMap<String, Arc<dyn Worker>>,
    evaluator: Arc<dyn Evaluator>,
}

impl Roles {
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            workers: BTreeMap::new(),
            evaluator,
        }
    }

    pub fn with_worker(mut self, role: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        self.workers.insert(role.into(), worker);
        self
    }

    pub fn worker(&self, role: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(role).cloned()
    }

    pub fn evaluator(&self) -> Arc<dyn Evaluator> {
        Arc::clone(&self.evaluator)
    }

    pub fn has_worker(&self, role: &str) -> bool {
        self.workers.contains_key(role)
    }

    /// Workers for `pod`, each with a directory-safe id unique within the Pod.
    ///
    /// A role listed twice runs twice (`role`, `role-2`).
    pub fn resolve(&self, pod: &PodSpec) -> Result<Vec<(String, Arc<dyn Worker>)>, ChainError> {
        let mut resolved: Vec<(String, Arc<dyn Worker>)> = Vec::with_capacity(pod.workers.len());
        for role in &pod.workers {
            let worker = self.worker(role).ok_or_else(|| ChainError::UnknownWorker {
                pod: pod.name.clone(),
                worker: role.clone(),
            })?;
            let mut id = crate::io::layout::slug(role);
            let mut n = 1;
            while resolved.iter().any(|(existing, _)| *existing == id) {
                n += 1;
                id = format!("{}-{n}", crate::io::layout::slug(role));
            }
            resolved.push((id, worker));
        }
        Ok(resolved)
    }
}
