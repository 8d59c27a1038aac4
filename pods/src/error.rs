//! Error taxonomy for the orchestration core.
//!
//! Quality failures are not errors: a Pod that exhausts its attempts returns
//! a `REJECTED` outcome. The types here cover what escapes the Pod loop
//! (infrastructure), what a chain reports upward, and submission errors.

use std::error::Error as StdError;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::core::types::{AttemptRecord, PodState};

pub use crate::core::circuit::CircuitOpen;

/// Failure of the file channel itself. Always infrastructure.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("i/o error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {waited:?} waiting for {}", path.display())]
    Timeout { path: PathBuf, waited: Duration },
    #[error("{} already exists", path.display())]
    Conflict { path: PathBuf },
    #[error("malformed document {}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode document for {}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("timed out after {waited:?} acquiring lock on {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("{} is outside the pod directory", path.display())]
    OutsidePod { path: PathBuf },
}

impl ChannelError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ChannelError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ChannelError::Io { path, .. }
            | ChannelError::Timeout { path, .. }
            | ChannelError::Conflict { path }
            | ChannelError::Malformed { path, .. }
            | ChannelError::Encode { path, .. }
            | ChannelError::LockTimeout { path, .. }
            | ChannelError::OutsidePod { path } => path,
        }
    }
}

/// A Pod aborted because its channel failed.
#[derive(Debug, Error)]
#[error("infrastructure failure in pod {pod_id}")]
pub struct InfrastructureError {
    pub pod_id: String,
    #[source]
    pub source: ChannelError,
}

/// Worker-side failure; converted to a gap, never propagated.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker {worker} timed out after {after:?}")]
    Timeout { worker: String, after: Duration },
    #[error("Worker failed: {cause}")]
    Failed { worker: String, cause: String },
}

impl WorkerError {
    pub fn worker(&self) -> &str {
        match self {
            WorkerError::Timeout { worker, .. } | WorkerError::Failed { worker, .. } => worker,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChainError {
    /// A pod was rejected; earlier pods' artifacts have been rolled back.
    #[error("chain rejected at pod '{failed_step}': {}", gaps.join("; "))]
    Failure {
        failed_step: String,
        gaps: Vec<String>,
        history: Vec<AttemptRecord>,
    },
    #[error("chain aborted at pod '{failed_step}'")]
    Infrastructure {
        failed_step: String,
        #[source]
        source: InfrastructureError,
    },
    #[error("pod '{pod}' references unknown worker role '{worker}'")]
    UnknownWorker { pod: String, worker: String },
    #[error("pod '{pod}' has output path '{output_path}' outside its directory")]
    OutputPathEscapes { pod: String, output_path: String },
    #[error("chain has no pods")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("pod '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("pod '{0}' is not registered")]
    Unknown(String),
    #[error("illegal transition for pod '{pod_id}': {from} -> {to}")]
    IllegalTransition {
        pod_id: String,
        from: PodState,
        to: PodState,
    },
}

/// Failure reported by an [`LlmProvider`](crate::roles::llm::LlmProvider).
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider returned an unusable response: {0}")]
    InvalidResponse(String),
}

/// `err: cause: cause` rendering for reports, matching anyhow's `{:#}`.
pub fn display_chain(err: &dyn StdError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_chain_includes_every_cause() {
        let err = InfrastructureError {
            pod_id: "pod-a".to_string(),
            source: ChannelError::io(
                "/tmp/x",
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            ),
        };
        assert_eq!(
            display_chain(&err),
            "infrastructure failure in pod pod-a: i/o error on /tmp/x: denied"
        );
    }
}
