//! Chains: Pods run in order, each fed the previous accepted output.
//!
//! Every write of a chain run goes through a channel carrying one shared
//! [`Manifest`]. When a Pod is rejected (or its channel fails) the manifest
//! drives the rollback, so a failed chain leaves nothing behind.

use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::error::ChainError;
use crate::events::Event;
use crate::io::channel::{FileChannel, Manifest};
use crate::io::layout::pod_dir_name;
use crate::pod::{ChainInput, Pod, PodOutcome, PodSpec};
use crate::registry::RunContext;
use crate::roles::Roles;

/// Chains are data: an ordered list of Pod specs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSpec {
    pub pods: Vec<PodSpec>,
}

impl ChainSpec {
    pub fn new(pods: Vec<PodSpec>) -> Self {
        Self { pods }
    }

    pub fn single(pod: PodSpec) -> Self {
        Self { pods: vec![pod] }
    }
}

/// Successful chain run.
#[derive(Debug, Clone, Serialize)]
pub struct ChainOutcome {
    /// Accepted payload of the last Pod.
    pub output: Value,
    pub result_path: PathBuf,
    pub pods: Vec<PodOutcome>,
}

/// What a rollback removed. Best effort: errors are collected, not raised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub removed: Vec<PathBuf>,
    pub already_absent: Vec<PathBuf>,
    pub errors: Vec<String>,
}

pub struct ChainOrchestrator {
    ctx: RunContext,
    roles: Roles,
    channel: FileChannel,
}

impl ChainOrchestrator {
    /// Orchestrator writing Pod directories under `channel`'s root.
    pub fn new(ctx: RunContext, roles: Roles, channel: FileChannel) -> Self {
        Self {
            ctx,
            roles,
            channel,
        }
    }

    #[instrument(skip_all, fields(root = %self.channel.root().display(), pods = chain.pods.len()))]
    pub async fn run_chain(&self, chain: &ChainSpec) -> Result<ChainOutcome, ChainError> {
        if chain.pods.is_empty() {
            return Err(ChainError::Empty);
        }
        // Check every Pod and resolve its roles before any Pod writes a file.
        for spec in &chain.pods {
            spec.validate()?;
        }
        let resolved = chain
            .pods
            .iter()
            .map(|spec| self.roles.resolve(spec))
            .collect::<Result<Vec<_>, _>>()?;

        let manifest = Manifest::new();
        // A chain root created here goes with the rollback, after its Pods.
        if !tokio::fs::try_exists(self.channel.root()).await.unwrap_or(true) {
            manifest.record_dir(self.channel.root().to_path_buf());
        }
        let channel = self.channel.clone().with_manifest(manifest.clone());
        let mut outcomes: Vec<PodOutcome> = Vec::with_capacity(chain.pods.len());
        let mut input: Option<ChainInput> = None;

        for (spec, workers) in chain.pods.iter().zip(resolved) {
            let pod_id = pod_dir_name(&spec.name);
            let pod_channel = channel.scoped(&pod_id);
            manifest.record_dir(pod_channel.root().to_path_buf());

            let mut pod = Pod::new(pod_id, spec.clone(), pod_channel, self.ctx.clone())
                .with_evaluator(self.roles.evaluator());
            for (id, worker) in workers {
                pod = pod.with_worker(id, worker);
            }
            if let Some(input) = input.take() {
                pod = pod.with_input(input);
            }

            match pod.run().await {
                Err(source) => {
                    self.rollback(&manifest).await;
                    return Err(ChainError::Infrastructure {
                        failed_step: spec.name.clone(),
                        source,
                    });
                }
                Ok(outcome) => match outcome.as_chain_input() {
                    Some(next) => {
                        input = Some(next);
                        outcomes.push(outcome);
                    }
                    None => {
                        info!(pod = %spec.name, attempts = outcome.attempts, "chain pod rejected");
                        self.rollback(&manifest).await;
                        return Err(ChainError::Failure {
                            failed_step: spec.name.clone(),
                            gaps: outcome.last_gaps(),
                            history: outcome.history,
                        });
                    }
                },
            }
        }

        let Some(last) = input else {
            return Err(ChainError::Empty);
        };
        Ok(ChainOutcome {
            output: last.payload,
            result_path: last.path,
            pods: outcomes,
        })
    }

    /// Delete every file in `manifest`, then every directory it recorded.
    ///
    /// Idempotent: already-absent targets are reported, not errors.
    pub async fn rollback(&self, manifest: &Manifest) -> RollbackReport {
        let mut report = RollbackReport::default();
        for path in manifest.files().into_iter().rev() {
            let removed = tokio::fs::remove_file(&path).await;
            record_removal(&mut report, path, removed);
        }
        for dir in manifest.dirs().into_iter().rev() {
            let removed = tokio::fs::remove_dir_all(&dir).await;
            record_removal(&mut report, dir, removed);
        }

        warn!(
            removed = report.removed.len(),
            already_absent = report.already_absent.len(),
            errors = report.errors.len(),
            "chain rolled back"
        );
        self.ctx.emit(Event::Rollback {
            chain: self.channel.root().display().to_string(),
            removed: report.removed.len(),
            already_absent: report.already_absent.len(),
            errors: report.errors.len(),
        });
        report
    }
}

fn record_removal(report: &mut RollbackReport, path: PathBuf, removed: std::io::Result<()>) {
    match removed {
        Ok(()) => report.removed.push(path),
        Err(err) if err.kind() == ErrorKind::NotFound => report.already_absent.push(path),
        Err(err) => report
            .errors
            .push(format!("{}: {err}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedWorker, fast_config};
    use serde_json::json;
    use std::sync::Arc;

    fn orchestrator(root: &std::path::Path, roles: Roles) -> ChainOrchestrator {
        let config = fast_config();
        let channel = FileChannel::from_config(root, &config);
        ChainOrchestrator::new(RunContext::new(config), roles, channel)
    }

    fn roles() -> Roles {
        Roles::new(Arc::new(crate::roles::RequirementEvaluator))
            .with_worker("default", Arc::new(ScriptedWorker::always(json!("ok"))))
    }

    #[tokio::test]
    async fn unknown_worker_fails_before_any_pod_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let chain = ChainSpec::new(vec![
            PodSpec::new("a", "task"),
            PodSpec::new("b", "task").with_workers(["ghost"]),
        ]);
        let err = orchestrator(temp.path(), roles())
            .run_chain(&chain)
            .await
            .expect_err("unknown worker");
        assert!(matches!(err, ChainError::UnknownWorker { worker, .. } if worker == "ghost"));
        assert_eq!(std::fs::read_dir(temp.path()).expect("read dir").count(), 0);
    }

    #[tokio::test]
    async fn escaping_output_path_fails_before_any_pod_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let chain = ChainSpec::new(vec![
            PodSpec::new("a", "task"),
            PodSpec::new("b", "task").with_output_path("../../b.json"),
        ]);
        let err = orchestrator(temp.path(), roles())
            .run_chain(&chain)
            .await
            .expect_err("escaping output path");
        assert!(matches!(
            err,
            ChainError::OutputPathEscapes { pod, .. } if pod == "b"
        ));
        assert_eq!(std::fs::read_dir(temp.path()).expect("read dir").count(), 0);
    }

    #[tokio::test]
    async fn rollback_removes_a_chain_root_it_created() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("steps").join("s1");
        std::fs::create_dir(temp.path().join("steps")).expect("steps dir");
        let chain = ChainSpec::single(PodSpec::new("a", "1. Mention revenue").with_max_attempts(1));

        let err = orchestrator(&root, roles())
            .run_chain(&chain)
            .await
            .expect_err("rejected");

        assert!(matches!(err, ChainError::Failure { .. }));
        assert!(!root.exists());
        assert!(temp.path().join("steps").is_dir());
    }

    #[tokio::test]
    async fn empty_chain_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = orchestrator(temp.path(), roles())
            .run_chain(&ChainSpec::new(Vec::new()))
            .await
            .expect_err("empty");
        assert!(matches!(err, ChainError::Empty));
    }

    /// Rolling back twice reports the second pass as already absent.
    #[tokio::test]
    async fn rollback_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let chain = orchestrator(temp.path(), roles());
        let manifest = Manifest::new();
        let channel = FileChannel::new(temp.path()).with_manifest(manifest.clone());
        channel
            .write_atomic("pod-a/doc.json", &json!(1), crate::io::channel::WriteMode::CreateNew)
            .await
            .expect("write");
        manifest.record_dir(temp.path().join("pod-a"));

        let first = chain.rollback(&manifest).await;
        assert_eq!(first.removed.len(), 2);
        assert!(first.errors.is_empty());

        let second = chain.rollback(&manifest).await;
        assert!(second.removed.is_empty());
        assert_eq!(second.already_absent.len(), 2);
        assert!(!temp.path().join("pod-a").exists());
    }
}
