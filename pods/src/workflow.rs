//! Workflow DAG scheduling with per-step circuit breakers and retries.
//!
//! A workflow is a set of steps, each a Pod or a chain, with dependencies
//! between them. [`WorkflowOrchestrator::run`] launches every step whose
//! dependencies are accepted, bounded by `concurrency_limit`, and cancels
//! the transitive dependents of any step that fails.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant as StdInstant};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::{Id as TaskId, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::chain::{ChainOrchestrator, ChainOutcome, ChainSpec};
use crate::core::circuit::{Admission, CircuitBreaker, CircuitOpen, CircuitPhase, CircuitState};
use crate::core::graph::StepGraph;
use crate::core::types::{AttemptRecord, StepStatus};
use crate::error::{ChainError, GraphError, display_chain};
use crate::events::Event;
use crate::io::channel::FileChannel;
use crate::io::checkpoint::{Checkpoint, CheckpointStore};
use crate::io::layout::step_dir;
use crate::pod::PodSpec;
use crate::registry::RunContext;
use crate::roles::Roles;

/// What a step runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepTarget {
    Pod(PodSpec),
    Chain(ChainSpec),
}

impl StepTarget {
    /// A single Pod runs as a one-Pod chain.
    pub fn to_chain(&self) -> ChainSpec {
        match self {
            StepTarget::Pod(pod) => ChainSpec::single(pod.clone()),
            StepTarget::Chain(chain) => chain.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStep {
    pub step_id: String,
    pub target: StepTarget,
    pub dependencies: BTreeSet<String>,
    pub status: StepStatus,
    pub retries_used: u32,
}

impl WorkflowStep {
    pub fn new(step_id: impl Into<String>, target: StepTarget) -> Self {
        Self {
            step_id: step_id.into(),
            target,
            dependencies: BTreeSet::new(),
            status: StepStatus::Pending,
            retries_used: 0,
        }
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }
}

/// A submitted, validated workflow.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    steps: BTreeMap<String, WorkflowStep>,
    graph: StepGraph,
}

impl WorkflowGraph {
    pub fn order(&self) -> &[String] {
        self.graph.topological_order()
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.get(step_id)
    }

    pub fn steps(&self) -> impl Iterator<Item = &WorkflowStep> {
        self.steps.values()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// One invocation of a step.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub step_id: String,
    pub target: StepTarget,
    /// 1-based try number within this run.
    pub try_number: u32,
}

/// Runs one try of a step. `ChainError::Failure` is a quality failure and
/// may be retried; every other error is infrastructure.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, request: &StepRequest) -> Result<ChainOutcome, ChainError>;
}

/// Runs steps as chains under `<session>/steps/<step_id>/`.
pub struct PodStepExecutor {
    ctx: RunContext,
    roles: Roles,
    channel: FileChannel,
}

impl PodStepExecutor {
    pub fn new(ctx: RunContext, roles: Roles, channel: FileChannel) -> Self {
        Self {
            ctx,
            roles,
            channel,
        }
    }
}

#[async_trait]
impl StepExecutor for PodStepExecutor {
    async fn execute(&self, request: &StepRequest) -> Result<ChainOutcome, ChainError> {
        let channel = self.channel.scoped(step_dir(&request.step_id));
        ChainOrchestrator::new(self.ctx.clone(), self.roles.clone(), channel)
            .run_chain(&request.target.to_chain())
            .await
    }
}

/// Gap history of one rejected try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TryRecord {
    pub try_number: u32,
    /// Pod that rejected the try.
    pub pod: String,
    pub attempts: Vec<AttemptRecord>,
}

/// User-visible outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub step_id: String,
    pub status: StepStatus,
    pub retries_used: u32,
    /// Times the executor was invoked in this run.
    pub invocations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Every rejected try with its per-attempt gaps.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tries: Vec<TryRecord>,
    pub resumed: bool,
    pub elapsed_ms: u64,
}

impl StepReport {
    fn new(step_id: &str, status: StepStatus) -> Self {
        Self {
            step_id: step_id.to_string(),
            status,
            retries_used: 0,
            invocations: 0,
            output: None,
            result_path: None,
            failure: None,
            tries: Vec::new(),
            resumed: false,
            elapsed_ms: 0,
        }
    }

    fn failed(step_id: &str, status: StepStatus, failure: String) -> Self {
        let mut report = Self::new(step_id, status);
        report.failure = Some(failure);
        report
    }

    /// Gaps of every attempt of every try, oldest first.
    pub fn gap_history(&self) -> Vec<String> {
        self.tries
            .iter()
            .flat_map(|record| &record.attempts)
            .flat_map(|attempt| attempt.gaps.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub workflow: String,
    pub steps: BTreeMap<String, StepReport>,
}

impl WorkflowResult {
    pub fn is_success(&self) -> bool {
        self.steps
            .values()
            .all(|step| step.status == StepStatus::Accepted)
    }

    pub fn has_infrastructure_failure(&self) -> bool {
        self.steps
            .values()
            .any(|step| step.status == StepStatus::InfrastructureFailed)
    }

    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.steps.get(step_id).map(|step| step.status)
    }
}

type Breakers = Arc<Mutex<BTreeMap<String, CircuitBreaker>>>;

pub struct WorkflowOrchestrator {
    name: String,
    ctx: RunContext,
    executor: Arc<dyn StepExecutor>,
    breakers: Breakers,
    checkpoint: Option<CheckpointStore>,
    cancel: CancellationToken,
}

impl WorkflowOrchestrator {
    pub fn new(name: impl Into<String>, ctx: RunContext, executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            name: name.into(),
            ctx,
            executor,
            breakers: Arc::default(),
            checkpoint: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_checkpoint(mut self, store: CheckpointStore) -> Self {
        self.checkpoint = Some(store);
        self
    }

    /// Token that cancels every step not yet started and any backoff wait.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Breaker state for `step_id`, once the step has been invoked.
    pub fn circuit_state(&self, step_id: &str) -> Option<CircuitState> {
        lock(&self.breakers)
            .get(step_id)
            .map(|breaker| breaker.state().clone())
    }

    /// Validate the step graph.
    pub fn submit(&self, steps: Vec<WorkflowStep>) -> Result<WorkflowGraph, GraphError> {
        let graph = StepGraph::build(
            steps
                .iter()
                .map(|step| (step.step_id.as_str(), &step.dependencies)),
        )?;
        let steps = steps
            .into_iter()
            .map(|step| (step.step_id.clone(), step))
            .collect();
        Ok(WorkflowGraph { steps, graph })
    }

    /// Run every step of `graph` to a terminal status.
    ///
    /// Step statuses are also written back into `graph`. The only error is
    /// an unreadable checkpoint; step failures are reported per step.
    #[instrument(skip_all, fields(workflow = %self.name, steps = graph.len()))]
    pub async fn run(&self, graph: &mut WorkflowGraph) -> Result<WorkflowResult> {
        let started = Instant::now();
        let mut checkpoint = match &self.checkpoint {
            Some(store) => store
                .load()
                .await?
                .unwrap_or_else(|| Checkpoint::new(&self.name)),
            None => Checkpoint::new(&self.name),
        };

        let order: Vec<String> = graph.order().to_vec();
        let mut reports: BTreeMap<String, StepReport> = BTreeMap::new();
        let mut pending: BTreeSet<String> = BTreeSet::new();
        for id in &order {
            if let Some(output) = checkpoint.completed.get(id) {
                let mut report = StepReport::new(id, StepStatus::Accepted);
                report.output = Some(output.clone());
                report.resumed = true;
                info!(step_id = %id, "step resumed from checkpoint");
                self.settle(graph, report, &mut reports);
            } else {
                pending.insert(id.clone());
            }
        }

        let runner = StepRunner {
            ctx: self.ctx.clone(),
            executor: Arc::clone(&self.executor),
            breakers: Arc::clone(&self.breakers),
            cancel: self.cancel.clone(),
        };
        let limit = self.ctx.config.concurrency_limit.max(1);
        let mut running: JoinSet<StepReport> = JoinSet::new();
        let mut tasks: HashMap<TaskId, String> = HashMap::new();

        loop {
            if self.cancel.is_cancelled() && !pending.is_empty() {
                warn!(pending = pending.len(), "workflow cancelled");
                for id in std::mem::take(&mut pending) {
                    let report = StepReport::failed(
                        &id,
                        StepStatus::Cancelled,
                        "cancelled: workflow cancelled before the step started".to_string(),
                    );
                    self.settle(graph, report, &mut reports);
                }
            }

            for id in &order {
                if running.len() >= limit {
                    break;
                }
                if !pending.contains(id) {
                    continue;
                }
                let Some(step) = graph.steps.get_mut(id) else {
                    continue;
                };
                let ready = step.dependencies.iter().all(|dep| {
                    reports
                        .get(dep)
                        .is_some_and(|report| report.status == StepStatus::Accepted)
                });
                if !ready {
                    continue;
                }
                pending.remove(id);
                step.status = StepStatus::Running;
                debug!(step_id = %id, "launching step");
                let handle = running.spawn(runner.clone().run(id.clone(), step.target.clone()));
                tasks.insert(handle.id(), id.clone());
            }

            let Some(joined) = running.join_next_with_id().await else {
                break;
            };
            let report = match joined {
                Ok((task, report)) => {
                    tasks.remove(&task);
                    report
                }
                Err(err) => {
                    let id = tasks.remove(&err.id()).unwrap_or_default();
                    warn!(step_id = %id, err = %err, "step task failed");
                    StepReport::failed(
                        &id,
                        StepStatus::InfrastructureFailed,
                        format!("step task failed: {err}"),
                    )
                }
            };
            let step_id = report.step_id.clone();
            let status = report.status;

            if status == StepStatus::Accepted
                && let (Some(store), Some(output)) = (&self.checkpoint, &report.output)
            {
                checkpoint.completed.insert(step_id.clone(), output.clone());
                if let Err(err) = store.write(&checkpoint).await {
                    warn!(err = %display_chain(&err), "failed to write checkpoint");
                }
            }
            self.settle(graph, report, &mut reports);

            if status.is_failure() {
                for dependent in graph.graph.transitive_dependents(&step_id) {
                    if pending.remove(&dependent) {
                        let report = StepReport::failed(
                            &dependent,
                            StepStatus::Cancelled,
                            format!("cancelled: dependency '{step_id}' {status}"),
                        );
                        self.settle(graph, report, &mut reports);
                    }
                }
            }
        }

        // Nothing left runnable: anything still pending waits on a failure.
        for id in std::mem::take(&mut pending) {
            let report = StepReport::failed(
                &id,
                StepStatus::Cancelled,
                "cancelled: dependencies never accepted".to_string(),
            );
            self.settle(graph, report, &mut reports);
        }

        let elapsed = started.elapsed();
        self.ctx.perf.record(&format!("workflow/{}", self.name), elapsed);
        self.ctx.emit(Event::Timing {
            name: format!("workflow/{}", self.name),
            elapsed,
        });
        let result = WorkflowResult {
            workflow: self.name.clone(),
            steps: reports,
        };
        info!(
            success = result.is_success(),
            elapsed_ms = elapsed.as_millis() as u64,
            "workflow finished"
        );
        Ok(result)
    }

    /// Record a terminal step report.
    fn settle(
        &self,
        graph: &mut WorkflowGraph,
        report: StepReport,
        reports: &mut BTreeMap<String, StepReport>,
    ) {
        if let Some(step) = graph.steps.get_mut(&report.step_id) {
            step.status = report.status;
            step.retries_used = report.retries_used;
        }
        self.ctx.emit(Event::StepStatus {
            step_id: report.step_id.clone(),
            status: report.status,
            tries: report.invocations,
        });
        reports.insert(report.step_id.clone(), report);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Breakers run on tokio's clock so paused-time tests can drive cool-downs.
fn now() -> StdInstant {
    Instant::now().into_std()
}

/// Everything a spawned step task needs.
#[derive(Clone)]
struct StepRunner {
    ctx: RunContext,
    executor: Arc<dyn StepExecutor>,
    breakers: Breakers,
    cancel: CancellationToken,
}

impl StepRunner {
    async fn run(self, step_id: String, target: StepTarget) -> StepReport {
        let started = Instant::now();
        let mut report = StepReport::new(&step_id, StepStatus::Running);
        let backoff = self.ctx.config.backoff();
        let max_tries = self.ctx.config.max_retries.saturating_add(1);
        let mut tries = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                report.status = StepStatus::Cancelled;
                report.failure = Some("cancelled: workflow cancelled".to_string());
                break;
            }
            if let Err(open) = self.admit(&step_id) {
                warn!(step_id = %step_id, retry_after_ms = open.retry_after.as_millis() as u64, "circuit open");
                report.status = StepStatus::Rejected;
                report.failure = Some(open.to_string());
                break;
            }

            tries += 1;
            self.ctx.emit(Event::StepStatus {
                step_id: step_id.clone(),
                status: StepStatus::Running,
                tries,
            });
            let request = StepRequest {
                step_id: step_id.clone(),
                target: target.clone(),
                try_number: tries,
            };
            let try_started = Instant::now();
            let outcome = self
                .ctx
                .perf
                .track(&format!("step/{step_id}"), self.executor.execute(&request))
                .await;
            let elapsed = try_started.elapsed();
            if self.ctx.perf.is_slow(elapsed) {
                warn!(step_id = %step_id, elapsed_ms = elapsed.as_millis() as u64, "slow step");
            }

            match outcome {
                Ok(chain) => {
                    self.record(&step_id, true);
                    report.status = StepStatus::Accepted;
                    report.output = Some(chain.output);
                    report.result_path = Some(chain.result_path);
                    break;
                }
                Err(ChainError::Failure {
                    failed_step,
                    gaps,
                    history,
                }) => {
                    self.record(&step_id, false);
                    info!(step_id = %step_id, try_number = tries, pod = %failed_step, "step try rejected");
                    report.failure = Some(format!(
                        "rejected at pod '{failed_step}': {}",
                        gaps.join("; ")
                    ));
                    report.tries.push(TryRecord {
                        try_number: tries,
                        pod: failed_step,
                        attempts: history,
                    });
                    if tries >= max_tries {
                        report.status = StepStatus::Rejected;
                        break;
                    }
                    let delay = backoff.delay(tries - 1);
                    debug!(step_id = %step_id, delay_ms = delay.as_millis() as u64, "backing off");
                    if !self.wait(delay).await {
                        report.status = StepStatus::Cancelled;
                        report.failure = Some("cancelled: workflow cancelled during backoff".to_string());
                        break;
                    }
                }
                Err(err) => {
                    self.record(&step_id, false);
                    let failure = display_chain(&err);
                    warn!(step_id = %step_id, err = %failure, "step infrastructure failure");
                    report.status = StepStatus::InfrastructureFailed;
                    report.failure = Some(failure);
                    break;
                }
            }
        }

        report.invocations = tries;
        report.retries_used = tries.saturating_sub(1);
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        report
    }

    /// Sleep for `delay`; `false` if cancelled first.
    async fn wait(&self, delay: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = self.cancel.cancelled() => false,
        }
    }

    fn admit(&self, step_id: &str) -> Result<Admission, CircuitOpen> {
        let (from, to, admission) = {
            let mut breakers = lock(&self.breakers);
            let breaker = breakers.entry(step_id.to_string()).or_insert_with(|| {
                CircuitBreaker::new(
                    step_id,
                    self.ctx.config.failure_threshold,
                    self.ctx.config.cooldown,
                )
            });
            let from = breaker.phase();
            let admission = breaker.try_acquire(now());
            (from, breaker.phase(), admission)
        };
        self.phase_changed(step_id, from, to);
        admission
    }

    fn record(&self, step_id: &str, success: bool) {
        let (from, to) = {
            let mut breakers = lock(&self.breakers);
            let Some(breaker) = breakers.get_mut(step_id) else {
                return;
            };
            let from = breaker.phase();
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure(now());
            }
            (from, breaker.phase())
        };
        self.phase_changed(step_id, from, to);
    }

    fn phase_changed(&self, step_id: &str, from: CircuitPhase, to: CircuitPhase) {
        if from != to {
            self.ctx.emit(Event::CircuitTransition {
                step_id: step_id.to_string(),
                from,
                to,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingSink, ScriptedStepExecutor, StepScript, fast_config};
    use serde_json::json;

    fn pod_step(id: &str) -> WorkflowStep {
        WorkflowStep::new(id, StepTarget::Pod(PodSpec::new(id, "task")))
    }

    fn orchestrator(executor: Arc<ScriptedStepExecutor>) -> WorkflowOrchestrator {
        WorkflowOrchestrator::new("wf", RunContext::new(fast_config()), executor)
    }

    #[test]
    fn submit_rejects_cycles_with_path() {
        let orchestrator = orchestrator(Arc::new(ScriptedStepExecutor::new()));
        let err = orchestrator
            .submit(vec![
                pod_step("a").depends_on(["b"]),
                pod_step("b").depends_on(["a"]),
            ])
            .expect_err("cycle");
        assert!(matches!(err, GraphError::Cycle { path } if path.len() == 3));
    }

    #[test]
    fn pod_target_runs_as_single_pod_chain() {
        let target = StepTarget::Pod(PodSpec::new("a", "task"));
        assert_eq!(target.to_chain().pods, vec![PodSpec::new("a", "task")]);
    }

    #[tokio::test]
    async fn dependents_see_accepted_dependencies_only() {
        let executor = Arc::new(ScriptedStepExecutor::new());
        let orchestrator = orchestrator(executor.clone());
        let mut graph = orchestrator
            .submit(vec![
                pod_step("c").depends_on(["b"]),
                pod_step("b").depends_on(["a"]),
                pod_step("a"),
            ])
            .expect("submit");
        let result = orchestrator.run(&mut graph).await.expect("run");

        assert!(result.is_success());
        assert_eq!(executor.started(), ["a", "b", "c"]);
        assert_eq!(graph.step("c").map(|s| s.status), Some(StepStatus::Accepted));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_steps_run_in_parallel_up_to_the_limit() {
        let executor = Arc::new(ScriptedStepExecutor::new().with_delay(Duration::from_millis(10)));
        let mut config = fast_config();
        config.concurrency_limit = 2;
        let orchestrator =
            WorkflowOrchestrator::new("wf", RunContext::new(config), executor.clone());
        let mut graph = orchestrator
            .submit(["a", "b", "c", "d", "e"].into_iter().map(pod_step).collect())
            .expect("submit");
        let result = orchestrator.run(&mut graph).await.expect("run");

        assert!(result.is_success());
        assert_eq!(executor.started().len(), 5);
        assert_eq!(executor.peak_in_flight(), 2);
    }

    /// Retries follow the backoff schedule and report every try's gaps.
    #[tokio::test(start_paused = true)]
    async fn rejected_step_exhausts_retries_then_cascades() {
        let executor = Arc::new(
            ScriptedStepExecutor::new().with_script("a", [StepScript::reject(["too short"])]),
        );
        let orchestrator = orchestrator(executor.clone());
        let mut graph = orchestrator
            .submit(vec![pod_step("a"), pod_step("b").depends_on(["a"])])
            .expect("submit");
        let result = orchestrator.run(&mut graph).await.expect("run");

        let a = &result.steps["a"];
        assert_eq!(a.status, StepStatus::Rejected);
        assert_eq!(executor.invocations("a"), 2);
        assert_eq!(a.retries_used, 1);
        assert_eq!(a.tries.len(), 2);
        assert_eq!(a.gap_history(), ["too short", "too short"]);
        assert_eq!(result.status_of("b"), Some(StepStatus::Cancelled));
        assert_eq!(executor.invocations("b"), 0);
    }

    #[tokio::test]
    async fn infrastructure_failures_are_not_retried() {
        let executor = Arc::new(
            ScriptedStepExecutor::new().with_script("a", [StepScript::Infrastructure]),
        );
        let orchestrator = orchestrator(executor.clone());
        let mut graph = orchestrator.submit(vec![pod_step("a")]).expect("submit");
        let result = orchestrator.run(&mut graph).await.expect("run");

        assert_eq!(result.status_of("a"), Some(StepStatus::InfrastructureFailed));
        assert!(result.has_infrastructure_failure());
        assert_eq!(executor.invocations("a"), 1);
    }

    /// A breaker opened by one run refuses the next run without invoking
    /// the step, and admits one trial after the cool-down.
    #[tokio::test(start_paused = true)]
    async fn open_circuit_rejects_without_invoking() {
        let mut config = fast_config();
        config.failure_threshold = 2;
        config.max_retries = 1;
        config.cooldown = Duration::from_secs(60);
        let executor = Arc::new(
            ScriptedStepExecutor::new().with_script(
                "a",
                [
                    StepScript::reject(["bad"]),
                    StepScript::reject(["bad"]),
                    StepScript::Accept(json!("ok")),
                ],
            ),
        );
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = WorkflowOrchestrator::new(
            "wf",
            RunContext::new(config).with_sink(sink.clone()),
            executor.clone(),
        );

        let mut graph = orchestrator.submit(vec![pod_step("a")]).expect("submit");
        orchestrator.run(&mut graph).await.expect("first run");
        assert_eq!(
            orchestrator.circuit_state("a").map(|s| s.phase),
            Some(CircuitPhase::Open)
        );

        let mut graph = orchestrator.submit(vec![pod_step("a")]).expect("submit");
        let refused = orchestrator.run(&mut graph).await.expect("second run");
        assert_eq!(refused.status_of("a"), Some(StepStatus::Rejected));
        assert!(
            refused.steps["a"]
                .failure
                .as_deref()
                .is_some_and(|f| f.starts_with("circuit open"))
        );
        assert_eq!(refused.steps["a"].retries_used, 0);
        assert_eq!(executor.invocations("a"), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        let mut graph = orchestrator.submit(vec![pod_step("a")]).expect("submit");
        let recovered = orchestrator.run(&mut graph).await.expect("third run");
        assert_eq!(recovered.status_of("a"), Some(StepStatus::Accepted));
        assert_eq!(executor.invocations("a"), 3);
        assert_eq!(
            orchestrator.circuit_state("a").map(|s| s.phase),
            Some(CircuitPhase::Closed)
        );
        assert!(sink.events().iter().any(|event| matches!(
            event,
            Event::CircuitTransition {
                from: CircuitPhase::HalfOpen,
                to: CircuitPhase::Closed,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn cancelled_workflow_starts_nothing() {
        let executor = Arc::new(ScriptedStepExecutor::new());
        let orchestrator = orchestrator(executor.clone());
        orchestrator.cancel_token().cancel();
        let mut graph = orchestrator
            .submit(vec![pod_step("a"), pod_step("b").depends_on(["a"])])
            .expect("submit");
        let result = orchestrator.run(&mut graph).await.expect("run");

        assert_eq!(result.status_of("a"), Some(StepStatus::Cancelled));
        assert_eq!(result.status_of("b"), Some(StepStatus::Cancelled));
        assert!(executor.started().is_empty());
    }
}
