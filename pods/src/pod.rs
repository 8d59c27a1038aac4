//! Pod: the instruct, execute, evaluate, retry loop.
//!
//! A Pod pairs the supervisor (this module plus an [`Evaluator`]) with one
//! or more [`Worker`]s. All exchange happens through the Pod's
//! [`FileChannel`] scope:
//!
//! ```text
//! attempts/<N>/instructions.json            supervisor -> workers
//! attempts/<N>/workers/<id>/<output_path>   worker -> supervisor
//! attempts/<N>/feedback.json                supervisor verdict
//! result.json                               accepted output
//! ```
//!
//! Quality failures stay inside the loop until attempts run out. Channel
//! failures abort the Pod immediately as [`InfrastructureError`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{
    Aggregation, AttemptRecord, AttemptStatus, FEEDBACK_HEADING, Feedback, INPUT_HEADING,
    Instruction, PodState, ResultDoc, Verdict,
};
use crate::error::{ChainError, ChannelError, InfrastructureError, WorkerError, display_chain};
use crate::events::Event;
use crate::io::channel::{FileChannel, WriteMode};
use crate::io::layout::{AttemptPaths, FINAL_RESULT_FILE, stays_inside};
use crate::registry::RunContext;
use crate::roles::{Evaluator, RequirementEvaluator, Worker};

/// Declarative description of one Pod; chains are lists of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    pub name: String,
    pub task: String,
    #[serde(default = "default_output_path")]
    pub output_path: String,
    /// Worker roles, by name. A role may appear more than once.
    #[serde(default = "default_workers")]
    pub workers: Vec<String>,
    #[serde(default)]
    pub aggregation: Aggregation,
    /// Overrides the configured `max_attempts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

fn default_output_path() -> String {
    "result.json".to_string()
}

fn default_workers() -> Vec<String> {
    vec!["default".to_string()]
}

impl PodSpec {
    pub fn new(name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            output_path: default_output_path(),
            workers: default_workers(),
            aggregation: Aggregation::default(),
            max_attempts: None,
            schema: None,
        }
    }

    pub fn with_workers<I, S>(mut self, workers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.workers = workers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_output_path(mut self, output_path: impl Into<String>) -> Self {
        self.output_path = output_path.into();
        self
    }

    /// Worker results must land inside the Pod's own directory.
    pub fn validate(&self) -> Result<(), ChainError> {
        if stays_inside(&self.output_path) {
            Ok(())
        } else {
            Err(ChainError::OutputPathEscapes {
                pod: self.name.clone(),
                output_path: self.output_path.clone(),
            })
        }
    }
}

/// Accepted output of an upstream Pod, bound into the next Pod's task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainInput {
    pub source_pod: String,
    pub path: PathBuf,
    pub payload: Value,
}

/// Terminal state of a Pod run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PodOutcome {
    pub pod_id: String,
    pub name: String,
    pub state: PodState,
    pub attempts: u32,
    /// Accepted payload; `None` when rejected.
    pub result: Option<Value>,
    /// Absolute path of `result.json`; `None` when rejected.
    pub result_path: Option<PathBuf>,
    pub history: Vec<AttemptRecord>,
}

impl PodOutcome {
    pub fn is_accepted(&self) -> bool {
        self.state == PodState::Accepted
    }

    /// Gaps of the final attempt.
    pub fn last_gaps(&self) -> Vec<String> {
        self.history
            .last()
            .map(|record| record.gaps.clone())
            .unwrap_or_default()
    }

    /// Input binding for the next Pod of a chain, when accepted.
    pub fn as_chain_input(&self) -> Option<ChainInput> {
        match (&self.result, &self.result_path) {
            (Some(payload), Some(path)) if self.is_accepted() => Some(ChainInput {
                source_pod: self.pod_id.clone(),
                path: path.clone(),
                payload: payload.clone(),
            }),
            _ => None,
        }
    }
}

struct WorkerSlot {
    id: String,
    worker: Arc<dyn Worker>,
}

/// What one Worker contributed to an attempt.
enum Contribution {
    Produced { worker: String, result: ResultDoc },
    Failed(WorkerError),
}

impl Contribution {
    fn worker(&self) -> &str {
        match self {
            Contribution::Produced { worker, .. } => worker,
            Contribution::Failed(err) => err.worker(),
        }
    }
}

/// How a Worker task ended, short of a channel failure.
enum WorkerRun {
    Produced,
    Failed(String),
}

pub struct Pod {
    id: String,
    spec: PodSpec,
    channel: FileChannel,
    ctx: RunContext,
    workers: Vec<WorkerSlot>,
    evaluator: Arc<dyn Evaluator>,
    input: Option<ChainInput>,
    state: PodState,
}

impl Pod {
    /// Pod rooted at `channel` (its own directory) and identified by `id`.
    pub fn new(id: impl Into<String>, spec: PodSpec, channel: FileChannel, ctx: RunContext) -> Self {
        Self {
            id: id.into(),
            spec,
            channel,
            ctx,
            workers: Vec::new(),
            evaluator: Arc::new(RequirementEvaluator),
            input: None,
            state: PodState::Created,
        }
    }

    /// Add a Worker; `id` names its output directory and must be unique.
    pub fn with_worker(mut self, id: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        self.workers.push(WorkerSlot {
            id: id.into(),
            worker,
        });
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_input(mut self, input: ChainInput) -> Self {
        self.input = Some(input);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Drive the Pod to a terminal state.
    ///
    /// `Ok` carries both ACCEPTED and REJECTED outcomes; `Err` means the
    /// channel failed and the Pod was aborted (recorded as REJECTED).
    #[instrument(skip_all, fields(pod_id = %self.id, pod = %self.spec.name))]
    pub async fn run(mut self) -> Result<PodOutcome, InfrastructureError> {
        let started = Instant::now();
        if let Err(err) = self.ctx.states.register(&self.id) {
            warn!(err = %err, "pod already registered");
        }
        let max_attempts = self
            .spec
            .max_attempts
            .unwrap_or(self.ctx.config.max_attempts)
            .max(1);

        let mut history = Vec::new();
        let outcome = self.drive(max_attempts, &mut history).await;
        let elapsed = started.elapsed();
        self.ctx.perf.record(&format!("pod/{}", self.id), elapsed);
        self.ctx.emit(Event::Timing {
            name: format!("pod/{}", self.id),
            elapsed,
        });

        match outcome {
            Ok(outcome) => {
                info!(state = %outcome.state, attempts = outcome.attempts, "pod finished");
                Ok(outcome)
            }
            Err(source) => {
                self.abort(&source);
                Err(InfrastructureError {
                    pod_id: self.id,
                    source,
                })
            }
        }
    }

    async fn drive(
        &mut self,
        max_attempts: u32,
        history: &mut Vec<AttemptRecord>,
    ) -> Result<PodOutcome, ChannelError> {
        if !stays_inside(&self.spec.output_path) {
            return Err(ChannelError::OutsidePod {
                path: PathBuf::from(&self.spec.output_path),
            });
        }
        for attempt in 1..=max_attempts {
            let attempt_started = Instant::now();
            let paths = AttemptPaths::new(attempt);

            self.transition(PodState::Instructing, attempt);
            if let Err(err) = self.ctx.states.record_attempt(&self.id, attempt) {
                warn!(err = %err, "failed to record attempt");
            }
            let instruction = self.instruction(attempt, history);
            self.channel
                .write_atomic(&paths.instructions, &instruction, WriteMode::CreateNew)
                .await?;

            self.transition(PodState::Executing, attempt);
            let contributions = self.execute_workers(&paths).await?;

            self.transition(PodState::Evaluating, attempt);
            let (verdict, payload) = self.evaluate(&instruction, &contributions).await;
            let feedback = match &verdict {
                Verdict::Pass => Feedback::Pass {
                    result: payload.clone(),
                    attempts: attempt,
                },
                Verdict::Fail(gaps) => Feedback::Fail {
                    gaps: gaps.clone(),
                    attempt,
                },
            };
            self.channel
                .write_atomic(&paths.feedback, &feedback, WriteMode::CreateNew)
                .await?;
            history.push(AttemptRecord::from_feedback(&feedback));
            if let Err(err) = self.ctx.states.record_feedback(&self.id, feedback) {
                warn!(err = %err, "failed to record feedback");
            }
            self.ctx.perf.record(
                &format!("pod/{}/attempt", self.id),
                attempt_started.elapsed(),
            );
            debug!(attempt, passed = verdict.is_pass(), gaps = verdict.gaps().len(), "attempt evaluated");

            if verdict.is_pass() {
                let result_path = self
                    .channel
                    .write_atomic(
                        FINAL_RESULT_FILE,
                        &ResultDoc {
                            result: payload.clone(),
                        },
                        WriteMode::CreateNew,
                    )
                    .await?;
                self.transition(PodState::Accepted, attempt);
                return Ok(self.outcome(attempt, Some((payload, result_path)), history));
            }
            if attempt < max_attempts {
                self.transition(PodState::Retrying, attempt);
            }
        }

        self.transition(PodState::Rejected, max_attempts);
        Ok(self.outcome(max_attempts, None, history))
    }

    /// Instruction for `attempt`: the task, the chain input if any, and the
    /// gaps of every failed attempt so far.
    fn instruction(&self, attempt: u32, history: &[AttemptRecord]) -> Instruction {
        let mut task = self.spec.task.trim_end().to_string();
        if let Some(input) = &self.input {
            let payload = serde_json::to_string_pretty(&input.payload)
                .unwrap_or_else(|_| input.payload.to_string());
            task.push_str(&format!(
                "\n\n{INPUT_HEADING}\nSource: {} ({})\n{payload}",
                input.source_pod,
                input.path.display()
            ));
        }
        let failed: Vec<&AttemptRecord> = history
            .iter()
            .filter(|record| record.status == AttemptStatus::Fail)
            .collect();
        if !failed.is_empty() {
            task.push_str("\n\n");
            task.push_str(FEEDBACK_HEADING);
            for record in failed {
                task.push_str(&format!("\nAttempt {}:", record.attempt));
                for gap in &record.gaps {
                    task.push_str(&format!("\n- {gap}"));
                }
            }
        }
        Instruction {
            task,
            output_path: self.spec.output_path.clone(),
            attempt,
            schema: self.spec.schema.clone(),
        }
    }

    /// Run every Worker concurrently against one shared deadline.
    async fn execute_workers(
        &self,
        paths: &AttemptPaths,
    ) -> Result<Vec<Contribution>, ChannelError> {
        let budget = self.ctx.config.execution_timeout;
        let deadline = Instant::now() + budget;

        let mut handles: Vec<(String, PathBuf, JoinHandle<Result<WorkerRun, ChannelError>>)> =
            Vec::with_capacity(self.workers.len());
        for slot in &self.workers {
            let result_path = paths.worker_result(&slot.id, &self.spec.output_path);
            let handle = tokio::spawn(run_worker(
                self.channel.clone(),
                Arc::clone(&slot.worker),
                paths.instructions.clone(),
                result_path.clone(),
                budget,
            ));
            handles.push((slot.id.clone(), result_path, handle));
        }

        let mut finished = Vec::with_capacity(handles.len());
        let mut pending = handles.into_iter();
        while let Some((worker, result_path, mut handle)) = pending.next() {
            let run = match timeout_at(deadline, &mut handle).await {
                Err(_) => {
                    handle.abort();
                    warn!(worker = %worker, timeout_ms = budget.as_millis() as u64, "worker timed out");
                    Err(WorkerError::Timeout {
                        worker: worker.clone(),
                        after: budget,
                    })
                }
                Ok(Err(join_err)) => {
                    let cause = if join_err.is_panic() {
                        "worker panicked".to_string()
                    } else {
                        "worker task was cancelled".to_string()
                    };
                    Err(WorkerError::Failed {
                        worker: worker.clone(),
                        cause,
                    })
                }
                Ok(Ok(Err(channel_err))) => {
                    for (_, _, rest) in pending.by_ref() {
                        rest.abort();
                    }
                    return Err(channel_err);
                }
                Ok(Ok(Ok(WorkerRun::Failed(cause)))) => Err(WorkerError::Failed {
                    worker: worker.clone(),
                    cause,
                }),
                Ok(Ok(Ok(WorkerRun::Produced))) => Ok(result_path),
            };
            finished.push((worker, run));
        }

        let mut contributions = Vec::with_capacity(finished.len());
        for (worker, run) in finished {
            let contribution = match run {
                Ok(result_path) => {
                    let result: ResultDoc = self
                        .channel
                        .read_when_present(&result_path, Duration::ZERO)
                        .await?;
                    Contribution::Produced { worker, result }
                }
                Err(err) => Contribution::Failed(err),
            };
            contributions.push(contribution);
        }
        Ok(contributions)
    }

    /// Verdict for the attempt plus the payload that would be accepted.
    async fn evaluate(
        &self,
        instruction: &Instruction,
        contributions: &[Contribution],
    ) -> (Verdict, Value) {
        let payload = combined_payload(contributions);
        if contributions.is_empty() {
            return (
                Verdict::Fail(vec!["No workers assigned to pod".to_string()]),
                payload,
            );
        }
        let several = contributions.len() > 1;
        let label = |worker: &str, gap: &str| {
            if several {
                format!("{worker}: {gap}")
            } else {
                gap.to_string()
            }
        };

        let verdict = match self.spec.aggregation {
            Aggregation::PerWorker => {
                let verdicts = join_all(contributions.iter().map(|c| async move {
                    match c {
                        Contribution::Produced { result, .. } => {
                            self.evaluator.evaluate(instruction, result).await.normalized()
                        }
                        Contribution::Failed(err) => Verdict::Fail(vec![err.to_string()]),
                    }
                }))
                .await;
                let mut gaps = Vec::new();
                for (contribution, verdict) in contributions.iter().zip(&verdicts) {
                    gaps.extend(
                        verdict
                            .gaps()
                            .iter()
                            .map(|gap| label(contribution.worker(), gap)),
                    );
                }
                Verdict::from_gaps(gaps)
            }
            Aggregation::Combined => {
                let failures: Vec<String> = contributions
                    .iter()
                    .filter_map(|c| match c {
                        Contribution::Failed(err) => Some(label(err.worker(), &err.to_string())),
                        Contribution::Produced { .. } => None,
                    })
                    .collect();
                if failures.is_empty() {
                    let doc = ResultDoc {
                        result: payload.clone(),
                    };
                    self.evaluator.evaluate(instruction, &doc).await.normalized()
                } else {
                    Verdict::Fail(failures)
                }
            }
        };
        (verdict, payload)
    }

    fn transition(&mut self, to: PodState, attempt: u32) {
        let from = self.state;
        if let Err(err) = self.ctx.states.transition(&self.id, to) {
            warn!(err = %err, "state registry refused transition");
        }
        self.state = to;
        self.ctx.emit(Event::PodTransition {
            pod_id: self.id.clone(),
            from,
            to,
            attempt,
        });
    }

    fn abort(&mut self, err: &ChannelError) {
        let reason = display_chain(err);
        warn!(reason = %reason, "pod aborted by infrastructure failure");
        if !self.state.is_terminal() {
            let attempt = self.ctx.states.get(&self.id).map_or(0, |r| r.attempt_count);
            self.transition(PodState::Rejected, attempt);
        }
        if let Err(err) = self.ctx.states.record_abort(&self.id, reason) {
            warn!(err = %err, "failed to record abort reason");
        }
    }

    fn outcome(
        &self,
        attempts: u32,
        accepted: Option<(Value, PathBuf)>,
        history: &[AttemptRecord],
    ) -> PodOutcome {
        let (result, result_path) = match accepted {
            Some((payload, path)) => (Some(payload), Some(path)),
            None => (None, None),
        };
        PodOutcome {
            pod_id: self.id.clone(),
            name: self.spec.name.clone(),
            state: self.state,
            attempts,
            result,
            result_path,
            history: history.to_vec(),
        }
    }
}

/// One Worker's side of an attempt: read the instruction, execute, write.
async fn run_worker(
    channel: FileChannel,
    worker: Arc<dyn Worker>,
    instructions_path: PathBuf,
    result_path: PathBuf,
    budget: Duration,
) -> Result<WorkerRun, ChannelError> {
    let instruction: Instruction = channel.read_when_present(&instructions_path, budget).await?;
    match worker.execute(&instruction).await {
        Ok(result) => {
            channel
                .write_atomic(&result_path, &ResultDoc { result }, WriteMode::CreateNew)
                .await?;
            Ok(WorkerRun::Produced)
        }
        Err(err) => Ok(WorkerRun::Failed(format!("{err:#}"))),
    }
}

/// A single Worker's payload, or the ordered array of every payload.
fn combined_payload(contributions: &[Contribution]) -> Value {
    let mut payloads = contributions.iter().map(|c| match c {
        Contribution::Produced { result, .. } => result.result.clone(),
        Contribution::Failed(_) => Value::Null,
    });
    if contributions.len() == 1 {
        payloads.next().unwrap_or(Value::Null)
    } else {
        Value::Array(payloads.collect())
    }
}
