//! Test-only doubles for workers, evaluators, step executors and sinks.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use crate::chain::ChainOutcome;
use crate::core::types::{AttemptRecord, AttemptStatus, Instruction, ResultDoc, Verdict};
use crate::error::{ChainError, ChannelError, InfrastructureError};
use crate::events::{Event, EventSink};
use crate::io::channel::FileChannel;
use crate::io::config::OrchestratorConfig;
use crate::registry::RunContext;
use crate::roles::{Evaluator, Worker};
use crate::workflow::{StepExecutor, StepRequest};

/// Config with millisecond-scale timeouts and backoff.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        max_attempts: 3,
        execution_timeout: Duration::from_secs(2),
        failure_threshold: 3,
        cooldown: Duration::from_secs(60),
        max_retries: 1,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        concurrency_limit: 4,
        poll_interval: Duration::from_millis(5),
        lock_timeout: Duration::from_secs(2),
        ..OrchestratorConfig::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pop the next scripted item, repeating the last one forever.
fn next_scripted<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

/// One scripted worker response.
#[derive(Debug, Clone)]
pub enum WorkerStep {
    Respond(Value),
    Fail(String),
    /// Sleep before responding with `null`; used to trip execution timeouts.
    Hang(Duration),
    Panic,
}

/// Worker that replays a script and records every instruction it receives.
#[derive(Debug, Default)]
pub struct ScriptedWorker {
    script: Mutex<VecDeque<WorkerStep>>,
    seen: Mutex<Vec<Instruction>>,
}

impl ScriptedWorker {
    pub fn new(steps: impl IntoIterator<Item = WorkerStep>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn always(result: Value) -> Self {
        Self::new([WorkerStep::Respond(result)])
    }

    pub fn instructions(&self) -> Vec<Instruction> {
        lock(&self.seen).clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.seen).len()
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn execute(&self, instruction: &Instruction) -> anyhow::Result<Value> {
        lock(&self.seen).push(instruction.clone());
        let step = next_scripted(&mut lock(&self.script));
        match step {
            None => Ok(Value::Null),
            Some(WorkerStep::Respond(value)) => Ok(value),
            Some(WorkerStep::Fail(message)) => Err(anyhow::anyhow!(message)),
            Some(WorkerStep::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(Value::Null)
            }
            Some(WorkerStep::Panic) => panic!("scripted worker panic"),
        }
    }
}

/// Evaluator returning scripted verdicts in order, repeating the last.
#[derive(Debug, Default)]
pub struct ScriptedEvaluator {
    verdicts: Mutex<VecDeque<Verdict>>,
    calls: Mutex<usize>,
}

impl ScriptedEvaluator {
    pub fn new(verdicts: impl IntoIterator<Item = Verdict>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into_iter().collect()),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(&self, _instruction: &Instruction, _result: &ResultDoc) -> Verdict {
        *lock(&self.calls) += 1;
        next_scripted(&mut lock(&self.verdicts)).unwrap_or(Verdict::Pass)
    }
}

/// Scripted outcome of one step try.
#[derive(Debug, Clone)]
pub enum StepScript {
    Accept(Value),
    Reject(Vec<String>),
    Infrastructure,
}

impl StepScript {
    pub fn reject<I, S>(gaps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StepScript::Reject(gaps.into_iter().map(Into::into).collect())
    }
}

/// Step executor replaying per-step scripts; unscripted steps accept with
/// their own id as output.
#[derive(Debug, Default)]
pub struct ScriptedStepExecutor {
    scripts: Mutex<BTreeMap<String, VecDeque<StepScript>>>,
    started: Mutex<Vec<String>>,
    delay: Option<Duration>,
    /// Tries running now and the most ever running at once.
    in_flight: Mutex<(usize, usize)>,
}

impl ScriptedStepExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(
        self,
        step_id: &str,
        script: impl IntoIterator<Item = StepScript>,
    ) -> Self {
        lock(&self.scripts).insert(step_id.to_string(), script.into_iter().collect());
        self
    }

    /// Every try sleeps for `delay` before settling.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn peak_in_flight(&self) -> usize {
        lock(&self.in_flight).1
    }

    /// Step ids in the order their tries started.
    pub fn started(&self) -> Vec<String> {
        lock(&self.started).clone()
    }

    pub fn invocations(&self, step_id: &str) -> usize {
        lock(&self.started)
            .iter()
            .filter(|id| id.as_str() == step_id)
            .count()
    }
}

#[async_trait]
impl StepExecutor for ScriptedStepExecutor {
    async fn execute(&self, request: &StepRequest) -> Result<ChainOutcome, ChainError> {
        lock(&self.started).push(request.step_id.clone());
        if let Some(delay) = self.delay {
            {
                let mut in_flight = lock(&self.in_flight);
                in_flight.0 += 1;
                in_flight.1 = in_flight.1.max(in_flight.0);
            }
            tokio::time::sleep(delay).await;
            lock(&self.in_flight).0 -= 1;
        }
        let script = lock(&self.scripts)
            .get_mut(&request.step_id)
            .and_then(next_scripted);
        match script.unwrap_or_else(|| StepScript::Accept(Value::String(request.step_id.clone()))) {
            StepScript::Accept(output) => Ok(ChainOutcome {
                output,
                result_path: PathBuf::from(format!("{}/result.json", request.step_id)),
                pods: Vec::new(),
            }),
            StepScript::Reject(gaps) => Err(ChainError::Failure {
                failed_step: request.step_id.clone(),
                history: vec![AttemptRecord {
                    attempt: 1,
                    status: AttemptStatus::Fail,
                    gaps: gaps.clone(),
                }],
                gaps,
            }),
            StepScript::Infrastructure => Err(ChainError::Infrastructure {
                failed_step: request.step_id.clone(),
                source: InfrastructureError {
                    pod_id: format!("pod-{}", request.step_id),
                    source: ChannelError::io(
                        format!("{}/instructions.json", request.step_id),
                        std::io::Error::other("scripted disk failure"),
                    ),
                },
            }),
        }
    }
}

/// Sink that keeps every event.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: Event) {
        lock(&self.events).push(event);
    }
}

/// Temporary session directory with a channel and run context over it.
pub struct TestSession {
    pub temp: TempDir,
    pub channel: FileChannel,
    pub ctx: RunContext,
    pub sink: Arc<RecordingSink>,
}

impl TestSession {
    pub fn new(config: OrchestratorConfig) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let channel = FileChannel::from_config(temp.path(), &config);
        let sink = Arc::new(RecordingSink::default());
        let ctx = RunContext::new(config).with_sink(sink.clone());
        Self {
            temp,
            channel,
            ctx,
            sink,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Every regular file under the session, relative to its root, sorted.
    pub fn files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        collect_files(self.root(), self.root(), &mut files);
        files.sort();
        files
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_path_buf());
        }
    }
}
