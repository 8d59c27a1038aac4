//! Shared deterministic types for the Pod protocol.
//!
//! These are the documents exchanged through the file channel and the states
//! the orchestration layers report. The JSON shapes are stable contracts:
//! workers written in any language read and write them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Heading that separates cumulative retry feedback from the original task.
pub const FEEDBACK_HEADING: &str = "## Feedback from previous attempts";

/// Heading that introduces the upstream output bound into a chained Pod.
pub const INPUT_HEADING: &str = "## Input from previous step";

/// Supervisor-issued instruction for one attempt (`instructions.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Task text, including any appended feedback/input sections.
    #[serde(rename = "instructions")]
    pub task: String,
    /// File name the worker's result is stored under.
    pub output_path: String,
    /// Attempt number (1-indexed, strictly increasing per Pod).
    pub attempt: u32,
    /// JSON Schema the result must satisfy, when the Pod declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

impl Instruction {
    /// Task text without the sections appended by the Pod or the chain.
    ///
    /// Requirements are only ever derived from this part, so gaps quoted back
    /// to the worker never turn into new requirements.
    pub fn requirements_text(&self) -> &str {
        let end = [FEEDBACK_HEADING, INPUT_HEADING]
            .iter()
            .filter_map(|heading| self.task.find(heading))
            .min()
            .unwrap_or(self.task.len());
        self.task[..end].trim_end()
    }
}

/// Worker output for one attempt (`result.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDoc {
    pub result: Value,
}

/// Binary verdict returned by an evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(Vec<String>),
}

impl Verdict {
    /// `Pass` when there are no gaps, `Fail` otherwise.
    pub fn from_gaps(gaps: Vec<String>) -> Self {
        if gaps.is_empty() {
            Verdict::Pass
        } else {
            Verdict::Fail(gaps)
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    pub fn gaps(&self) -> &[String] {
        match self {
            Verdict::Pass => &[],
            Verdict::Fail(gaps) => gaps,
        }
    }

    /// A `Fail` must always explain itself; an empty gap list is replaced
    /// with a generic gap instead of being mistaken for a pass.
    pub fn normalized(self) -> Self {
        match self {
            Verdict::Fail(gaps) if gaps.is_empty() => {
                Verdict::Fail(vec!["Evaluation failed without gap details".to_string()])
            }
            other => other,
        }
    }
}

/// Supervisor feedback for one attempt (`feedback.json`).
///
/// The two variants intentionally differ in shape: a `FAIL` names the
/// attempt it judged, a `PASS` reports how many attempts it took.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Feedback {
    #[serde(rename = "PASS")]
    Pass { result: Value, attempts: u32 },
    #[serde(rename = "FAIL")]
    Fail { gaps: Vec<String>, attempt: u32 },
}

impl Feedback {
    pub fn is_pass(&self) -> bool {
        matches!(self, Feedback::Pass { .. })
    }

    pub fn attempt(&self) -> u32 {
        match self {
            Feedback::Pass { attempts, .. } => *attempts,
            Feedback::Fail { attempt, .. } => *attempt,
        }
    }

    pub fn gaps(&self) -> &[String] {
        match self {
            Feedback::Pass { .. } => &[],
            Feedback::Fail { gaps, .. } => gaps,
        }
    }
}

/// Pod lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PodState {
    Created,
    Instructing,
    Executing,
    Evaluating,
    Retrying,
    Accepted,
    Rejected,
}

impl PodState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PodState::Accepted | PodState::Rejected)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Any non-terminal state may move straight to `Rejected`: that is how an
    /// infrastructure failure aborts the loop.
    pub fn can_transition_to(self, next: PodState) -> bool {
        let forward = matches!(
            (self, next),
            (PodState::Created, PodState::Instructing)
                | (PodState::Instructing, PodState::Executing)
                | (PodState::Executing, PodState::Evaluating)
                | (
                    PodState::Evaluating,
                    PodState::Accepted | PodState::Retrying | PodState::Rejected
                )
                | (PodState::Retrying, PodState::Instructing)
        );
        forward || (!self.is_terminal() && next == PodState::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PodState::Created => "CREATED",
            PodState::Instructing => "INSTRUCTING",
            PodState::Executing => "EXECUTING",
            PodState::Evaluating => "EVALUATING",
            PodState::Retrying => "RETRYING",
            PodState::Accepted => "ACCEPTED",
            PodState::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for PodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a Pod with several workers turns their results into one verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Evaluate each worker's result; the attempt passes only if all pass.
    #[default]
    PerWorker,
    /// Evaluate the ordered array of all results once.
    Combined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Pass,
    Fail,
}

/// Verdict of one Pod attempt, kept for diagnosis across retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub status: AttemptStatus,
    pub gaps: Vec<String>,
}

impl AttemptRecord {
    pub fn from_feedback(feedback: &Feedback) -> Self {
        Self {
            attempt: feedback.attempt(),
            status: if feedback.is_pass() {
                AttemptStatus::Pass
            } else {
                AttemptStatus::Fail
            },
            gaps: feedback.gaps().to_vec(),
        }
    }
}

/// Workflow step status as reported to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Accepted,
    Rejected,
    Cancelled,
    InfrastructureFailed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }

    /// Terminal states that halt every dependent.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            StepStatus::Rejected | StepStatus::Cancelled | StepStatus::InfrastructureFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Accepted => "ACCEPTED",
            StepStatus::Rejected => "REJECTED",
            StepStatus::Cancelled => "CANCELLED",
            StepStatus::InfrastructureFailed => "INFRASTRUCTURE_FAILED",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
