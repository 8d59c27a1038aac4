//! Prompt rendering for LLM-backed roles.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::types::{Instruction, ResultDoc};

const WORKER_TEMPLATE: &str = include_str!("prompts/worker.md");
const EVALUATOR_TEMPLATE: &str = include_str!("prompts/evaluator.md");

/// Template engine wrapper around minijinja.
#[derive(Debug)]
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("worker", WORKER_TEMPLATE)
            .expect("worker template should be valid");
        env.add_template("evaluator", EVALUATOR_TEMPLATE)
            .expect("evaluator template should be valid");
        Self { env }
    }

    /// Prompt asking a Worker to carry out `instruction`.
    pub fn render_worker(&self, instruction: &Instruction) -> Result<String> {
        let template = self.env.get_template("worker")?;
        let rendered = template.render(context! {
            task => instruction.task.trim(),
            attempt => instruction.attempt,
            schema => pretty_schema(instruction)?,
        })?;
        Ok(rendered)
    }

    /// Prompt asking the Supervisor to judge `result` against `instruction`.
    ///
    /// Only the requirement part of the task is shown: retry feedback would
    /// tempt the judge to grade against past gaps instead of the task.
    pub fn render_evaluator(&self, instruction: &Instruction, result: &ResultDoc) -> Result<String> {
        let template = self.env.get_template("evaluator")?;
        let rendered = template.render(context! {
            task => instruction.requirements_text(),
            schema => pretty_schema(instruction)?,
            result => serde_json::to_string_pretty(&result.result)?,
        })?;
        Ok(rendered)
    }
}

fn pretty_schema(instruction: &Instruction) -> Result<Option<String>> {
    Ok(instruction
        .schema
        .as_ref()
        .map(serde_json::to_string_pretty)
        .transpose()?)
}
