//! LLM-backed Worker and Evaluator over an injected provider.
//!
//! Provider wire formats are out of scope: a provider takes a rendered
//! prompt and returns JSON (or a JSON string).

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::core::types::{Instruction, ResultDoc, Verdict};
use crate::error::ProviderError;
use crate::io::prompt::PromptEngine;
use crate::roles::{Evaluator, Worker};

/// Model settings forwarded to the provider untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ProviderConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn invoke(&self, prompt: &str, config: &ProviderConfig) -> Result<Value, ProviderError>;
}

pub struct LlmWorker<P> {
    provider: P,
    config: ProviderConfig,
    prompts: Arc<PromptEngine>,
}

impl<P: LlmProvider> LlmWorker<P> {
    pub fn new(provider: P, config: ProviderConfig) -> Self {
        Self {
            provider,
            config,
            prompts: Arc::new(PromptEngine::new()),
        }
    }
}

#[async_trait]
impl<P: LlmProvider> Worker for LlmWorker<P> {
    async fn execute(&self, instruction: &Instruction) -> Result<Value> {
        let prompt = self.prompts.render_worker(instruction)?;
        let value = self.provider.invoke(&prompt, &self.config).await?;
        Ok(value)
    }
}

/// Evaluator that asks a model for a `{status, gaps}` verdict.
///
/// Every malformed or failed response is a `Fail` with a gap saying why.
pub struct LlmEvaluator<P> {
    provider: P,
    config: ProviderConfig,
    prompts: Arc<PromptEngine>,
}

impl<P: LlmProvider> LlmEvaluator<P> {
    pub fn new(provider: P, config: ProviderConfig) -> Self {
        Self {
            provider,
            config,
            prompts: Arc::new(PromptEngine::new()),
        }
    }
}

#[async_trait]
impl<P: LlmProvider> Evaluator for LlmEvaluator<P> {
    async fn evaluate(&self, instruction: &Instruction, result: &ResultDoc) -> Verdict {
        let prompt = match self.prompts.render_evaluator(instruction, result) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(err = %err, "failed to render evaluator prompt");
                return Verdict::Fail(vec![format!("Evaluator prompt could not be rendered: {err}")]);
            }
        };
        match self.provider.invoke(&prompt, &self.config).await {
            Ok(response) => parse_verdict(&response),
            Err(err) => {
                warn!(err = %err, "evaluator provider failed");
                Verdict::Fail(vec![format!("Evaluator unavailable: {err}")])
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    status: String,
    #[serde(default)]
    gaps: Vec<String>,
}

/// Interpret a provider response as a verdict, failing closed.
pub fn parse_verdict(response: &Value) -> Verdict {
    let raw = match response {
        Value::String(text) => serde_json::from_str::<RawVerdict>(strip_fences(text)),
        other => serde_json::from_value::<RawVerdict>(other.clone()),
    };
    let Ok(raw) = raw else {
        return Verdict::Fail(vec![
            "Evaluator returned an unstructured response".to_string(),
        ]);
    };
    let gaps: Vec<String> = raw
        .gaps
        .into_iter()
        .map(|gap| gap.trim().to_string())
        .filter(|gap| !gap.is_empty())
        .collect();
    match raw.status.trim() {
        "PASS" if gaps.is_empty() => Verdict::Pass,
        "PASS" | "FAIL" => Verdict::Fail(gaps).normalized(),
        other => Verdict::Fail(vec![format!(
            "Evaluator returned unrecognized status '{other}'"
        )]),
    }
}

/// Models like to wrap JSON in markdown fences.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
