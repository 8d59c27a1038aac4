//! Worker backed by a child process.
//!
//! The instruction document is written to the child's stdin as JSON; the
//! child's stdout is the result (parsed as JSON when it is JSON, otherwise
//! kept as trimmed text). `POD_ATTEMPT` and `POD_OUTPUT_PATH` are exported
//! for scripts that only want the basics.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::types::Instruction;
use crate::io::process::{ProcessRequest, run_process};
use crate::roles::Worker;

#[derive(Debug, Clone)]
pub struct CommandWorker {
    argv: Vec<String>,
    workdir: Option<PathBuf>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandWorker {
    pub fn new(argv: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            argv,
            workdir: None,
            timeout,
            output_limit_bytes,
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

#[async_trait]
impl Worker for CommandWorker {
    #[instrument(skip_all, fields(program = self.argv.first().map(String::as_str), attempt = instruction.attempt))]
    async fn execute(&self, instruction: &Instruction) -> Result<Value> {
        let request = ProcessRequest {
            argv: self.argv.clone(),
            workdir: self.workdir.clone(),
            env: vec![
                ("POD_ATTEMPT".to_string(), instruction.attempt.to_string()),
                ("POD_OUTPUT_PATH".to_string(), instruction.output_path.clone()),
            ],
            stdin: Some(serde_json::to_vec(instruction).context("encode instruction")?),
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        };
        let output = tokio::task::spawn_blocking(move || run_process(&request))
            .await
            .context("join command worker")??;

        if output.timed_out {
            bail!("command timed out after {:?}", self.timeout);
        }
        if !output.status.success() {
            let stderr = output.stderr_text();
            match output.status.code() {
                Some(code) if stderr.is_empty() => bail!("command exited with status {code}"),
                Some(code) => bail!("command exited with status {code}: {stderr}"),
                None => bail!("command terminated by signal"),
            }
        }
        if output.stdout_truncated > 0 {
            bail!(
                "command output exceeded {} bytes ({} bytes dropped)",
                self.output_limit_bytes,
                output.stdout_truncated
            );
        }

        let stdout = output.stdout_text();
        debug!(bytes = stdout.len(), "command produced output");
        Ok(serde_json::from_str(&stdout).unwrap_or(Value::String(stdout)))
    }
}
