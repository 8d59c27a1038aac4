//! Workflow definitions loaded from TOML.
//!
//! ```toml
//! name = "report"
//!
//! [workers.default]
//! command = ["./draft.sh"]
//!
//! [[steps]]
//! id = "gather"
//! [steps.pod]
//! name = "gather"
//! task = "1. List the sources"
//!
//! [[steps]]
//! id = "write"
//! depends_on = ["gather"]
//! [[steps.chain.pods]]
//! name = "draft"
//! task = "Write the report"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::core::graph::StepGraph;
use crate::io::config::OrchestratorConfig;
use crate::roles::{CommandWorker, RequirementEvaluator, Roles};
use crate::workflow::{StepTarget, WorkflowStep};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    /// Worker roles by name.
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerDefinition>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDefinition {
    /// Program and arguments; run without a shell.
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(flatten)]
    pub target: StepTarget,
}

impl WorkflowDefinition {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("workflow name must not be empty");
        }
        if self.steps.is_empty() {
            bail!("workflow '{}' has no steps", self.name);
        }
        for (role, worker) in &self.workers {
            if worker.command.is_empty() {
                bail!("worker '{role}' has an empty command");
            }
        }
        for step in &self.steps {
            let pods = step.target.to_chain().pods;
            if pods.is_empty() {
                bail!("step '{}' has no pods", step.id);
            }
            for pod in &pods {
                pod.validate()
                    .with_context(|| format!("step '{}'", step.id))?;
                if pod.workers.is_empty() {
                    bail!("pod '{}' of step '{}' has no workers", pod.name, step.id);
                }
                if let Some(role) = pod.workers.iter().find(|r| !self.workers.contains_key(*r)) {
                    bail!(
                        "pod '{}' of step '{}' references unknown worker role '{role}'",
                        pod.name,
                        step.id
                    );
                }
            }
        }
        StepGraph::build(self.steps.iter().map(|s| (s.id.as_str(), &s.depends_on)))?;
        Ok(())
    }

    pub fn steps(&self) -> Vec<WorkflowStep> {
        self.steps
            .iter()
            .map(|step| {
                WorkflowStep::new(&step.id, step.target.clone())
                    .depends_on(step.depends_on.iter().cloned())
            })
            .collect()
    }

    /// Roles backed by child processes, judged by [`RequirementEvaluator`].
    pub fn command_roles(&self, cfg: &OrchestratorConfig) -> Roles {
        let mut roles = Roles::new(Arc::new(RequirementEvaluator));
        for (role, def) in &self.workers {
            let mut worker = CommandWorker::new(
                def.command.clone(),
                cfg.execution_timeout,
                cfg.worker_output_limit_bytes,
            );
            if let Some(workdir) = &def.workdir {
                worker = worker.with_workdir(workdir);
            }
            roles = roles.with_worker(role, Arc::new(worker));
        }
        roles
    }
}

/// Load and validate a workflow definition.
pub fn load_workflow(path: &Path) -> Result<WorkflowDefinition> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let def: WorkflowDefinition =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    def.validate()
        .with_context(|| format!("invalid workflow {}", path.display()))?;
    Ok(def)
}
