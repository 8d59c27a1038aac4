//! `pods`: run file-based Pod workflows.
//!
//! Sessions live under `.pods/sessions/`; every run writes its documents,
//! a checkpoint and a final `report.json` there.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

use pods::core::graph::StepGraph;
use pods::exit_codes;
use pods::io::channel::{FileChannel, WriteMode};
use pods::io::checkpoint::CheckpointStore;
use pods::io::config::{OrchestratorConfig, load_config, write_config};
use pods::io::layout::{CHECKPOINT_FILE, PodsPaths, REPORT_FILE, create_session_dir};
use pods::io::workflow_file::load_workflow;
use pods::logging;
use pods::registry::RunContext;
use pods::workflow::{PodStepExecutor, WorkflowOrchestrator, WorkflowResult};

#[derive(Parser)]
#[command(name = "pods", version, about = "File-based Pod orchestration")]
struct Cli {
    /// Project root holding `.pods/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.pods/` with a default config and `.gitignore`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Check a workflow file and print its steps in execution order.
    Validate { workflow: PathBuf },
    /// Run a workflow and print the JSON report.
    Run {
        workflow: PathBuf,
        /// Config file; defaults to `.pods/config.toml`.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Resume an earlier session, skipping its accepted steps.
        #[arg(long, value_name = "SESSION_DIR")]
        resume: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct RunReport<'a> {
    session: &'a Path,
    success: bool,
    #[serde(flatten)]
    result: &'a WorkflowResult,
    /// Operations slower than `slow_pod_threshold`, in milliseconds.
    slow_operations: Vec<(String, u64)>,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = PodsPaths::new(&cli.root);
    match cli.command {
        Command::Init { force } => cmd_init(&paths, force).map(|()| exit_codes::OK),
        Command::Validate { workflow } => cmd_validate(&workflow).map(|()| exit_codes::OK),
        Command::Run {
            workflow,
            config,
            resume,
        } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("start tokio runtime")?;
            runtime.block_on(cmd_run(&paths, &workflow, config, resume))
        }
    }
}

fn cmd_init(paths: &PodsPaths, force: bool) -> Result<()> {
    paths.ensure()?;
    if force || !paths.config_path.exists() {
        write_config(&paths.config_path, &OrchestratorConfig::default())
            .with_context(|| format!("write {}", paths.config_path.display()))?;
    }
    println!("{}", paths.pods_dir.display());
    Ok(())
}

fn cmd_validate(workflow: &Path) -> Result<()> {
    let def = load_workflow(workflow)?;
    let graph = StepGraph::build(def.steps.iter().map(|s| (s.id.as_str(), &s.depends_on)))?;
    for id in graph.topological_order() {
        println!("{id}");
    }
    Ok(())
}

async fn cmd_run(
    paths: &PodsPaths,
    workflow: &Path,
    config: Option<PathBuf>,
    resume: Option<PathBuf>,
) -> Result<i32> {
    let config_path = config.unwrap_or_else(|| paths.config_path.clone());
    let cfg = load_config(&config_path)?;
    let def = load_workflow(workflow)?;

    let session = match resume {
        Some(dir) => {
            if !dir.is_dir() {
                bail!("session {} does not exist", dir.display());
            }
            dir
        }
        None => create_session_dir(paths, &def.name)?,
    };

    let ctx = RunContext::new(cfg.clone());
    let channel = FileChannel::from_config(&session, &cfg);
    let executor = Arc::new(PodStepExecutor::new(
        ctx.clone(),
        def.command_roles(&cfg),
        channel.clone(),
    ));
    let orchestrator = WorkflowOrchestrator::new(&def.name, ctx.clone(), executor)
        .with_checkpoint(CheckpointStore::new(channel.clone(), CHECKPOINT_FILE));

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling steps that have not started");
            cancel.cancel();
        }
    });

    let mut graph = orchestrator.submit(def.steps())?;
    let result = orchestrator.run(&mut graph).await?;

    let report = RunReport {
        session: &session,
        success: result.is_success(),
        result: &result,
        slow_operations: ctx
            .perf
            .slow_operations()
            .into_iter()
            .map(|(name, elapsed)| (name, elapsed.as_millis() as u64))
            .collect(),
    };
    channel
        .write_atomic(REPORT_FILE, &report, WriteMode::Overwrite)
        .await
        .context("write run report")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize run report")?
    );

    Ok(if result.has_infrastructure_failure() {
        exit_codes::INFRASTRUCTURE
    } else if result.is_success() {
        exit_codes::OK
    } else {
        exit_codes::REJECTED
    })
}
