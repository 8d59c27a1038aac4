//! Chains: input binding and rollback of rejected runs.

use std::sync::Arc;

use serde_json::json;

use pods::chain::{ChainOrchestrator, ChainSpec};
use pods::core::types::INPUT_HEADING;
use pods::error::ChainError;
use pods::events::Event;
use pods::pod::PodSpec;
use pods::roles::{RequirementEvaluator, Roles};
use pods::test_support::{ScriptedWorker, TestSession, fast_config};

struct Workers {
    a: Arc<ScriptedWorker>,
    b: Arc<ScriptedWorker>,
    c: Arc<ScriptedWorker>,
}

fn roles(workers: &Workers) -> Roles {
    Roles::new(Arc::new(RequirementEvaluator))
        .with_worker("a", workers.a.clone())
        .with_worker("b", workers.b.clone())
        .with_worker("c", workers.c.clone())
}

fn chain() -> ChainSpec {
    ChainSpec::new(vec![
        PodSpec::new("a", "1. Mention revenue").with_workers(["a"]),
        PodSpec::new("b", "1. Mention profit")
            .with_workers(["b"])
            .with_max_attempts(2),
        PodSpec::new("c", "1. Mention costs").with_workers(["c"]),
    ])
}

/// B is rejected: A's and B's files are gone and C never runs.
#[tokio::test]
async fn rejected_pod_rolls_back_the_whole_chain() {
    let session = TestSession::new(fast_config());
    let workers = Workers {
        a: Arc::new(ScriptedWorker::always(json!("revenue is up"))),
        b: Arc::new(ScriptedWorker::always(json!("revenue is still up"))),
        c: Arc::new(ScriptedWorker::always(json!("costs are down"))),
    };
    let orchestrator =
        ChainOrchestrator::new(session.ctx.clone(), roles(&workers), session.channel.clone());

    let err = orchestrator.run_chain(&chain()).await.expect_err("rejected");

    let ChainError::Failure {
        failed_step,
        gaps,
        history,
    } = err
    else {
        panic!("expected chain failure");
    };
    assert_eq!(failed_step, "b");
    assert_eq!(history.len(), 2);
    assert!(gaps[0].starts_with("Missing requirement: Mention profit"));
    assert_eq!(workers.a.calls(), 1);
    assert_eq!(workers.b.calls(), 2);
    assert_eq!(workers.c.calls(), 0);

    assert!(session.files().is_empty(), "left behind: {:?}", session.files());
    assert_eq!(
        std::fs::read_dir(session.root()).expect("read dir").count(),
        0
    );
    assert!(session.sink.events().iter().any(|event| matches!(
        event,
        Event::Rollback { errors: 0, already_absent: 0, .. }
    )));
}

#[tokio::test]
async fn accepted_output_feeds_the_next_pod() {
    let session = TestSession::new(fast_config());
    let workers = Workers {
        a: Arc::new(ScriptedWorker::always(json!("revenue is up"))),
        b: Arc::new(ScriptedWorker::always(json!("profit is up"))),
        c: Arc::new(ScriptedWorker::always(json!("costs are down"))),
    };
    let orchestrator =
        ChainOrchestrator::new(session.ctx.clone(), roles(&workers), session.channel.clone());

    let outcome = orchestrator.run_chain(&chain()).await.expect("chain");

    assert_eq!(outcome.output, json!("costs are down"));
    assert_eq!(outcome.pods.len(), 3);
    assert!(outcome.result_path.is_file());

    let seen = workers.b.instructions();
    assert!(seen[0].task.contains(INPUT_HEADING));
    assert!(seen[0].task.contains("revenue is up"));
    assert!(seen[0].task.contains(&outcome.pods[0].pod_id));
    // Upstream output is context, not a requirement.
    assert_eq!(seen[0].requirements_text(), "1. Mention profit");
}
