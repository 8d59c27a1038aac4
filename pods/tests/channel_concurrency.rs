//! Concurrent writers against one file channel.

use futures::future::join_all;
use serde_json::{Value, json};

use pods::error::ChannelError;
use pods::io::channel::{FileChannel, WriteMode};
use pods::test_support::fast_config;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_paths_all_commit_complete_documents() {
    let temp = tempfile::tempdir().expect("tempdir");
    let channel = FileChannel::from_config(temp.path(), &fast_config());

    let writes = (0..10).map(|n| {
        let channel = channel.clone();
        tokio::spawn(async move {
            channel
                .write_atomic(
                    format!("docs/{n}.json"),
                    &json!({"n": n, "body": "x".repeat(4096)}),
                    WriteMode::CreateNew,
                )
                .await
        })
    });
    for joined in join_all(writes).await {
        joined.expect("join").expect("write");
    }

    for n in 0..10 {
        let doc: Value = channel
            .read_when_present(format!("docs/{n}.json"), std::time::Duration::ZERO)
            .await
            .expect("read");
        assert_eq!(doc["n"], json!(n));
    }
    let names: Vec<String> = std::fs::read_dir(temp.path().join("docs"))
        .expect("read dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.len(), 10, "no temp or lock files left: {names:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_create_only_writers_yield_one_conflict() {
    let temp = tempfile::tempdir().expect("tempdir");
    let channel = FileChannel::from_config(temp.path(), &fast_config());

    let writers = ["first", "second"].map(|who| {
        let channel = channel.clone();
        tokio::spawn(async move {
            channel
                .write_atomic("shared.json", &json!({"who": who}), WriteMode::CreateNew)
                .await
        })
    });
    let results: Vec<_> = join_all(writers)
        .await
        .into_iter()
        .map(|joined| joined.expect("join"))
        .collect();

    let successes = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(ChannelError::Conflict { .. })))
        .count();
    assert_eq!((successes, conflicts), (1, 1));

    let doc: Value = channel
        .read_when_present("shared.json", std::time::Duration::ZERO)
        .await
        .expect("read");
    assert!(doc["who"] == json!("first") || doc["who"] == json!("second"));
}
