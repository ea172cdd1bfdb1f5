//! Cache resolution: reuse, single computation under contention, failures

use reel_artifact::{ContentHash, Stage};
use reel_store::{
    ArtifactStore, FailureMarker, NewNode, NodeId, NodeStatus, Resolution, ResolveRequest,
    StoreError, DEFAULT_BRANCH,
};
use reel_test_utils::{CountingExecutor, TestStore};
use std::sync::Arc;
use std::time::Duration;

/// Poll until some child of `parent` is generating
async fn generating_child(store: &ArtifactStore, parent: NodeId) -> NodeId {
    for _ in 0..500 {
        if let Some(node) = store
            .children(parent)
            .unwrap()
            .into_iter()
            .find(|n| n.status == NodeStatus::Generating)
        {
            return node.id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no child of {parent} started generating");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_computation() {
    let ts = TestStore::new();
    let root = ts.root();
    let executor = Arc::new(CountingExecutor::new("shared").with_delay(Duration::from_millis(100)));
    let input = ContentHash::of_str("script v1");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = ts.store.clone();
        let executor = Arc::clone(&executor);
        handles.push(tokio::spawn(async move {
            store
                .produce(ResolveRequest::new(root, Stage::Script, input), &*executor)
                .await
        }));
    }

    let mut computed = 0;
    let mut cached = 0;
    let mut hashes = Vec::new();
    for joined in futures::future::join_all(handles).await {
        let resolution = joined.unwrap().unwrap();
        match &resolution {
            Resolution::Computed(_) => computed += 1,
            Resolution::Cached(_) => cached += 1,
            Resolution::Failed(f) => panic!("unexpected failure: {:#}", f.error),
        }
        hashes.push(resolution.artifact().unwrap().content_hash());
    }

    assert_eq!(executor.calls(), 1);
    assert_eq!(computed, 1);
    assert_eq!(cached, 7);
    hashes.dedup();
    assert_eq!(hashes.len(), 1);
    assert_eq!(ts.children(root).unwrap().len(), 1);
}

#[tokio::test]
async fn failed_node_is_marked_and_retry_creates_a_sibling() {
    let ts = TestStore::new();
    let root = ts.root();
    let input = ContentHash::of_str("script v1");

    let failing = CountingExecutor::failing("model offline");
    let resolution = ts
        .produce(ResolveRequest::new(root, Stage::Script, input), &failing)
        .await
        .unwrap();
    let Resolution::Failed(failure) = resolution else {
        panic!("expected a failure, got {resolution:?}");
    };
    assert_eq!(failure.marker, FailureMarker::Error);
    assert_eq!(failure.node.status, NodeStatus::Failed);
    assert_eq!(failure.node.failure(), Some(FailureMarker::Error));
    assert!(failure.node.failure_message().unwrap().contains("model offline"));
    assert!(matches!(
        ts.get_artifact(failure.node.id),
        Err(StoreError::InvalidState(_))
    ));

    let working = CountingExecutor::new("recovered");
    let retry = ts
        .produce(ResolveRequest::new(root, Stage::Script, input), &working)
        .await
        .unwrap();
    assert!(retry.is_computed());
    assert_ne!(retry.node().id, failure.node.id);
    assert_eq!(retry.node().parent_id, Some(root));
    assert_eq!(working.calls(), 1);

    let statuses: Vec<_> = ts.children(root).unwrap().into_iter().map(|n| n.status).collect();
    assert_eq!(statuses, vec![NodeStatus::Failed, NodeStatus::Completed]);
}

#[tokio::test]
async fn undecodable_output_fails_with_invalid_payload() {
    let ts = TestStore::new();
    let executor = CountingExecutor::returning_bytes(b"{\"not\": \"a script\"}");
    let resolution = ts
        .produce(
            ResolveRequest::new(ts.root(), Stage::Script, ContentHash::of_str("x")),
            &executor,
        )
        .await
        .unwrap();

    let Resolution::Failed(failure) = resolution else {
        panic!("expected a failure, got {resolution:?}");
    };
    assert_eq!(failure.marker, FailureMarker::InvalidPayload);
    assert_eq!(failure.node.failure(), Some(FailureMarker::InvalidPayload));
    // nothing reached the blob pool beyond the root's input
    assert_eq!(ts.content().list_blobs().unwrap().len(), 1);
}

#[tokio::test]
async fn dropped_computation_marks_the_node_cancelled() {
    let ts = TestStore::new();
    let root = ts.root();
    let slow = CountingExecutor::new("slow").with_delay(Duration::from_secs(30));

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        ts.produce(
            ResolveRequest::new(root, Stage::Script, ContentHash::of_str("x")),
            &slow,
        ),
    )
    .await;
    assert!(outcome.is_err());
    assert_eq!(slow.calls(), 1);

    let children = ts.children(root).unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].status, NodeStatus::Failed);
    assert_eq!(children[0].failure(), Some(FailureMarker::Cancelled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiter_gives_up_after_its_timeout() {
    let ts = TestStore::new();
    let root = ts.root();
    let input = ContentHash::of_str("x");

    let store = ts.store.clone();
    let winner = tokio::spawn(async move {
        let slow = CountingExecutor::new("slow").with_delay(Duration::from_secs(30));
        store
            .produce(ResolveRequest::new(root, Stage::Script, input), &slow)
            .await
    });
    let running = generating_child(&ts, root).await;

    let idle = CountingExecutor::new("never");
    let err = ts
        .produce(
            ResolveRequest::new(root, Stage::Script, input).wait_timeout(Duration::from_millis(50)),
            &idle,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Unresolved { node_id, .. } if node_id == running));
    assert!(err.is_retryable());
    assert_eq!(idle.calls(), 0);
    assert_eq!(ts.node(running).unwrap().status, NodeStatus::Generating);

    winner.abort();
    let _ = winner.await;
    assert_eq!(ts.node(running).unwrap().failure(), Some(FailureMarker::Cancelled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiter_retries_after_the_winner_fails() {
    let ts = TestStore::new();
    let root = ts.root();
    let input = ContentHash::of_str("x");

    let store = ts.store.clone();
    let winner = tokio::spawn(async move {
        let failing = CountingExecutor::failing("boom").with_delay(Duration::from_millis(200));
        store
            .produce(ResolveRequest::new(root, Stage::Script, input), &failing)
            .await
    });
    let first = generating_child(&ts, root).await;

    let working = CountingExecutor::new("second try");
    let resolution = ts
        .produce(ResolveRequest::new(root, Stage::Script, input), &working)
        .await
        .unwrap();
    assert!(resolution.is_computed());
    assert_ne!(resolution.node().id, first);
    assert_eq!(working.calls(), 1);

    assert!(winner.await.unwrap().unwrap().is_failed());
}

#[tokio::test]
async fn reclaimed_node_is_not_reused() {
    let ts = TestStore::new();
    let root = ts.root();
    let input = ContentHash::of_str("x");
    let executor = CountingExecutor::new("draft");

    let first = ts
        .produce(ResolveRequest::new(root, Stage::Script, input), &executor)
        .await
        .unwrap();
    // main still points at the root, so the draft is unreachable
    let report = ts.collect_garbage().unwrap();
    assert_eq!(report.records_reclaimed, 1);

    let second = ts
        .produce(ResolveRequest::new(root, Stage::Script, input), &executor)
        .await
        .unwrap();
    assert!(second.is_computed());
    assert_ne!(second.node().id, first.node().id);
    assert_eq!(executor.calls(), 2);
}

#[tokio::test]
async fn produce_advances_the_branch_along_its_line() {
    let ts = TestStore::new();
    let root = ts.root();
    let executor = CountingExecutor::new("draft");

    let script = ts
        .produce(
            ResolveRequest::new(root, Stage::Script, ContentHash::of_str("a")).advance_branch(true),
            &executor,
        )
        .await
        .unwrap();
    assert_eq!(ts.head(DEFAULT_BRANCH).unwrap(), script.node().id);

    // a sibling of the head does not descend from it
    let sibling = ts
        .produce(
            ResolveRequest::new(root, Stage::Script, ContentHash::of_str("b")).advance_branch(true),
            &executor,
        )
        .await
        .unwrap();
    assert!(sibling.is_computed());
    assert_eq!(ts.head(DEFAULT_BRANCH).unwrap(), script.node().id);

    // an unknown branch is registered at the result
    let alt = ts
        .produce(
            ResolveRequest::new(root, Stage::Script, ContentHash::of_str("c"))
                .on_branch("draft-c")
                .advance_branch(true),
            &executor,
        )
        .await
        .unwrap();
    assert_eq!(alt.node().branch_name, "draft-c");
    assert_eq!(ts.head("draft-c").unwrap(), alt.node().id);

    let scenes = ts
        .produce(
            ResolveRequest::new(script.node().id, Stage::Description, ContentHash::of_str("d"))
                .advance_branch(true),
            &executor,
        )
        .await
        .unwrap();
    assert_eq!(ts.head(DEFAULT_BRANCH).unwrap(), scenes.node().id);
    assert_eq!(ts.branch_history(DEFAULT_BRANCH).unwrap().len(), 3);
}

#[tokio::test]
async fn parent_must_exist_and_be_completed() {
    let ts = TestStore::new();
    let executor = CountingExecutor::new("x");

    let pending = ts
        .graph()
        .create_node(NewNode::child(ts.root(), Stage::Script, ContentHash::of_str("p")))
        .unwrap();
    let err = ts
        .produce(
            ResolveRequest::new(pending.id, Stage::Description, ContentHash::of_str("q")),
            &executor,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidState(_)));

    let err = ts
        .produce(
            ResolveRequest::new(NodeId::new(), Stage::Script, ContentHash::of_str("q")),
            &executor,
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    // stages never go backwards
    let script = ts.completed_child(ts.root(), Stage::Script, "s");
    let err = ts
        .produce(
            ResolveRequest::new(script.id, Stage::Input, ContentHash::of_str("q")),
            &executor,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidState(_)));
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn context_exposes_the_parent_payload() {
    let ts = TestStore::new();
    let script = ts.completed_child(ts.root(), Stage::Script, "lines");

    let resolution = ts
        .resolver()
        .resolve_or_compute(script.id, Stage::Description, ContentHash::of_str("v"), |ctx| async move {
            let parent = ctx.parent_payload()?;
            assert_eq!(parent.artifact_type(), Stage::Script.output_type());
            let history = ctx.store.history(ctx.node_id)?;
            assert_eq!(history.len(), 3);
            let payload = reel_test_utils::payload_for(ctx.stage, "scenes");
            Ok::<_, anyhow::Error>(reel_store::StageOutput::from_payload(&payload, "scenes")?)
        })
        .await
        .unwrap();

    let artifact = resolution.into_artifact().unwrap();
    assert_eq!(artifact.node.parent_id, Some(script.id));
}
