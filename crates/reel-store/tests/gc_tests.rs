//! Garbage collection: reachability, pins, grace period, shared blobs

use proptest::prelude::*;
use reel_artifact::{ContentHash, Stage};
use reel_store::{
    ArtifactStore, NewNode, NodeId, NodeStatus, ResolveRequest, StoreError, VersionNode,
    DEFAULT_BRANCH,
};
use reel_test_utils::{payload_for, test_config, CountingExecutor, TestStore};
use std::collections::HashSet;
use std::time::Duration;

#[test]
fn dead_sibling_loses_its_exclusive_blob() {
    let ts = TestStore::new();
    let kept = ts.completed_child(ts.root(), Stage::Script, "kept");
    let dropped = ts.completed_child(ts.root(), Stage::Script, "dropped");
    ts.set_head(DEFAULT_BRANCH, kept.id).unwrap();

    let dropped_hash = dropped.artifact_ref.unwrap();
    let report = ts.collect_garbage().unwrap();
    assert_eq!(report.records_reclaimed, 1);
    assert_eq!(report.blobs_removed, 1);
    assert!(report.bytes_freed > 0);
    assert_eq!(report.live_nodes, 2);

    assert!(!ts.content().contains(&dropped_hash));
    assert!(ts.get_artifact(dropped.id).unwrap_err().is_not_found());
    let record = ts.artifact_record(dropped.artifact_id.unwrap()).unwrap();
    assert!(record.is_reclaimed());
    // the node itself stays in history
    assert_eq!(ts.node(dropped.id).unwrap().status, NodeStatus::Completed);

    ts.get_artifact(kept.id).unwrap();
    ts.get_artifact(ts.root()).unwrap();

    // a second run finds nothing more to do
    let again = ts.collect_garbage().unwrap();
    assert_eq!(again.records_reclaimed, 0);
    assert_eq!(again.blobs_removed, 0);
}

#[test]
fn pinned_nodes_survive() {
    let ts = TestStore::new();
    let script = ts.completed_child(ts.root(), Stage::Script, "pinned");
    let scenes = ts.completed_child(script.id, Stage::Description, "pinned");
    assert!(ts.pin(scenes.id).unwrap());
    assert!(!ts.pin(scenes.id).unwrap());
    assert!(ts.pin(NodeId::new()).unwrap_err().is_not_found());

    let report = ts.collect_garbage().unwrap();
    assert_eq!(report.records_reclaimed, 0);
    ts.get_artifact(script.id).unwrap();
    ts.get_artifact(scenes.id).unwrap();

    assert!(ts.unpin(scenes.id).unwrap());
    assert!(ts.pinned().is_empty());
    let report = ts.collect_garbage().unwrap();
    assert_eq!(report.records_reclaimed, 2);
    assert!(ts.get_artifact(scenes.id).unwrap_err().is_not_found());
}

#[test]
fn grace_period_protects_recent_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path()).with_gc_grace(Duration::from_secs(3600));
    let store = ArtifactStore::create_project(config, "graceful", "text").unwrap();
    let node = store
        .graph()
        .create_node(NewNode::child(
            store.project().root_node_id,
            Stage::Script,
            ContentHash::of_str("x"),
        ))
        .unwrap();
    store
        .save_artifact(node.id, &payload_for(Stage::Script, "young"), "")
        .unwrap();

    let report = store.collect_garbage().unwrap();
    assert_eq!(report.records_reclaimed, 0);
    assert_eq!(report.records_skipped, 1);
    assert_eq!(report.blobs_removed, 0);
    store.get_artifact(node.id).unwrap();
}

#[test]
fn blob_shared_with_a_live_node_is_kept() {
    let ts = TestStore::new();
    let live = ts.completed_child(ts.root(), Stage::Script, "same");
    // different input, identical output
    let dead = ts
        .graph()
        .create_node(NewNode::child(ts.root(), Stage::Script, ContentHash::of_str("other")))
        .unwrap();
    ts.save_artifact(dead.id, &payload_for(Stage::Script, "same"), "")
        .unwrap();
    ts.set_head(DEFAULT_BRANCH, live.id).unwrap();

    let hash = live.artifact_ref.unwrap();
    assert_eq!(ts.content().ref_count(&hash), 2);

    let report = ts.collect_garbage().unwrap();
    assert_eq!(report.records_reclaimed, 1);
    assert_eq!(report.blobs_removed, 0);
    assert_eq!(ts.content().ref_count(&hash), 1);
    ts.get_artifact(live.id).unwrap();
    assert!(ts.get_artifact(dead.id).unwrap_err().is_not_found());
}

#[test]
fn deleting_a_branch_releases_its_line() {
    let ts = TestStore::new();
    let script = ts.completed_child(ts.root(), Stage::Script, "base");
    ts.set_head(DEFAULT_BRANCH, script.id).unwrap();
    let scenes = ts.completed_child(script.id, Stage::Description, "mood");
    let alt = ts.create_branch(scenes.id, "moody", "").unwrap();

    let report = ts.collect_garbage().unwrap();
    assert_eq!(report.records_reclaimed, 0);

    ts.delete_branch("moody").unwrap();
    let report = ts.collect_garbage().unwrap();
    assert_eq!(report.records_reclaimed, 2);
    // alt shared the scenes blob, so exactly one blob goes
    assert_eq!(report.blobs_removed, 1);
    assert!(ts.get_artifact(alt.id).unwrap_err().is_not_found());
    assert!(ts.get_artifact(scenes.id).unwrap_err().is_not_found());
    ts.get_artifact(script.id).unwrap();

    // a reclaimed node can no longer carry a branch
    assert!(ts.set_head("revived", alt.id).unwrap_err().is_not_found());
    assert!(matches!(
        ts.create_branch(alt.id, "revived", ""),
        Err(StoreError::NotFound { .. })
    ));
}

#[test]
fn in_flight_nodes_keep_their_ancestors() {
    let ts = TestStore::new();
    let script = ts.completed_child(ts.root(), Stage::Script, "base");
    let running = ts
        .graph()
        .create_node(NewNode::child(script.id, Stage::Description, ContentHash::of_str("r")))
        .unwrap();
    ts.graph()
        .transition(running.id, NodeStatus::Pending, NodeStatus::Generating)
        .unwrap();

    let report = ts.collect_garbage().unwrap();
    assert_eq!(report.records_reclaimed, 0);
    ts.get_artifact(script.id).unwrap();
}

/// Live `kept`, and a dead sibling whose record a crashed collection already
/// marked while its reference and blob stayed behind
fn half_collected(ts: &TestStore) -> (VersionNode, ContentHash) {
    let kept = ts.completed_child(ts.root(), Stage::Script, "kept");
    let dead = ts.completed_child(ts.root(), Stage::Script, "dead");
    ts.set_head(DEFAULT_BRANCH, kept.id).unwrap();

    let dead_hash = dead.artifact_ref.unwrap();
    assert!(ts.records().mark_reclaimed(dead.artifact_id.unwrap()).unwrap());
    assert_eq!(ts.content().ref_count(&dead_hash), 1);
    assert!(ts.content().contains(&dead_hash));
    (kept, dead_hash)
}

fn assert_only_live_blobs_remain(store: &ArtifactStore, kept: &VersionNode, dead_hash: &ContentHash) {
    assert!(!store.content().contains(dead_hash));
    store.get_artifact(kept.id).unwrap();
    store.get_artifact(store.project().root_node_id).unwrap();
    for hash in store.content().list_blobs().unwrap() {
        assert!(store.content().ref_count(&hash) > 0, "unreferenced blob {hash} left behind");
    }
}

#[test]
fn interrupted_collection_is_finished_after_reopen() {
    let ts = TestStore::new();
    let (kept, dead_hash) = half_collected(&ts);

    let reopened = ts.reopen();
    let report = reopened.collect_garbage().unwrap();
    assert_eq!(report.records_reclaimed, 0);
    assert_eq!(report.blobs_removed, 1);
    assert_only_live_blobs_remain(&reopened, &kept, &dead_hash);
}

#[test]
fn interrupted_collection_is_finished_by_the_next_run() {
    let ts = TestStore::new();
    let (kept, dead_hash) = half_collected(&ts);

    let report = ts.collect_garbage().unwrap();
    assert_eq!(report.records_reclaimed, 0);
    assert_eq!(report.blobs_removed, 1);
    assert_only_live_blobs_remain(&ts, &kept, &dead_hash);
}

#[tokio::test]
async fn reclaimed_history_cannot_be_extended_or_revived() {
    let ts = TestStore::new();
    let kept = ts.completed_child(ts.root(), Stage::Script, "kept");
    let dead = ts.completed_child(ts.root(), Stage::Script, "dead");
    ts.set_head(DEFAULT_BRANCH, kept.id).unwrap();
    assert_eq!(ts.collect_garbage().unwrap().records_reclaimed, 1);

    let executor = CountingExecutor::new("scenes");
    let err = ts
        .produce(
            ResolveRequest::new(dead.id, Stage::Description, ContentHash::of_str("d")),
            &executor,
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(executor.calls(), 0);
    assert!(ts.children(dead.id).unwrap().is_empty());

    // saved directly under the dead node, bypassing the resolver
    let late = ts
        .graph()
        .create_node(NewNode::child(dead.id, Stage::Description, ContentHash::of_str("late")))
        .unwrap();
    ts.save_artifact(late.id, &payload_for(Stage::Description, "late"), "")
        .unwrap();
    assert!(matches!(
        ts.set_head("revive", late.id),
        Err(StoreError::InvalidState(_))
    ));
    assert!(ts.head("revive").unwrap_err().is_not_found());
}

#[derive(Debug, Clone)]
enum Op {
    /// Extend the node at `pick % len` with a payload from `seed`
    Extend { pick: usize, seed: u8 },
    /// Branch off the node at `pick % len`
    Branch { pick: usize },
    /// Delete the branch at `pick % branches`
    DeleteBranch { pick: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (any::<usize>(), 0u8..4).prop_map(|(pick, seed)| Op::Extend { pick, seed }),
        2 => any::<usize>().prop_map(|pick| Op::Branch { pick }),
        1 => any::<usize>().prop_map(|pick| Op::DeleteBranch { pick }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn collection_never_breaks_a_live_history(ops in proptest::collection::vec(op(), 1..24)) {
        let ts = TestStore::new();
        let mut completed = vec![ts.node(ts.root()).unwrap()];
        let mut branch_count = 0usize;

        for op in ops {
            match op {
                Op::Extend { pick, seed } => {
                    let parent = &completed[pick % completed.len()];
                    let stage = Stage::from_ordinal((parent.stage.ordinal() + 1).min(9)).unwrap();
                    // few seeds, so payloads repeat across nodes
                    let node = ts.completed_child(parent.id, stage, &format!("seed-{seed}"));
                    completed.push(node);
                }
                Op::Branch { pick } => {
                    let from = completed[pick % completed.len()].id;
                    let name = format!("b{branch_count}");
                    branch_count += 1;
                    completed.push(ts.create_branch(from, &name, "").unwrap());
                }
                Op::DeleteBranch { pick } => {
                    let names: Vec<_> = ts
                        .branches()
                        .into_iter()
                        .map(|b| b.name)
                        .filter(|n| n != DEFAULT_BRANCH)
                        .collect();
                    if !names.is_empty() {
                        ts.delete_branch(&names[pick % names.len()]).unwrap();
                    }
                }
            }
        }

        ts.collect_garbage().unwrap();

        let mut live = HashSet::new();
        for branch in ts.branches() {
            for node in ts.history(branch.head).unwrap() {
                ts.get_artifact(node.id).unwrap();
                live.insert(node.id);
            }
        }

        for record in ts.records().all() {
            prop_assert_eq!(record.is_reclaimed(), !live.contains(&record.node_id));
        }
        for hash in ts.content().list_blobs().unwrap() {
            prop_assert!(ts.content().ref_count(&hash) > 0);
        }
    }
}
