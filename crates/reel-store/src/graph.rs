//! Version graph
//!
//! An arena of [`VersionNode`]s keyed by id with a parent -> children index.
//! Nodes carry parent pointers only; children are looked up in the index.
//!
//! Status changes go through compare-and-swap transitions:
//! - `pending -> generating`
//! - `generating -> completed | failed`
//! - `pending -> failed`
//!
//! Every mutation is written to `nodes/<id>.json` before it becomes visible
//! in memory. File writes happen outside the arena lock: changes to one
//! node are serialized by a per-node lock and lookup-or-create by a
//! per-cache-key lock, so writers only contend on the same node or key.
//! Watchers are notified while the new state is published.

use crate::error::{EntityKind, StoreError, StoreResult};
use crate::fs;
use crate::locks::KeyedLocks;
use crate::types::{
    ArtifactId, CacheKey, FailureMarker, NodeId, NodeStatus, ProjectId, VersionNode, ERROR_KEY,
    FAILURE_KEY,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use reel_artifact::{ContentHash, Stage};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::debug;

/// Branch a node lands on when neither it nor its parent names one
pub const DEFAULT_BRANCH: &str = "main";

/// Template for a node about to be created
#[derive(Debug, Clone)]
pub struct NewNode {
    parent: Option<NodeId>,
    stage: Stage,
    stage_index: u32,
    input_hash: ContentHash,
    branch_name: Option<String>,
    commit_message: String,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl NewNode {
    /// Project root: `Input` stage, no parent
    #[must_use]
    pub fn root(input_hash: ContentHash) -> Self {
        Self {
            parent: None,
            stage: Stage::Input,
            stage_index: Stage::Input.ordinal(),
            input_hash,
            branch_name: None,
            commit_message: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Child of `parent` at `stage`
    #[must_use]
    pub fn child(parent: NodeId, stage: Stage, input_hash: ContentHash) -> Self {
        Self {
            parent: Some(parent),
            stage,
            stage_index: stage.ordinal(),
            ..Self::root(input_hash)
        }
    }

    /// Record the node on `branch` instead of inheriting the parent's
    #[must_use]
    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch_name = Some(branch.into());
        self
    }

    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = message.into();
        self
    }

    /// Explicit stage index; must equal the stage's ordinal
    #[must_use]
    pub fn with_stage_index(mut self, stage_index: u32) -> Self {
        self.stage_index = stage_index;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    #[inline]
    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[inline]
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }
}

#[derive(Debug, Default)]
struct Arena {
    nodes: HashMap<NodeId, VersionNode>,
    /// Children of each node, in creation order
    children: HashMap<NodeId, Vec<NodeId>>,
    /// All nodes in creation order
    order: Vec<NodeId>,
    root: Option<NodeId>,
}

impl Arena {
    fn node(&self, id: NodeId) -> StoreResult<&VersionNode> {
        self.nodes
            .get(&id)
            .ok_or_else(|| StoreError::not_found(EntityKind::Node, id))
    }

    fn insert(&mut self, node: VersionNode) {
        if let Some(parent) = node.parent_id {
            self.children.entry(parent).or_default().push(node.id);
        } else {
            self.root = Some(node.id);
        }
        self.order.push(node.id);
        self.nodes.insert(node.id, node);
    }

    /// Newest non-failed child matching a cache key
    fn find_child(&self, key: &CacheKey, reusable: impl Fn(&VersionNode) -> bool) -> Option<&VersionNode> {
        self.children
            .get(&key.parent)?
            .iter()
            .rev()
            .filter_map(|id| self.nodes.get(id))
            .find(|n| {
                n.stage == key.stage
                    && n.input_hash == key.input_hash
                    && n.status != NodeStatus::Failed
                    && reusable(n)
            })
    }
}

/// History tree of one project
#[derive(Debug)]
pub struct VersionGraph {
    project_id: ProjectId,
    nodes_dir: PathBuf,
    fsync: bool,
    arena: RwLock<Arena>,
    watchers: DashMap<NodeId, watch::Sender<NodeStatus>>,
    key_locks: KeyedLocks<CacheKey>,
    node_locks: KeyedLocks<NodeId>,
    root_lock: Mutex<()>,
}

impl VersionGraph {
    /// Empty graph persisting into `nodes_dir`
    #[must_use]
    pub fn new(project_id: ProjectId, nodes_dir: impl Into<PathBuf>, fsync: bool) -> Self {
        Self {
            project_id,
            nodes_dir: nodes_dir.into(),
            fsync,
            arena: RwLock::new(Arena::default()),
            watchers: DashMap::new(),
            key_locks: KeyedLocks::new(),
            node_locks: KeyedLocks::new(),
            root_lock: Mutex::new(()),
        }
    }

    /// Load every node file under `nodes_dir`
    ///
    /// # Errors
    /// Returns `CorruptMetadata` for unreadable nodes, dangling parents,
    /// foreign project ids or more than one root
    pub fn load(project_id: ProjectId, nodes_dir: impl Into<PathBuf>, fsync: bool) -> StoreResult<Self> {
        let graph = Self::new(project_id, nodes_dir, fsync);
        let mut nodes = Vec::new();
        for path in fs::json_files(&graph.nodes_dir)? {
            let node: VersionNode = fs::read_json(&path, EntityKind::Node)?;
            if node.project_id != project_id {
                return Err(corrupt(&path, format!("node belongs to project {}", node.project_id)));
            }
            nodes.push((path, node));
        }
        nodes.sort_by(|(_, a), (_, b)| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let known: HashSet<NodeId> = nodes.iter().map(|(_, n)| n.id).collect();
        {
            let mut arena = graph.arena.write();
            for (path, node) in nodes {
                match node.parent_id {
                    Some(parent) if !known.contains(&parent) => {
                        return Err(corrupt(&path, format!("parent {parent} does not exist")));
                    }
                    None if arena.root.is_some() => {
                        return Err(corrupt(&path, "second root node".into()));
                    }
                    _ => arena.insert(node),
                }
            }
            debug!("Loaded {} nodes for project {}", arena.order.len(), project_id);
        }
        Ok(graph)
    }

    #[inline]
    #[must_use]
    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    /// Create a node in `pending`
    ///
    /// # Errors
    /// - `NotFound` if the parent does not exist
    /// - `InvalidState` if the stage index is wrong, the stage goes backwards
    ///   from the parent's, or a second root is requested
    /// - `StorageIO` if the node file cannot be written
    pub fn create_node(&self, new: NewNode) -> StoreResult<VersionNode> {
        // roots are created one at a time so only one can win
        let _root = new.parent.is_none().then(|| self.root_lock.lock());
        self.insert(new)
    }

    /// Return the newest reusable child for `key`, or create one from `template`
    ///
    /// Callers with the same key are serialized, so they always end up with
    /// the same node. Failed children and children rejected by `reusable`
    /// are skipped. The flag is `true` when the node was created by this call.
    ///
    /// # Errors
    /// Same as [`create_node`](Self::create_node)
    pub fn find_or_create(
        &self,
        key: CacheKey,
        reusable: impl Fn(&VersionNode) -> bool,
        template: NewNode,
    ) -> StoreResult<(VersionNode, bool)> {
        if template.parent != Some(key.parent)
            || template.stage != key.stage
            || template.input_hash != key.input_hash
        {
            return Err(StoreError::invalid("node template does not match its cache key"));
        }
        self.key_locks.with(key, || {
            let found = {
                let arena = self.arena.read();
                arena.node(key.parent)?;
                arena.find_child(&key, reusable).cloned()
            };
            match found {
                Some(node) => Ok((node, false)),
                None => self.insert(template).map(|node| (node, true)),
            }
        })
    }

    fn insert(&self, new: NewNode) -> StoreResult<VersionNode> {
        if new.stage_index != new.stage.ordinal() {
            return Err(StoreError::invalid(format!(
                "stage index {} does not match stage {} ({})",
                new.stage_index,
                new.stage,
                new.stage.ordinal()
            )));
        }

        let branch_name = {
            let arena = self.arena.read();
            match new.parent {
                Some(parent_id) => {
                    let parent = arena.node(parent_id)?;
                    if !new.stage.may_follow(parent.stage) {
                        return Err(StoreError::invalid(format!(
                            "stage {} cannot follow {} (node {})",
                            new.stage, parent.stage, parent_id
                        )));
                    }
                    new.branch_name.unwrap_or_else(|| parent.branch_name.clone())
                }
                None => {
                    if let Some(root) = arena.root {
                        return Err(StoreError::invalid(format!("project already has root {root}")));
                    }
                    new.branch_name.unwrap_or_else(|| DEFAULT_BRANCH.to_string())
                }
            }
        };

        let now = Utc::now();
        let node = VersionNode {
            id: NodeId::new(),
            project_id: self.project_id,
            parent_id: new.parent,
            branch_name,
            commit_message: new.commit_message,
            stage: new.stage,
            stage_index: new.stage_index,
            artifact_ref: None,
            artifact_id: None,
            status: NodeStatus::Pending,
            input_hash: new.input_hash,
            created_at: now,
            updated_at: now,
            metadata: new.metadata,
        };
        // nodes are never removed, so the parent checked above still exists
        self.persist(&node)?;
        debug!(
            "Created node {} ({} on {}, parent {:?})",
            node.id, node.stage, node.branch_name, node.parent_id
        );
        self.arena.write().insert(node.clone());
        Ok(node)
    }

    fn persist(&self, node: &VersionNode) -> StoreResult<()> {
        fs::write_json(&self.node_path(node.id), node, self.fsync)
    }

    fn node_path(&self, id: NodeId) -> PathBuf {
        self.nodes_dir.join(format!("{id}.json"))
    }

    /// Compare-and-swap the status of a node
    ///
    /// Completion is not reachable from here: a node only becomes
    /// `completed` when the store attaches its artifact.
    ///
    /// ```compile_fail
    /// # use reel_store::{ArtifactId, NodeId, VersionGraph};
    /// # fn forge(graph: &VersionGraph, id: NodeId) {
    /// graph.complete(id, ArtifactId::new(), reel_artifact::ContentHash::of_str("forged"));
    /// # }
    /// ```
    ///
    /// # Errors
    /// - `InvalidState` if `from -> to` is not an allowed transition, or
    ///   `to` is `completed`
    /// - `ConcurrentModification` if the node is not in `from`
    /// - `NotFound` if the node does not exist
    pub fn transition(&self, id: NodeId, from: NodeStatus, to: NodeStatus) -> StoreResult<VersionNode> {
        if to == NodeStatus::Completed {
            return Err(StoreError::invalid(format!(
                "node {id} can only complete by saving its artifact"
            )));
        }
        self.update(id, from, to, |_| {})
    }

    /// `generating -> completed`, fixing the node's artifact
    ///
    /// # Errors
    /// Same as [`transition`](Self::transition)
    pub(crate) fn complete(&self, id: NodeId, artifact_id: ArtifactId, artifact_ref: ContentHash) -> StoreResult<VersionNode> {
        self.update(id, NodeStatus::Generating, NodeStatus::Completed, |node| {
            node.artifact_id = Some(artifact_id);
            node.artifact_ref = Some(artifact_ref);
        })
    }

    /// `from -> failed`, recording why
    ///
    /// # Errors
    /// Same as [`transition`](Self::transition)
    pub(crate) fn fail(&self, id: NodeId, from: NodeStatus, marker: FailureMarker, message: &str) -> StoreResult<VersionNode> {
        self.update(id, from, NodeStatus::Failed, |node| {
            node.metadata
                .insert(FAILURE_KEY.to_string(), serde_json::Value::from(marker.as_str()));
            node.metadata
                .insert(ERROR_KEY.to_string(), serde_json::Value::from(message));
        })
    }

    fn update(
        &self,
        id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
        apply: impl FnOnce(&mut VersionNode),
    ) -> StoreResult<VersionNode> {
        if !from.can_transition_to(to) {
            return Err(StoreError::invalid(format!("illegal transition {from} -> {to}")));
        }
        self.node_locks.with(id, || {
            let mut next = {
                let arena = self.arena.read();
                let current = arena.node(id)?;
                if current.status != from {
                    return Err(StoreError::ConcurrentModification {
                        node_id: id,
                        expected: from,
                        actual: current.status,
                    });
                }
                current.clone()
            };

            apply(&mut next);
            next.status = to;
            next.updated_at = Utc::now();
            self.persist(&next)?;

            let mut arena = self.arena.write();
            arena.nodes.insert(id, next.clone());
            if to.is_terminal() {
                if let Some((_, tx)) = self.watchers.remove(&id) {
                    tx.send_replace(to);
                }
            } else if let Some(tx) = self.watchers.get(&id) {
                tx.send_replace(to);
            }
            drop(arena);
            debug!("Node {} {} -> {}", id, from, to);
            Ok(next)
        })
    }

    /// Watch the status of a node
    ///
    /// The receiver starts at the current status. Once the node is terminal
    /// its channel is closed after the final value is published.
    ///
    /// # Errors
    /// Returns `NotFound` if the node does not exist
    pub fn subscribe(&self, id: NodeId) -> StoreResult<watch::Receiver<NodeStatus>> {
        let arena = self.arena.read();
        let status = arena.node(id)?.status;
        if status.is_terminal() {
            return Ok(watch::channel(status).1);
        }
        let rx = self
            .watchers
            .entry(id)
            .or_insert_with(|| watch::channel(status).0)
            .subscribe();
        Ok(rx)
    }

    /// Copy of a node
    ///
    /// # Errors
    /// Returns `NotFound` if the node does not exist
    pub fn get(&self, id: NodeId) -> StoreResult<VersionNode> {
        self.arena.read().node(id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.arena.read().nodes.contains_key(&id)
    }

    #[must_use]
    pub fn root(&self) -> Option<VersionNode> {
        let arena = self.arena.read();
        arena.root.and_then(|id| arena.nodes.get(&id).cloned())
    }

    /// Number of nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.arena.read().order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every node in creation order
    #[must_use]
    pub fn list_nodes(&self) -> Vec<VersionNode> {
        let arena = self.arena.read();
        arena
            .order
            .iter()
            .filter_map(|id| arena.nodes.get(id).cloned())
            .collect()
    }

    /// Nodes still pending or generating
    #[must_use]
    pub fn in_flight(&self) -> Vec<VersionNode> {
        let arena = self.arena.read();
        arena
            .order
            .iter()
            .filter_map(|id| arena.nodes.get(id))
            .filter(|n| n.status.is_in_flight())
            .cloned()
            .collect()
    }

    /// Children of a node in creation order
    ///
    /// # Errors
    /// Returns `NotFound` if the node does not exist
    pub fn children(&self, id: NodeId) -> StoreResult<Vec<VersionNode>> {
        let arena = self.arena.read();
        arena.node(id)?;
        Ok(arena
            .children
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|child| arena.nodes.get(child).cloned())
            .collect())
    }

    /// Newest non-failed child of `parent` with this stage and input hash
    #[must_use]
    pub fn find_child(&self, parent: NodeId, stage: Stage, input_hash: ContentHash) -> Option<VersionNode> {
        let key = CacheKey {
            parent,
            stage,
            input_hash,
        };
        self.arena.read().find_child(&key, |_| true).cloned()
    }

    /// Path from the root to `id`, root first
    ///
    /// # Errors
    /// Returns `NotFound` if the node does not exist, `CorruptMetadata` if
    /// the parent chain loops
    pub fn history(&self, id: NodeId) -> StoreResult<Vec<VersionNode>> {
        let arena = self.arena.read();
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if chain.len() > arena.nodes.len() {
                return Err(corrupt(&self.node_path(id), "parent chain contains a cycle".into()));
            }
            let node = arena.node(current)?;
            cursor = node.parent_id;
            chain.push(node.clone());
        }
        chain.reverse();
        Ok(chain)
    }

    /// Whether `ancestor` is `node` or lies on its parent chain
    ///
    /// # Errors
    /// Returns `NotFound` if `node` does not exist
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> StoreResult<bool> {
        let arena = self.arena.read();
        let mut cursor = Some(arena.node(node)?.id);
        let mut steps = 0;
        while let Some(current) = cursor {
            if current == ancestor {
                return Ok(true);
            }
            steps += 1;
            if steps > arena.nodes.len() {
                return Ok(false);
            }
            cursor = arena.nodes.get(&current).and_then(|n| n.parent_id);
        }
        Ok(false)
    }

    /// Add `id` and its ancestors to `live`, stopping at already-marked nodes
    pub(crate) fn mark_ancestors(&self, id: NodeId, live: &mut HashSet<NodeId>) {
        let arena = self.arena.read();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if !arena.nodes.contains_key(&current) || !live.insert(current) {
                break;
            }
            cursor = arena.nodes.get(&current).and_then(|n| n.parent_id);
        }
    }
}

fn corrupt(path: &Path, reason: String) -> StoreError {
    StoreError::CorruptMetadata {
        path: path.to_path_buf(),
        reason,
    }
}
