//! Branch registry
//!
//! Named pointers into the version graph, one file per branch under
//! `branches/`. A head only ever moves forward: to its current node or to
//! one of that node's descendants. A new branch starts next to live history,
//! never off a line nothing keeps alive.

use crate::error::{EntityKind, StoreError, StoreResult};
use crate::fs;
use crate::graph::VersionGraph;
use crate::types::{BranchRecord, NodeId, NodeStatus};
use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

static BRANCH_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/-]{0,127}$").expect("branch name pattern compiles")
});

/// Check a branch name: alphanumeric first, then up to 127 of `[A-Za-z0-9._/-]`
///
/// # Errors
/// Returns `InvalidState` describing the bad name
pub fn validate_branch_name(name: &str) -> StoreResult<()> {
    if BRANCH_NAME.is_match(name) && !name.contains("//") && !name.ends_with('/') {
        Ok(())
    } else {
        Err(StoreError::invalid(format!("invalid branch name {name:?}")))
    }
}

/// Branch heads of one project
#[derive(Debug)]
pub struct BranchRegistry {
    dir: PathBuf,
    fsync: bool,
    branches: RwLock<BTreeMap<String, BranchRecord>>,
}

impl BranchRegistry {
    /// Load every branch file under `dir`
    ///
    /// # Errors
    /// Returns `StorageIO` or `CorruptMetadata` if a branch file cannot be read
    pub fn load(dir: impl Into<PathBuf>, fsync: bool) -> StoreResult<Self> {
        let dir = dir.into();
        let mut branches = BTreeMap::new();
        for path in fs::json_files(&dir)? {
            let record: BranchRecord = fs::read_json(&path, EntityKind::Branch)?;
            branches.insert(record.name.clone(), record);
        }
        Ok(Self {
            dir,
            fsync,
            branches: RwLock::new(branches),
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name.replace('/', "%2F")))
    }

    /// # Errors
    /// Returns `NotFound` for an unknown branch
    pub fn get(&self, name: &str) -> StoreResult<BranchRecord> {
        self.branches
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(EntityKind::Branch, name))
    }

    /// Current head node of a branch
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown branch
    pub fn get_head(&self, name: &str) -> StoreResult<NodeId> {
        self.get(name).map(|b| b.head)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.branches.read().contains_key(name)
    }

    /// Every branch, sorted by name
    #[must_use]
    pub fn list(&self) -> Vec<BranchRecord> {
        self.branches.read().values().cloned().collect()
    }

    /// Head node of every branch
    #[must_use]
    pub fn heads(&self) -> Vec<NodeId> {
        self.branches.read().values().map(|b| b.head).collect()
    }

    /// Register a new branch at `node`
    ///
    /// # Errors
    /// - `InvalidState` for a bad or taken name, or a node that is not completed
    /// - `NotFound` if the node does not exist
    pub fn register(&self, graph: &VersionGraph, name: &str, node: NodeId) -> StoreResult<BranchRecord> {
        validate_branch_name(name)?;
        let mut branches = self.branches.write();
        if branches.contains_key(name) {
            return Err(StoreError::invalid(format!("branch {name} already exists")));
        }
        require_completed(graph, node)?;
        let record = self.write(name, node)?;
        branches.insert(name.to_string(), record.clone());
        info!("Registered branch {} at node {}", name, node);
        Ok(record)
    }

    /// Move a branch head forward, or register it if the name is new
    ///
    /// A new name needs a node whose parent lies on the history of an
    /// existing head or of one of `pins`, so the new line hangs off live
    /// history. The root needs no parent.
    ///
    /// # Errors
    /// - `InvalidState` if `node` is not completed, is not the current head
    ///   or one of its descendants, or (for a new name) hangs off no live line
    /// - `NotFound` if the node does not exist
    pub fn set_head(
        &self,
        graph: &VersionGraph,
        name: &str,
        node: NodeId,
        pins: &[NodeId],
    ) -> StoreResult<BranchRecord> {
        validate_branch_name(name)?;
        let mut branches = self.branches.write();
        require_completed(graph, node)?;
        if let Some(current) = branches.get(name) {
            if !graph.is_ancestor(current.head, node)? {
                return Err(StoreError::invalid(format!(
                    "node {node} does not descend from head {} of branch {name}",
                    current.head
                )));
            }
            if current.head == node {
                return Ok(current.clone());
            }
        } else if let Some(parent) = graph.get(node)?.parent_id {
            let mut tips = branches.values().map(|b| b.head).chain(pins.iter().copied());
            if !tips.any(|tip| matches!(graph.is_ancestor(parent, tip), Ok(true))) {
                return Err(StoreError::invalid(format!(
                    "cannot start branch {name} at {node}: parent {parent} is on no branch or pin"
                )));
            }
        }
        let record = self.write(name, node)?;
        let previous = branches.insert(name.to_string(), record.clone());
        debug!(
            "Branch {} head {:?} -> {}",
            name,
            previous.map(|b| b.head),
            node
        );
        Ok(record)
    }

    /// Remove a branch pointer; its nodes are untouched
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown branch, `StorageIO` if the file
    /// cannot be removed
    pub fn delete(&self, name: &str) -> StoreResult<BranchRecord> {
        let mut branches = self.branches.write();
        if !branches.contains_key(name) {
            return Err(StoreError::not_found(EntityKind::Branch, name));
        }
        fs::remove_file_if_exists(&self.path(name))?;
        let removed = branches
            .remove(name)
            .ok_or_else(|| StoreError::not_found(EntityKind::Branch, name))?;
        info!("Deleted branch {} (head was {})", name, removed.head);
        Ok(removed)
    }

    fn write(&self, name: &str, head: NodeId) -> StoreResult<BranchRecord> {
        let record = BranchRecord {
            name: name.to_string(),
            head,
            updated_at: Utc::now(),
        };
        fs::write_json(&self.path(name), &record, self.fsync)?;
        Ok(record)
    }
}

fn require_completed(graph: &VersionGraph, node: NodeId) -> StoreResult<()> {
    let status = graph.get(node)?.status;
    if status == NodeStatus::Completed {
        Ok(())
    } else {
        Err(StoreError::invalid(format!(
            "branch heads must be completed nodes; {node} is {status}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NewNode;
    use crate::types::{ArtifactId, ProjectId};
    use reel_artifact::{ContentHash, Stage};

    struct Fixture {
        _dir: tempfile::TempDir,
        graph: VersionGraph,
        branches: BranchRegistry,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let graph = VersionGraph::new(ProjectId::new(), dir.path().join("nodes"), false);
        let branches = BranchRegistry::load(dir.path().join("branches"), false).unwrap();
        Fixture {
            _dir: dir,
            graph,
            branches,
        }
    }

    fn completed(graph: &VersionGraph, new: NewNode) -> NodeId {
        let node = graph.create_node(new).unwrap();
        graph
            .transition(node.id, NodeStatus::Pending, NodeStatus::Generating)
            .unwrap();
        graph
            .complete(node.id, ArtifactId::new(), ContentHash::of_str("x"))
            .unwrap();
        node.id
    }

    #[test]
    fn branch_names() {
        for ok in ["main", "alt_ending", "v1.2", "feature/dark-mode", "A"] {
            assert!(validate_branch_name(ok).is_ok(), "{ok}");
        }
        let long = "a".repeat(129);
        for bad in ["", "-x", ".hidden", "has space", "a//b", "trailing/", "ü", long.as_str()] {
            assert!(validate_branch_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn register_and_duplicate() {
        let f = fixture();
        let root = completed(&f.graph, NewNode::root(ContentHash::of_str("r")));
        f.branches.register(&f.graph, "main", root).unwrap();
        assert_eq!(f.branches.get_head("main").unwrap(), root);
        let err = f.branches.register(&f.graph, "main", root).unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
    }

    #[test]
    fn heads_only_move_forward() {
        let f = fixture();
        let root = completed(&f.graph, NewNode::root(ContentHash::of_str("r")));
        let a = completed(
            &f.graph,
            NewNode::child(root, Stage::Script, ContentHash::of_str("a")),
        );
        let b = completed(
            &f.graph,
            NewNode::child(root, Stage::Script, ContentHash::of_str("b")),
        );
        f.branches.register(&f.graph, "main", root).unwrap();

        f.branches.set_head(&f.graph, "main", a, &[]).unwrap();
        assert_eq!(f.branches.get_head("main").unwrap(), a);

        // sibling of the head
        let err = f.branches.set_head(&f.graph, "main", b, &[]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
        // backwards
        let err = f.branches.set_head(&f.graph, "main", root, &[]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
        // unknown name registers a new tip
        f.branches.set_head(&f.graph, "alt", b, &[]).unwrap();
        assert_eq!(f.branches.get_head("alt").unwrap(), b);
    }

    #[test]
    fn new_names_hang_off_live_lines() {
        let f = fixture();
        let root = completed(&f.graph, NewNode::root(ContentHash::of_str("r")));
        let a = completed(
            &f.graph,
            NewNode::child(root, Stage::Script, ContentHash::of_str("a")),
        );
        let stray = completed(
            &f.graph,
            NewNode::child(a, Stage::Description, ContentHash::of_str("s")),
        );
        f.branches.register(&f.graph, "main", root).unwrap();

        // `a` is on no line yet
        let err = f.branches.set_head(&f.graph, "stray", stray, &[]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
        assert!(!f.branches.contains("stray"));

        // a pin keeps `a` live
        f.branches.set_head(&f.graph, "stray", stray, &[a]).unwrap();
        assert_eq!(f.branches.get_head("stray").unwrap(), stray);
    }

    #[test]
    fn heads_must_be_completed() {
        let f = fixture();
        let root = completed(&f.graph, NewNode::root(ContentHash::of_str("r")));
        let pending = f
            .graph
            .create_node(NewNode::child(root, Stage::Script, ContentHash::of_str("p")))
            .unwrap();
        f.branches.register(&f.graph, "main", root).unwrap();
        let err = f.branches.set_head(&f.graph, "main", pending.id, &[]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
        let err = f.branches.set_head(&f.graph, "main", NodeId::new(), &[]).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn delete_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let graph = VersionGraph::new(ProjectId::new(), dir.path().join("nodes"), false);
        let root = completed(&graph, NewNode::root(ContentHash::of_str("r")));
        {
            let branches = BranchRegistry::load(dir.path().join("branches"), false).unwrap();
            branches.register(&graph, "main", root).unwrap();
            branches.register(&graph, "feature/x", root).unwrap();
            branches.register(&graph, "gone", root).unwrap();
            branches.delete("gone").unwrap();
            assert!(branches.delete("gone").unwrap_err().is_not_found());
        }
        let branches = BranchRegistry::load(dir.path().join("branches"), false).unwrap();
        let names: Vec<_> = branches.list().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["feature/x", "main"]);
        assert_eq!(branches.heads(), vec![root, root]);
    }
}
