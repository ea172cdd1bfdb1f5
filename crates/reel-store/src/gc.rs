//! Garbage collection
//!
//! Mark: every ancestor of a branch head, of a pinned node or of an
//! in-flight node is live.
//!
//! Sweep:
//! 1. Artifact records of dead nodes older than the grace period are marked
//!    reclaimed, then their blob references are dropped
//! 2. Blobs with no references older than the grace period are deleted
//!
//! Step 2 only ever deletes unreferenced blobs, so stopping a run at any
//! point leaves every live blob in place; the next run picks up the rest.

use crate::branch::BranchRegistry;
use crate::content::{ContentStore, SweepOutcome};
use crate::error::{EntityKind, StoreResult};
use crate::fs;
use crate::graph::VersionGraph;
use crate::records::ArtifactIndex;
use crate::types::NodeId;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Nodes kept alive regardless of branches (`pins.json`)
#[derive(Debug)]
pub struct PinSet {
    path: PathBuf,
    fsync: bool,
    pins: RwLock<BTreeSet<NodeId>>,
}

impl PinSet {
    /// Load `path`; a missing file is an empty set
    ///
    /// # Errors
    /// Returns `StorageIO` or `CorruptMetadata` if the file cannot be read
    pub fn load(path: impl Into<PathBuf>, fsync: bool) -> StoreResult<Self> {
        let path = path.into();
        let pins = if path.exists() {
            fs::read_json(&path, EntityKind::Node)?
        } else {
            BTreeSet::new()
        };
        Ok(Self {
            path,
            fsync,
            pins: RwLock::new(pins),
        })
    }

    /// Add a pin; returns `false` if already pinned
    ///
    /// # Errors
    /// Returns `StorageIO` on write failure
    pub fn insert(&self, node: NodeId) -> StoreResult<bool> {
        let mut pins = self.pins.write();
        if pins.contains(&node) {
            return Ok(false);
        }
        let mut next = pins.clone();
        next.insert(node);
        fs::write_json(&self.path, &next, self.fsync)?;
        *pins = next;
        Ok(true)
    }

    /// Remove a pin; returns `false` if it was not pinned
    ///
    /// # Errors
    /// Returns `StorageIO` on write failure
    pub fn remove(&self, node: NodeId) -> StoreResult<bool> {
        let mut pins = self.pins.write();
        if !pins.contains(&node) {
            return Ok(false);
        }
        let mut next = pins.clone();
        next.remove(&node);
        fs::write_json(&self.path, &next, self.fsync)?;
        *pins = next;
        Ok(true)
    }

    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        self.pins.read().contains(&node)
    }

    #[must_use]
    pub fn list(&self) -> Vec<NodeId> {
        self.pins.read().iter().copied().collect()
    }
}

/// Summary of one collection run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Nodes in the live set
    pub live_nodes: usize,
    /// Artifact records newly marked reclaimed
    pub records_reclaimed: usize,
    /// Dead records left alone because they are younger than the grace period
    pub records_skipped: usize,
    pub blobs_removed: usize,
    pub bytes_freed: u64,
    /// Unreferenced blobs left alone because they are younger than the grace period
    pub blobs_skipped: usize,
    /// Leftover temp files from interrupted writes
    pub partials_removed: usize,
}

/// One mark-and-sweep pass over a project
pub(crate) struct GarbageCollector<'a> {
    pub(crate) graph: &'a VersionGraph,
    pub(crate) records: &'a ArtifactIndex,
    pub(crate) content: &'a ContentStore,
    pub(crate) branches: &'a BranchRegistry,
    pub(crate) pins: &'a PinSet,
    pub(crate) grace: Duration,
}

impl GarbageCollector<'_> {
    /// Live node set
    pub(crate) fn mark(&self) -> HashSet<NodeId> {
        let mut live = HashSet::new();
        for head in self.branches.heads() {
            self.graph.mark_ancestors(head, &mut live);
        }
        for pin in self.pins.list() {
            self.graph.mark_ancestors(pin, &mut live);
        }
        for node in self.graph.in_flight() {
            self.graph.mark_ancestors(node.id, &mut live);
        }
        live
    }

    pub(crate) fn run(&self) -> StoreResult<GcReport> {
        // taken before marking; records inserted later wait for the next run
        let records = self.records.all();
        let live = self.mark();
        let mut report = GcReport {
            live_nodes: live.len(),
            ..GcReport::default()
        };

        let now = Utc::now();
        for record in records {
            if record.is_reclaimed() {
                // finish an interrupted run
                for hash in record.blob_refs() {
                    self.content.remove_ref(&hash, record.id)?;
                }
                continue;
            }
            if live.contains(&record.node_id) {
                continue;
            }
            let age = now
                .signed_duration_since(record.created_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age < self.grace {
                report.records_skipped += 1;
                continue;
            }
            self.records.mark_reclaimed(record.id)?;
            for hash in record.blob_refs() {
                self.content.remove_ref(&hash, record.id)?;
            }
            debug!("Reclaimed artifact {} of node {}", record.id, record.node_id);
            report.records_reclaimed += 1;
        }

        for hash in self.content.list_blobs()? {
            match self.content.delete_if_unreferenced(&hash, self.grace)? {
                SweepOutcome::Removed { bytes } => {
                    report.blobs_removed += 1;
                    report.bytes_freed += bytes;
                }
                SweepOutcome::TooYoung => report.blobs_skipped += 1,
                SweepOutcome::Referenced | SweepOutcome::Missing => {}
            }
        }
        report.partials_removed = self.content.sweep_partials(self.grace)?;

        metrics::counter!("reel_gc_blobs_removed_total").increment(report.blobs_removed as u64);
        info!(
            "GC: {} live nodes, {} records reclaimed, {} blobs removed ({} bytes), {} blobs in grace",
            report.live_nodes,
            report.records_reclaimed,
            report.blobs_removed,
            report.bytes_freed,
            report.blobs_skipped
        );
        Ok(report)
    }
}
