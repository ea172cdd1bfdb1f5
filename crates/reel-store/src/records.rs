//! Artifact records (`artifacts/<id>.json`)

use crate::error::{EntityKind, StoreError, StoreResult};
use crate::fs;
use crate::types::{ArtifactId, ArtifactRecord, NodeId};
use chrono::Utc;
use parking_lot::RwLock;
use reel_artifact::ContentHash;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

/// In-memory index of artifact records, persisted one file per record
#[derive(Debug)]
pub struct ArtifactIndex {
    dir: PathBuf,
    fsync: bool,
    records: RwLock<HashMap<ArtifactId, ArtifactRecord>>,
}

impl ArtifactIndex {
    /// Load every record under `dir`
    ///
    /// # Errors
    /// Returns `StorageIO` or `CorruptMetadata` if a record cannot be read
    pub fn load(dir: impl Into<PathBuf>, fsync: bool) -> StoreResult<Self> {
        let dir = dir.into();
        let mut records = HashMap::new();
        for path in fs::json_files(&dir)? {
            let record: ArtifactRecord = fs::read_json(&path, EntityKind::Artifact)?;
            records.insert(record.id, record);
        }
        Ok(Self {
            dir,
            fsync,
            records: RwLock::new(records),
        })
    }

    fn path(&self, id: ArtifactId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Persist and index a new record
    ///
    /// # Errors
    /// Returns `InvalidState` if the id is taken, `StorageIO` on write failure
    pub fn insert(&self, record: ArtifactRecord) -> StoreResult<()> {
        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            return Err(StoreError::invalid(format!("artifact {} already exists", record.id)));
        }
        fs::write_json(&self.path(record.id), &record, self.fsync)?;
        records.insert(record.id, record);
        Ok(())
    }

    /// # Errors
    /// Returns `NotFound` if no such record exists
    pub fn get(&self, id: ArtifactId) -> StoreResult<ArtifactRecord> {
        self.records
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(EntityKind::Artifact, id))
    }

    /// Stamp a record as reclaimed; returns `false` if it already was
    ///
    /// # Errors
    /// Returns `NotFound` if no such record exists, `StorageIO` on write failure
    pub fn mark_reclaimed(&self, id: ArtifactId) -> StoreResult<bool> {
        let mut records = self.records.write();
        let record = records
            .get(&id)
            .ok_or_else(|| StoreError::not_found(EntityKind::Artifact, id))?;
        if record.is_reclaimed() {
            return Ok(false);
        }
        let mut next = record.clone();
        next.reclaimed_at = Some(Utc::now());
        fs::write_json(&self.path(id), &next, self.fsync)?;
        records.insert(id, next);
        Ok(true)
    }

    /// Every record, oldest first
    #[must_use]
    pub fn all(&self) -> Vec<ArtifactRecord> {
        let mut all: Vec<_> = self.records.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    /// Records attached to a node
    #[must_use]
    pub fn for_node(&self, node: NodeId) -> Vec<ArtifactRecord> {
        self.all().into_iter().filter(|r| r.node_id == node).collect()
    }

    /// Blob references implied by every record not yet reclaimed
    #[must_use]
    pub fn live_refs(&self) -> HashMap<ContentHash, BTreeSet<ArtifactId>> {
        let mut refs: HashMap<ContentHash, BTreeSet<ArtifactId>> = HashMap::new();
        for record in self.records.read().values().filter(|r| !r.is_reclaimed()) {
            for hash in record.blob_refs() {
                refs.entry(hash).or_default().insert(record.id);
            }
        }
        refs
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_artifact::{ArtifactType, Stage};

    fn record(node: NodeId, hash: ContentHash) -> ArtifactRecord {
        ArtifactRecord {
            id: ArtifactId::new(),
            node_id: node,
            stage: Stage::Script,
            artifact_type: ArtifactType::Script,
            content_hash: hash,
            size: 3,
            summary: "draft".into(),
            dependencies: vec![],
            preview_ref: None,
            created_at: Utc::now(),
            reclaimed_at: None,
        }
    }

    #[test]
    fn insert_get_reload() {
        let dir = tempfile::tempdir().unwrap();
        let node = NodeId::new();
        let rec = record(node, ContentHash::of_str("a"));
        {
            let index = ArtifactIndex::load(dir.path(), false).unwrap();
            index.insert(rec.clone()).unwrap();
            assert!(matches!(index.insert(rec.clone()), Err(StoreError::InvalidState(_))));
        }
        let index = ArtifactIndex::load(dir.path(), false).unwrap();
        assert_eq!(index.get(rec.id).unwrap(), rec);
        assert_eq!(index.for_node(node), vec![rec]);
        assert!(index.get(ArtifactId::new()).unwrap_err().is_not_found());
    }

    #[test]
    fn reclaimed_records_drop_out_of_live_refs() {
        let dir = tempfile::tempdir().unwrap();
        let index = ArtifactIndex::load(dir.path(), false).unwrap();
        let shared = ContentHash::of_str("shared");
        let a = record(NodeId::new(), shared);
        let mut b = record(NodeId::new(), shared);
        b.preview_ref = Some(ContentHash::of_str("thumb"));
        index.insert(a.clone()).unwrap();
        index.insert(b.clone()).unwrap();

        let refs = index.live_refs();
        assert_eq!(refs[&shared], BTreeSet::from([a.id, b.id]));
        assert_eq!(refs.len(), 2);

        assert!(index.mark_reclaimed(b.id).unwrap());
        assert!(!index.mark_reclaimed(b.id).unwrap());
        let refs = index.live_refs();
        assert_eq!(refs[&shared], BTreeSet::from([a.id]));
        assert!(!refs.contains_key(&ContentHash::of_str("thumb")));

        let reloaded = ArtifactIndex::load(dir.path(), false).unwrap();
        assert!(reloaded.get(b.id).unwrap().is_reclaimed());
    }
}
