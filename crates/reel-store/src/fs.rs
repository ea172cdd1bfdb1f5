//! On-disk layout and atomic file helpers

use crate::error::{EntityKind, StoreError, StoreResult};
use crate::types::{NodeId, ProjectId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Prefix of in-progress temp files; anything carrying it is never a blob
pub(crate) const PARTIAL_PREFIX: &str = ".partial-";

/// Paths of one project directory
#[derive(Debug, Clone)]
pub(crate) struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub(crate) fn new(storage_root: &Path, project_id: ProjectId) -> Self {
        Self {
            root: storage_root.join("projects").join(project_id.to_string()),
        }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn project_file(&self) -> PathBuf {
        self.root.join("project.json")
    }

    pub(crate) fn nodes_dir(&self) -> PathBuf {
        self.root.join("nodes")
    }

    pub(crate) fn node_file(&self, id: NodeId) -> PathBuf {
        self.nodes_dir().join(format!("{id}.json"))
    }

    pub(crate) fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub(crate) fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    pub(crate) fn branches_dir(&self) -> PathBuf {
        self.root.join("branches")
    }

    pub(crate) fn pins_file(&self) -> PathBuf {
        self.root.join("pins.json")
    }

    /// Create every directory of the layout
    pub(crate) fn create_dirs(&self) -> StoreResult<()> {
        for dir in [
            self.nodes_dir(),
            self.artifacts_dir(),
            self.blobs_dir(),
            self.branches_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(())
    }
}

/// Write `bytes` to `path` so readers see either the old file or the new one
///
/// The content goes to a temp file in the same directory, optionally
/// flushed to disk, then renamed over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8], fsync: bool) -> StoreResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::invalid(format!("{} has no parent directory", path.display())))?;
    std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(PARTIAL_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| StoreError::io(tmp.path(), e))?;
    if fsync {
        tmp.as_file().sync_all().map_err(|e| StoreError::io(tmp.path(), e))?;
    }
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;

    if fsync {
        sync_dir(dir)?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> StoreResult<()> {
    std::fs::File::open(dir)
        .and_then(|f| f.sync_all())
        .map_err(|e| StoreError::io(dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> StoreResult<()> {
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T, fsync: bool) -> StoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::CorruptMetadata {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    write_atomic(path, &bytes, fsync)
}

/// Read a JSON file; a missing file is `NotFound` of `kind`
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path, kind: EntityKind) -> StoreResult<T> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::not_found(kind, path.display()));
        }
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_slice(&bytes).map_err(|e| StoreError::CorruptMetadata {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// `*.json` files of a directory, skipping temp files; missing dir is empty
pub(crate) fn json_files(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| StoreError::io(dir, e))?.path();
        let is_partial = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(PARTIAL_PREFIX));
        if !is_partial && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Remove a file, treating "already gone" as success
pub(crate) fn remove_file_if_exists(path: &Path) -> StoreResult<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io(path, e)),
    }
}
