//! Content-addressed blob pool
//!
//! Blobs live at `blobs/<xx>/<hex>` and never change once visible. Each
//! blob's reference set (the artifact records pointing at it) is kept in
//! memory and mirrored to `blobs/<xx>/<hex>.refs`.
//!
//! Writing a blob and deleting it both run under that hash's write lock, so
//! a deduplicating `put` and a garbage-collection delete of the same hash
//! never interleave. Blob bytes are written outside the reference table;
//! its entries are held only while a reference set changes.

use crate::error::{EntityKind, StoreError, StoreResult};
use crate::fs::{self, PARTIAL_PREFIX};
use crate::locks::KeyedLocks;
use crate::types::ArtifactId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reel_artifact::ContentHash;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, warn};

const REFS_EXT: &str = "refs";

/// Result of one [`ContentStore::delete_if_unreferenced`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// At least one artifact record still points at the blob
    Referenced,
    /// Unreferenced but modified within the grace period
    TooYoung,
    /// Deleted
    Removed { bytes: u64 },
    /// No such blob on disk
    Missing,
}

/// Blob pool of one project
#[derive(Debug)]
pub struct ContentStore {
    dir: PathBuf,
    refs: DashMap<ContentHash, BTreeSet<ArtifactId>>,
    writing: KeyedLocks<ContentHash>,
    verify_on_read: bool,
    fsync: bool,
}

impl ContentStore {
    /// Open (or create) the pool under `dir`, loading reference files
    ///
    /// # Errors
    /// Returns `StorageIO` if the directory cannot be read, `CorruptMetadata`
    /// if a reference file cannot be parsed
    pub fn open(dir: impl Into<PathBuf>, verify_on_read: bool, fsync: bool) -> StoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let store = Self {
            dir,
            refs: DashMap::new(),
            writing: KeyedLocks::new(),
            verify_on_read,
            fsync,
        };
        for hash in store.list_blobs()? {
            let refs_path = store.refs_path(&hash);
            let set = if refs_path.exists() {
                fs::read_json(&refs_path, EntityKind::Blob)?
            } else {
                BTreeSet::new()
            };
            store.refs.insert(hash, set);
        }
        debug!("Opened blob pool at {} with {} blobs", store.dir.display(), store.refs.len());
        Ok(store)
    }

    /// Root directory of the pool
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.dir.join(hash.shard()).join(hash.to_hex())
    }

    fn refs_path(&self, hash: &ContentHash) -> PathBuf {
        self.blob_path(hash).with_extension(REFS_EXT)
    }

    /// Store bytes and return their hash
    ///
    /// Identical bytes are written once; a repeated `put` refreshes the
    /// blob's modification time so garbage collection treats it as new.
    ///
    /// # Errors
    /// Returns `StorageIO` on write failure
    pub fn put(&self, bytes: &[u8]) -> StoreResult<ContentHash> {
        let hash = ContentHash::compute(bytes);
        let path = self.blob_path(&hash);

        self.writing.with(hash, || {
            if path.exists() {
                touch(&path)?;
                metrics::counter!("reel_blobs_deduplicated_total").increment(1);
                debug!("Blob {} already stored ({} bytes)", hash.short(), bytes.len());
            } else {
                fs::write_atomic(&path, bytes, self.fsync)?;
                metrics::counter!("reel_blobs_written_total").increment(1);
                debug!("Wrote blob {} ({} bytes)", hash.short(), bytes.len());
            }
            self.refs.entry(hash).or_default();
            Ok::<_, StoreError>(())
        })?;
        Ok(hash)
    }

    /// Read a blob
    ///
    /// # Errors
    /// Returns `NotFound` if absent, `HashMismatch` if verification is on
    /// and the bytes no longer match their address
    pub fn get(&self, hash: &ContentHash) -> StoreResult<Vec<u8>> {
        let path = self.blob_path(hash);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::not_found(EntityKind::Blob, hash));
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        if self.verify_on_read {
            let actual = ContentHash::compute(&bytes);
            if actual != *hash {
                error!("Blob {} is corrupt: content hashes to {}", hash, actual);
                return Err(StoreError::HashMismatch {
                    expected: *hash,
                    actual,
                });
            }
        }
        Ok(bytes)
    }

    /// Whether the blob is on disk
    #[must_use]
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.blob_path(hash).is_file()
    }

    /// Size in bytes of a stored blob
    ///
    /// # Errors
    /// Returns `NotFound` if absent
    pub fn size(&self, hash: &ContentHash) -> StoreResult<u64> {
        let path = self.blob_path(hash);
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::not_found(EntityKind::Blob, hash))
            }
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Record that `artifact` points at `hash`; adding twice is a no-op
    ///
    /// # Errors
    /// Returns `NotFound` if the blob is absent, `StorageIO` if the
    /// reference file cannot be written
    pub fn add_ref(&self, hash: &ContentHash, artifact: ArtifactId) -> StoreResult<()> {
        let mut set = self.refs.entry(*hash).or_default();
        if !self.blob_path(hash).is_file() {
            return Err(StoreError::not_found(EntityKind::Blob, hash));
        }
        if set.insert(artifact) {
            if let Err(e) = self.write_refs(hash, &set) {
                set.remove(&artifact);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drop the reference of `artifact` on `hash`; returns whether it existed
    ///
    /// # Errors
    /// Returns `StorageIO` if the reference file cannot be written
    pub fn remove_ref(&self, hash: &ContentHash, artifact: ArtifactId) -> StoreResult<bool> {
        let Some(mut set) = self.refs.get_mut(hash) else {
            return Ok(false);
        };
        if !set.remove(&artifact) {
            return Ok(false);
        }
        if let Err(e) = self.write_refs(hash, &set) {
            set.insert(artifact);
            return Err(e);
        }
        Ok(true)
    }

    /// Number of artifact records pointing at `hash`
    #[must_use]
    pub fn ref_count(&self, hash: &ContentHash) -> usize {
        self.refs.get(hash).map_or(0, |set| set.len())
    }

    /// Artifact records pointing at `hash`
    #[must_use]
    pub fn referrers(&self, hash: &ContentHash) -> BTreeSet<ArtifactId> {
        self.refs.get(hash).map(|set| set.clone()).unwrap_or_default()
    }

    fn write_refs(&self, hash: &ContentHash, set: &BTreeSet<ArtifactId>) -> StoreResult<()> {
        let path = self.refs_path(hash);
        if set.is_empty() {
            fs::remove_file_if_exists(&path).map(|_| ())
        } else {
            fs::write_json(&path, set, self.fsync)
        }
    }

    /// Every blob currently on disk, sorted
    ///
    /// # Errors
    /// Returns `StorageIO` if a shard directory cannot be read
    pub fn list_blobs(&self) -> StoreResult<Vec<ContentHash>> {
        let mut hashes = Vec::new();
        for shard in read_dir_paths(&self.dir)? {
            if !shard.is_dir() {
                continue;
            }
            for path in read_dir_paths(&shard)? {
                if path.extension().is_some() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if let Ok(hash) = name.parse::<ContentHash>() {
                    hashes.push(hash);
                }
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    /// Delete a blob if nothing references it and it is older than `grace`
    ///
    /// # Errors
    /// Returns `StorageIO` if the blob exists but cannot be inspected or removed
    pub fn delete_if_unreferenced(&self, hash: &ContentHash, grace: Duration) -> StoreResult<SweepOutcome> {
        self.writing.with(*hash, || match self.refs.entry(*hash) {
            Entry::Occupied(entry) => {
                if !entry.get().is_empty() {
                    return Ok(SweepOutcome::Referenced);
                }
                let outcome = self.remove_blob_files(hash, grace)?;
                if matches!(outcome, SweepOutcome::Removed { .. } | SweepOutcome::Missing) {
                    entry.remove();
                }
                Ok(outcome)
            }
            Entry::Vacant(entry) => {
                let outcome = self.remove_blob_files(hash, grace);
                drop(entry);
                outcome
            }
        })
    }

    fn remove_blob_files(&self, hash: &ContentHash, grace: Duration) -> StoreResult<SweepOutcome> {
        let path = self.blob_path(hash);
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SweepOutcome::Missing),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        if age_of(&meta) < grace {
            return Ok(SweepOutcome::TooYoung);
        }
        fs::remove_file_if_exists(&path)?;
        fs::remove_file_if_exists(&self.refs_path(hash))?;
        debug!("Removed blob {} ({} bytes)", hash.short(), meta.len());
        Ok(SweepOutcome::Removed { bytes: meta.len() })
    }

    /// Remove temp files left by interrupted writes, returning how many went
    ///
    /// # Errors
    /// Returns `StorageIO` if a shard directory cannot be read
    pub fn sweep_partials(&self, grace: Duration) -> StoreResult<usize> {
        let mut removed = 0;
        for shard in read_dir_paths(&self.dir)? {
            if !shard.is_dir() {
                continue;
            }
            for path in read_dir_paths(&shard)? {
                let is_partial = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(PARTIAL_PREFIX));
                if !is_partial {
                    continue;
                }
                let old_enough = std::fs::metadata(&path).is_ok_and(|m| age_of(&m) >= grace);
                if old_enough && fs::remove_file_if_exists(&path)? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Make the reference table match `expected` exactly
    ///
    /// Used when opening a project: references are rebuilt from the live
    /// artifact records, repairing any drift left by an interrupted write or
    /// garbage-collection run. Returns how many blobs changed.
    ///
    /// # Errors
    /// Returns `StorageIO` if a reference file cannot be written
    pub fn reconcile(&self, expected: &HashMap<ContentHash, BTreeSet<ArtifactId>>) -> StoreResult<usize> {
        let mut hashes: BTreeSet<ContentHash> = self.refs.iter().map(|e| *e.key()).collect();
        hashes.extend(expected.keys().copied());

        let mut changed = 0;
        for hash in hashes {
            let want = expected.get(&hash).cloned().unwrap_or_default();
            if !want.is_empty() && !self.contains(&hash) {
                warn!("Blob {} is referenced by {} artifact(s) but missing on disk", hash, want.len());
                continue;
            }
            let mut set = self.refs.entry(hash).or_default();
            if *set != want {
                self.write_refs(&hash, &want)?;
                *set = want;
                changed += 1;
            }
        }
        if changed > 0 {
            warn!("Repaired blob references on {} blob(s)", changed);
        }
        Ok(changed)
    }
}

fn touch(path: &Path) -> StoreResult<()> {
    std::fs::File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now()))
        .map_err(|e| StoreError::io(path, e))
}

fn age_of(meta: &std::fs::Metadata) -> Duration {
    meta.modified()
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .unwrap_or(Duration::ZERO)
}

fn read_dir_paths(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    entries
        .map(|entry| entry.map(|e| e.path()).map_err(|e| StoreError::io(dir, e)))
        .collect()
}
