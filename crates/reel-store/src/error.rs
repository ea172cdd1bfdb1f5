//! Error types for the versioned store
//!
//! One taxonomy for every component:
//! - `NotFound`: missing node, branch, artifact or blob
//! - `InvalidState`: illegal transition or branch move (caller bug)
//! - `ConcurrentModification`: lost a status compare-and-swap (retry)
//! - `HashMismatch`: stored bytes disagree with their digest (corruption)
//! - `StorageIO`: transient filesystem failure (retry with backoff)
//! - `SchemaVersion`: metadata written by an incompatible version
//!
//! Stage computation errors are not part of this enum; they are recorded on
//! the node and surfaced through [`Resolution::Failed`](crate::Resolution).

use crate::types::{NodeId, NodeStatus};
use reel_artifact::{ContentHash, PayloadError};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Kind of entity a lookup failed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Project,
    Node,
    Branch,
    Artifact,
    Blob,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Project => "project",
            EntityKind::Node => "node",
            EntityKind::Branch => "branch",
            EntityKind::Artifact => "artifact",
            EntityKind::Blob => "blob",
        })
    }
}

/// Main store error type
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Missing node, branch, artifact, blob or project
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Illegal transition, branch move or request shape
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Status compare-and-swap lost
    #[error("concurrent modification of node {node_id}: expected {expected}, found {actual}")]
    ConcurrentModification {
        node_id: NodeId,
        expected: NodeStatus,
        actual: NodeStatus,
    },

    /// Stored content does not hash to its address
    #[error("hash mismatch: blob {expected} hashes to {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// Filesystem failure
    #[error("storage I/O error at {path}: {source}")]
    StorageIO {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Metadata from an incompatible layout version
    #[error("unsupported schema version {found} in {path} (expected {expected})")]
    SchemaVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    /// A metadata file exists but cannot be parsed
    #[error("corrupt metadata in {path}: {reason}")]
    CorruptMetadata { path: PathBuf, reason: String },

    /// Waiting on another caller's computation timed out
    #[error("node {node_id} still unresolved after {waited:?}")]
    Unresolved { node_id: NodeId, waited: Duration },

    /// Payload encoding or decoding failed
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Build a `NotFound` error
    #[inline]
    pub fn not_found(kind: EntityKind, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Build a `StorageIO` error
    #[inline]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::StorageIO {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Build an `InvalidState` error
    #[inline]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Check if the operation may succeed when retried
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageIO { .. } | Self::ConcurrentModification { .. } | Self::Unresolved { .. }
        )
    }

    /// Check if the error signals damaged or incompatible storage
    #[inline]
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::HashMismatch { .. } | Self::SchemaVersion { .. } | Self::CorruptMetadata { .. }
        )
    }

    /// Check if this is a `NotFound` error
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result alias used throughout the crate
pub type StoreResult<T> = Result<T, StoreError>;
