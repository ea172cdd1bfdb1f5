//! Core records of the versioned store
//!
//! Defines the identifiers and persisted records:
//! - Node, artifact and project identifiers
//! - Version nodes and their status lifecycle
//! - Artifact records (metadata for a blob reference)
//! - Branch and project metadata

use chrono::{DateTime, Utc};
use reel_artifact::{ArtifactType, ContentHash, Stage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Persisted metadata layout version. Bump on incompatible changes.
pub const SCHEMA_VERSION: u32 = 1;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random id
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique version node identifier
    NodeId
);
uuid_id!(
    /// Unique artifact record identifier
    ArtifactId
);
uuid_id!(
    /// Unique project identifier
    ProjectId
);

/// Lifecycle of a version node
///
/// `Pending -> Generating -> Completed | Failed`, plus `Pending -> Failed` for
/// nodes abandoned before work started. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Generating,
    Completed,
    Failed,
}

impl NodeStatus {
    /// Completed or failed
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed)
    }

    /// Pending or generating
    #[inline]
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        !self.is_terminal()
    }

    /// States reachable in one step from `self`
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [NodeStatus] {
        use NodeStatus::{Completed, Failed, Generating, Pending};
        match self {
            Pending => &[Generating, Failed],
            Generating => &[Completed, Failed],
            Completed | Failed => &[],
        }
    }

    /// Whether `self -> to` is a legal edge
    #[inline]
    #[must_use]
    pub fn can_transition_to(self, to: NodeStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Generating => "generating",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a node ended up `failed`, stored under `metadata["failure"]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMarker {
    /// The stage computation returned an error
    Error,
    /// The computation was dropped before it finished
    Cancelled,
    /// Found in flight when the store was reopened
    Interrupted,
    /// The computation returned bytes that do not decode as the stage's payload
    InvalidPayload,
}

impl FailureMarker {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            FailureMarker::Error => "error",
            FailureMarker::Cancelled => "cancelled",
            FailureMarker::Interrupted => "interrupted",
            FailureMarker::InvalidPayload => "invalid_payload",
        }
    }
}

impl fmt::Display for FailureMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata key holding the [`FailureMarker`] of a failed node
pub const FAILURE_KEY: &str = "failure";
/// Metadata key holding the failure message of a failed node
pub const ERROR_KEY: &str = "error";

/// The (parent, stage, input fingerprint) triplet that decides reuse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub parent: NodeId,
    pub stage: Stage,
    pub input_hash: ContentHash,
}

/// One stage outcome in the history tree
///
/// Callers only ever hold copies; mutation goes through
/// [`VersionGraph`](crate::VersionGraph) transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionNode {
    pub id: NodeId,
    pub project_id: ProjectId,
    /// `None` only for the project root
    pub parent_id: Option<NodeId>,
    pub branch_name: String,
    #[serde(default)]
    pub commit_message: String,
    pub stage: Stage,
    pub stage_index: u32,
    /// Content hash of the payload blob, fixed once completed
    pub artifact_ref: Option<ContentHash>,
    /// Artifact record that owns `artifact_ref`
    pub artifact_id: Option<ArtifactId>,
    pub status: NodeStatus,
    pub input_hash: ContentHash,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl VersionNode {
    /// Project root (no parent)
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Cache key of this node, `None` for the root
    #[must_use]
    pub fn cache_key(&self) -> Option<CacheKey> {
        self.parent_id.map(|parent| CacheKey {
            parent,
            stage: self.stage,
            input_hash: self.input_hash,
        })
    }

    /// Failure marker recorded on a failed node
    #[must_use]
    pub fn failure(&self) -> Option<FailureMarker> {
        self.metadata
            .get(FAILURE_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Failure message recorded on a failed node
    #[must_use]
    pub fn failure_message(&self) -> Option<&str> {
        self.metadata.get(ERROR_KEY).and_then(serde_json::Value::as_str)
    }
}

/// Metadata of one stored artifact
///
/// Any number of records may point at the same blob. A record counts as a
/// blob reference until garbage collection reclaims it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: ArtifactId,
    pub node_id: NodeId,
    pub stage: Stage,
    pub artifact_type: ArtifactType,
    pub content_hash: ContentHash,
    pub size: u64,
    #[serde(default)]
    pub summary: String,
    /// Artifacts this one was derived from
    #[serde(default)]
    pub dependencies: Vec<ArtifactId>,
    /// Optional secondary blob (thumbnail, waveform, ...)
    #[serde(default)]
    pub preview_ref: Option<ContentHash>,
    pub created_at: DateTime<Utc>,
    /// Set when garbage collection detached this record from its blobs
    #[serde(default)]
    pub reclaimed_at: Option<DateTime<Utc>>,
}

impl ArtifactRecord {
    /// Whether garbage collection reclaimed this record's blobs
    #[inline]
    #[must_use]
    pub fn is_reclaimed(&self) -> bool {
        self.reclaimed_at.is_some()
    }

    /// Blobs this record holds references on
    pub fn blob_refs(&self) -> impl Iterator<Item = ContentHash> + '_ {
        std::iter::once(self.content_hash).chain(self.preview_ref)
    }
}

/// Named pointer into the version graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub name: String,
    pub head: NodeId,
    pub updated_at: DateTime<Utc>,
}

/// Project metadata (`project.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub schema_version: u32,
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub root_node_id: NodeId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_parse_and_display() {
        let id = NodeId::new();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<ArtifactId>().is_err());
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = ProjectId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
    }

    #[test]
    fn status_transition_table() {
        use NodeStatus::*;
        assert!(Pending.can_transition_to(Generating));
        assert!(Pending.can_transition_to(Failed));
        assert!(Generating.can_transition_to(Completed));
        assert!(Generating.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Generating.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Generating));
    }

    #[test]
    fn terminal_states() {
        assert!(NodeStatus::Completed.is_terminal());
        assert!(NodeStatus::Failed.is_terminal());
        assert!(NodeStatus::Pending.is_in_flight());
        assert!(NodeStatus::Generating.is_in_flight());
    }

    #[test]
    fn record_blob_refs_include_preview() {
        let hash = ContentHash::of_str("payload");
        let preview = ContentHash::of_str("thumb");
        let mut record = ArtifactRecord {
            id: ArtifactId::new(),
            node_id: NodeId::new(),
            stage: Stage::Image,
            artifact_type: ArtifactType::ImageReference,
            content_hash: hash,
            size: 7,
            summary: String::new(),
            dependencies: vec![],
            preview_ref: None,
            created_at: Utc::now(),
            reclaimed_at: None,
        };
        assert_eq!(record.blob_refs().collect::<Vec<_>>(), vec![hash]);
        record.preview_ref = Some(preview);
        assert_eq!(record.blob_refs().collect::<Vec<_>>(), vec![hash, preview]);
    }
}
