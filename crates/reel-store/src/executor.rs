//! Stage executor seam
//!
//! A [`StageExecutor`] turns a parent node plus an input fingerprint into
//! encoded payload bytes. It reads through a [`StoreView`] and never touches
//! the graph or the blob pool directly; the resolver records whatever it
//! returns.

use crate::error::StoreResult;
use crate::store::ArtifactStore;
use crate::types::{ArtifactId, ArtifactRecord, NodeId, ProjectMeta, VersionNode};
use reel_artifact::{ArtifactPayload, ContentHash, PayloadError, Stage};

/// Read-only handle on a store
#[derive(Debug, Clone)]
pub struct StoreView {
    store: ArtifactStore,
}

impl StoreView {
    pub(crate) fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn project(&self) -> ProjectMeta {
        self.store.project()
    }

    /// # Errors
    /// Returns `NotFound` if the node does not exist
    pub fn node(&self, id: NodeId) -> StoreResult<VersionNode> {
        self.store.node(id)
    }

    /// # Errors
    /// Returns `NotFound` if the node does not exist
    pub fn history(&self, id: NodeId) -> StoreResult<Vec<VersionNode>> {
        self.store.history(id)
    }

    /// # Errors
    /// Returns `NotFound` for an unknown branch
    pub fn head(&self, branch: &str) -> StoreResult<NodeId> {
        self.store.head(branch)
    }

    /// Payload and record of a completed node
    ///
    /// # Errors
    /// See [`ArtifactStore::get_artifact`]
    pub fn get_artifact(&self, id: NodeId) -> StoreResult<(ArtifactPayload, ArtifactRecord)> {
        self.store.get_artifact(id)
    }

    /// # Errors
    /// Returns `NotFound` if the record does not exist
    pub fn artifact_record(&self, id: ArtifactId) -> StoreResult<ArtifactRecord> {
        self.store.artifact_record(id)
    }
}

/// Everything an executor gets for one invocation
#[derive(Debug, Clone)]
pub struct StageContext {
    pub store: StoreView,
    /// Copy of the parent node at the time the work was claimed
    pub parent: VersionNode,
    pub stage: Stage,
    pub input_hash: ContentHash,
    /// Node that will hold the result
    pub node_id: NodeId,
}

impl StageContext {
    /// Decoded payload of the parent node
    ///
    /// # Errors
    /// See [`ArtifactStore::get_artifact`]
    pub fn parent_payload(&self) -> StoreResult<ArtifactPayload> {
        self.store.get_artifact(self.parent.id).map(|(payload, _)| payload)
    }
}

/// What an executor hands back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutput {
    /// Encoded payload; must decode as the stage's artifact type
    pub bytes: Vec<u8>,
    pub summary: String,
    /// Artifacts the output was derived from
    pub dependencies: Vec<ArtifactId>,
    /// Optional secondary blob (thumbnail, waveform, ...)
    pub preview: Option<Vec<u8>>,
}

impl StageOutput {
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>, summary: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            summary: summary.into(),
            dependencies: Vec::new(),
            preview: None,
        }
    }

    /// Encode a typed payload
    ///
    /// # Errors
    /// Returns `PayloadError` if the payload cannot be encoded
    pub fn from_payload(payload: &ArtifactPayload, summary: impl Into<String>) -> Result<Self, PayloadError> {
        Ok(Self::new(payload.encode()?, summary))
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = ArtifactId>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    #[must_use]
    pub fn with_preview(mut self, preview: impl Into<Vec<u8>>) -> Self {
        self.preview = Some(preview.into());
        self
    }
}

/// Produces the output of one pipeline stage
#[async_trait::async_trait]
pub trait StageExecutor: Send + Sync {
    /// Run the stage for `ctx`
    ///
    /// Errors are recorded on the node as a failure; they never escape the
    /// store as `StoreError`.
    async fn execute(&self, ctx: StageContext) -> anyhow::Result<StageOutput>;
}
