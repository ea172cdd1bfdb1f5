//! Cache resolver
//!
//! Decides, per `(parent, stage, input_hash)`, whether a stage result can be
//! reused or must be computed, and makes sure concurrent callers with the
//! same key share a single computation:
//!
//! 1. Look up or create the child node for the key (atomic per key)
//! 2. `completed` -> [`Resolution::Cached`]
//! 3. `pending` -> try `pending -> generating`; the winner computes
//! 4. `generating` (or a lost race) -> wait for a terminal status, then retry
//!
//! A failed node is never reused; the retry creates a fresh sibling.

use crate::error::{StoreError, StoreResult};
use crate::executor::{StageContext, StageOutput, StoreView};
use crate::graph::NewNode;
use crate::store::{ArtifactExtras, ArtifactStore};
use crate::types::{ArtifactRecord, CacheKey, FailureMarker, NodeId, NodeStatus, VersionNode};
use reel_artifact::{ContentHash, Stage};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Parameters of one resolution
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub parent: NodeId,
    pub stage: Stage,
    pub input_hash: ContentHash,
    /// Branch recorded on a newly created node (default: the parent's)
    pub branch: Option<String>,
    pub message: String,
    /// Overrides the configured wait timeout
    pub wait_timeout: Option<Duration>,
    /// Move the branch head to the result when it descends from the head
    pub advance_branch: bool,
}

impl ResolveRequest {
    #[must_use]
    pub fn new(parent: NodeId, stage: Stage, input_hash: ContentHash) -> Self {
        Self {
            parent,
            stage,
            input_hash,
            branch: None,
            message: String::new(),
            wait_timeout: None,
            advance_branch: false,
        }
    }

    #[must_use]
    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    #[must_use]
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn advance_branch(mut self, advance: bool) -> Self {
        self.advance_branch = advance;
        self
    }

    fn key(&self) -> CacheKey {
        CacheKey {
            parent: self.parent,
            stage: self.stage,
            input_hash: self.input_hash,
        }
    }
}

/// A completed node and its artifact record
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedArtifact {
    pub node: VersionNode,
    pub record: ArtifactRecord,
}

impl ResolvedArtifact {
    #[inline]
    #[must_use]
    pub fn content_hash(&self) -> ContentHash {
        self.record.content_hash
    }
}

/// A computation that ended with the node marked `failed`
#[derive(Debug)]
pub struct ComputeFailure {
    pub node: VersionNode,
    pub marker: FailureMarker,
    pub error: anyhow::Error,
}

/// Outcome of [`CacheResolver::resolve_or_compute`]
#[derive(Debug)]
pub enum Resolution {
    /// An existing completed node matched; nothing ran
    Cached(ResolvedArtifact),
    /// This call ran the computation and stored its result
    Computed(ResolvedArtifact),
    /// This call ran the computation and it failed
    Failed(ComputeFailure),
}

impl Resolution {
    /// The node the resolution ended on
    #[must_use]
    pub fn node(&self) -> &VersionNode {
        match self {
            Resolution::Cached(r) | Resolution::Computed(r) => &r.node,
            Resolution::Failed(f) => &f.node,
        }
    }

    /// Cached or computed artifact
    #[must_use]
    pub fn artifact(&self) -> Option<&ResolvedArtifact> {
        match self {
            Resolution::Cached(r) | Resolution::Computed(r) => Some(r),
            Resolution::Failed(_) => None,
        }
    }

    #[must_use]
    pub fn is_cached(&self) -> bool {
        matches!(self, Resolution::Cached(_))
    }

    #[must_use]
    pub fn is_computed(&self) -> bool {
        matches!(self, Resolution::Computed(_))
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Resolution::Failed(_))
    }

    /// Convert into a `Result`, turning a failed computation into its error
    ///
    /// # Errors
    /// Returns the computation's error for [`Resolution::Failed`]
    pub fn into_artifact(self) -> anyhow::Result<ResolvedArtifact> {
        match self {
            Resolution::Cached(r) | Resolution::Computed(r) => Ok(r),
            Resolution::Failed(f) => Err(f
                .error
                .context(format!("node {} failed ({})", f.node.id, f.marker))),
        }
    }
}

/// Resolves stage invocations against the version graph
#[derive(Debug, Clone)]
pub struct CacheResolver {
    store: ArtifactStore,
}

impl CacheResolver {
    #[must_use]
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    /// Reuse or compute the child of `parent` for `stage` and `input_hash`
    ///
    /// # Errors
    /// See [`resolve_with`](Self::resolve_with)
    #[tracing::instrument(skip(self, compute))]
    pub async fn resolve_or_compute<F, Fut>(
        &self,
        parent: NodeId,
        stage: Stage,
        input_hash: ContentHash,
        compute: F,
    ) -> StoreResult<Resolution>
    where
        F: FnOnce(StageContext) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<StageOutput>> + Send,
    {
        self.resolve_with(ResolveRequest::new(parent, stage, input_hash), compute)
            .await
    }

    /// Resolve a request, running `compute` at most once
    ///
    /// Computation errors come back as [`Resolution::Failed`], not as `Err`.
    ///
    /// # Errors
    /// - `NotFound` if the parent does not exist or its artifact was reclaimed
    /// - `InvalidState` if the parent is not completed or the stage cannot
    ///   follow it
    /// - `Unresolved` if another caller's computation outlives the wait timeout
    /// - `StorageIO` and corruption errors from the underlying store
    pub async fn resolve_with<F, Fut>(&self, request: ResolveRequest, compute: F) -> StoreResult<Resolution>
    where
        F: FnOnce(StageContext) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<StageOutput>> + Send,
    {
        let graph = self.store.graph();
        let parent = graph.get(request.parent)?;
        // a reclaimed parent would leave a hole in the new node's history
        self.store.completed_record(&parent)?;

        let key = request.key();
        let timeout = request
            .wait_timeout
            .unwrap_or_else(|| self.store.config().wait_timeout);
        let deadline = Instant::now() + timeout;

        loop {
            let mut template = NewNode::child(key.parent, key.stage, key.input_hash)
                .message(request.message.clone());
            if let Some(branch) = &request.branch {
                template = template.on_branch(branch.clone());
            }
            let (node, created) =
                graph.find_or_create(key, |n| self.store.is_reusable(n), template)?;

            match node.status {
                NodeStatus::Completed => match self.store.completed_record(&node) {
                    Ok(record) => {
                        metrics::counter!("reel_cache_hits_total", "stage" => key.stage.as_str())
                            .increment(1);
                        debug!("Cache hit for {} under {}: node {}", key.stage, key.parent, node.id);
                        return Ok(Resolution::Cached(ResolvedArtifact { node, record }));
                    }
                    // reclaimed between lookup and read; the next lookup skips it
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                },
                NodeStatus::Pending => {
                    match graph.transition(node.id, NodeStatus::Pending, NodeStatus::Generating) {
                        Ok(claimed) => {
                            metrics::counter!("reel_cache_misses_total", "stage" => key.stage.as_str())
                                .increment(1);
                            debug!(
                                "Cache miss for {} under {}: computing node {} (new: {})",
                                key.stage, key.parent, claimed.id, created
                            );
                            return self.run(claimed, parent, compute).await;
                        }
                        Err(StoreError::ConcurrentModification { .. }) => {
                            self.wait(node.id, deadline, timeout).await?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                NodeStatus::Generating => self.wait(node.id, deadline, timeout).await?,
                NodeStatus::Failed => {}
            }
        }
    }

    async fn wait(&self, node_id: NodeId, deadline: Instant, timeout: Duration) -> StoreResult<()> {
        let mut rx = self.store.graph().subscribe(node_id)?;
        debug!("Waiting for node {}", node_id);
        let finished = tokio::time::timeout_at(deadline, rx.wait_for(|s| s.is_terminal()))
            .await
            .map(|seen| seen.is_ok());
        match finished {
            // a closed channel means the node went terminal; the caller re-reads it
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("Gave up waiting for node {} after {:?}", node_id, timeout);
                Err(StoreError::Unresolved {
                    node_id,
                    waited: timeout,
                })
            }
        }
    }

    async fn run<F, Fut>(&self, node: VersionNode, parent: VersionNode, compute: F) -> StoreResult<Resolution>
    where
        F: FnOnce(StageContext) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<StageOutput>> + Send,
    {
        let mut guard = GenerationGuard::new(self.store.clone(), node.id);
        let ctx = StageContext {
            store: StoreView::new(self.store.clone()),
            parent,
            stage: node.stage,
            input_hash: node.input_hash,
            node_id: node.id,
        };

        let output = match compute(ctx).await {
            Ok(output) => output,
            Err(error) => {
                guard.disarm();
                return self.record_failure(&node, FailureMarker::Error, error);
            }
        };

        let extras = ArtifactExtras::new()
            .with_dependencies(output.dependencies)
            .with_preview_opt(output.preview);
        let saved = self.store.save_encoded(
            node.id,
            node.stage.output_type(),
            output.bytes,
            output.summary,
            extras,
        );
        guard.disarm();

        match saved {
            Ok(record) => {
                let node = self.store.graph().get(node.id)?;
                Ok(Resolution::Computed(ResolvedArtifact { node, record }))
            }
            Err(StoreError::Payload(e)) => {
                self.record_failure(&node, FailureMarker::InvalidPayload, anyhow::Error::new(e))
            }
            Err(e) => {
                // a write failure has already failed the node; a rejected output has not
                let still_generating = self
                    .store
                    .graph()
                    .get(node.id)
                    .is_ok_and(|n| n.status == NodeStatus::Generating);
                if !still_generating {
                    return Err(e);
                }
                if let Err(fail_err) = self.store.graph().fail(
                    node.id,
                    NodeStatus::Generating,
                    FailureMarker::Error,
                    &e.to_string(),
                ) {
                    warn!("Could not mark node {} failed: {}", node.id, fail_err);
                }
                Err(e)
            }
        }
    }

    fn record_failure(&self, node: &VersionNode, marker: FailureMarker, error: anyhow::Error) -> StoreResult<Resolution> {
        let message = format!("{error:#}");
        let failed = self
            .store
            .graph()
            .fail(node.id, NodeStatus::Generating, marker, &message)?;
        metrics::counter!("reel_compute_failures_total", "stage" => node.stage.as_str()).increment(1);
        warn!("Stage {} failed on node {} ({}): {}", node.stage, node.id, marker, message);
        Ok(Resolution::Failed(ComputeFailure {
            node: failed,
            marker,
            error,
        }))
    }
}

/// Marks a generating node `failed(cancelled)` unless disarmed
///
/// Dropping the resolver future while the computation runs drops this guard.
struct GenerationGuard {
    store: ArtifactStore,
    node_id: NodeId,
    armed: bool,
}

impl GenerationGuard {
    fn new(store: ArtifactStore, node_id: NodeId) -> Self {
        Self {
            store,
            node_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.store.graph().fail(
            self.node_id,
            NodeStatus::Generating,
            FailureMarker::Cancelled,
            "computation dropped before completion",
        ) {
            Ok(_) => warn!("Computation for node {} was cancelled", self.node_id),
            Err(e) => warn!("Could not mark cancelled node {} failed: {}", self.node_id, e),
        }
    }
}
