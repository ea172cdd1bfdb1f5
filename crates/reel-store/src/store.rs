//! Store facade
//!
//! [`ArtifactStore`] is the handle on one project: its version graph, blob
//! pool, artifact records, branches and pins. It is cheap to clone and
//! shares state between clones.
//!
//! Write ordering for a stage result:
//! 1. payload (and preview) blob written and renamed into place
//! 2. artifact record written, blob references added
//! 3. node moved to `completed`
//! 4. branch head advanced, if requested
//!
//! A crash between any two steps leaves the node short of `completed`,
//! and opening the project marks such nodes `failed(interrupted)`.

use crate::branch::{validate_branch_name, BranchRegistry};
use crate::config::StoreConfig;
use crate::content::ContentStore;
use crate::error::{EntityKind, StoreError, StoreResult};
use crate::executor::StageExecutor;
use crate::fs::{self, ProjectLayout};
use crate::gc::{GarbageCollector, GcReport, PinSet};
use crate::graph::{NewNode, VersionGraph, DEFAULT_BRANCH};
use crate::records::ArtifactIndex;
use crate::resolver::{CacheResolver, ResolveRequest, Resolution};
use crate::types::{
    ArtifactId, ArtifactRecord, BranchRecord, FailureMarker, NodeId, NodeStatus, ProjectId,
    ProjectMeta, VersionNode, SCHEMA_VERSION,
};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use reel_artifact::{ArtifactPayload, ArtifactType, ContentHash, InputText};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Optional parts of a saved artifact
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactExtras {
    pub preview: Option<Vec<u8>>,
    pub dependencies: Vec<ArtifactId>,
}

impl ArtifactExtras {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_preview(mut self, preview: impl Into<Vec<u8>>) -> Self {
        self.preview = Some(preview.into());
        self
    }

    #[must_use]
    pub fn with_preview_opt(mut self, preview: Option<Vec<u8>>) -> Self {
        self.preview = preview;
        self
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = ArtifactId>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }
}

#[derive(Debug)]
struct Inner {
    config: StoreConfig,
    layout: ProjectLayout,
    meta: RwLock<ProjectMeta>,
    graph: VersionGraph,
    content: ContentStore,
    records: ArtifactIndex,
    branches: BranchRegistry,
    pins: PinSet,
    gc_lock: Mutex<()>,
}

/// Handle on one project of a versioned artifact store
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    inner: Arc<Inner>,
}

impl ArtifactStore {
    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create a project whose root node holds `input_text`
    ///
    /// The root is an `Input` node, completed at creation, with `main`
    /// pointing at it.
    ///
    /// # Errors
    /// Returns `Config` for an invalid configuration, `StorageIO` if the
    /// project cannot be written
    pub fn create_project(config: StoreConfig, name: &str, input_text: &str) -> StoreResult<Self> {
        config.validate()?;
        let project_id = ProjectId::new();
        let layout = ProjectLayout::new(&config.root, project_id);
        layout.create_dirs()?;

        let graph = VersionGraph::new(project_id, layout.nodes_dir(), config.fsync);
        let root = graph.create_node(
            NewNode::root(ContentHash::of_str(input_text)).message("project created"),
        )?;

        let now = Utc::now();
        let meta = ProjectMeta {
            schema_version: SCHEMA_VERSION,
            id: project_id,
            name: name.to_string(),
            description: String::new(),
            root_node_id: root.id,
            created_at: now,
            updated_at: now,
        };

        let store = Self::assemble(config, layout, meta, graph)?;
        store.save_artifact(
            root.id,
            &ArtifactPayload::Input(InputText {
                text: input_text.to_string(),
                style: None,
            }),
            "source text",
        )?;
        store.write_meta()?;
        store
            .inner
            .branches
            .register(&store.inner.graph, DEFAULT_BRANCH, root.id)?;

        info!("Created project {} ({}) at {}", name, project_id, store.inner.layout.root().display());
        Ok(store)
    }

    /// Open an existing project
    ///
    /// Blob references are rebuilt from the artifact records, and nodes left
    /// `pending` or `generating` by a previous process are marked
    /// `failed(interrupted)`.
    ///
    /// # Errors
    /// - `NotFound` if the project does not exist
    /// - `SchemaVersion` if it was written by an incompatible version
    /// - `CorruptMetadata` if its metadata cannot be parsed
    pub fn open(config: StoreConfig, project_id: ProjectId) -> StoreResult<Self> {
        config.validate()?;
        let layout = ProjectLayout::new(&config.root, project_id);
        let path = layout.project_file();

        let raw: serde_json::Value = fs::read_json(&path, EntityKind::Project)?;
        let found = raw
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .map_or(0, |v| u32::try_from(v).unwrap_or(u32::MAX));
        if found != SCHEMA_VERSION {
            return Err(StoreError::SchemaVersion {
                path,
                found,
                expected: SCHEMA_VERSION,
            });
        }
        let meta: ProjectMeta = serde_json::from_value(raw).map_err(|e| StoreError::CorruptMetadata {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        if meta.id != project_id {
            return Err(StoreError::CorruptMetadata {
                path,
                reason: format!("project file belongs to {}", meta.id),
            });
        }

        let graph = VersionGraph::load(project_id, layout.nodes_dir(), config.fsync)?;
        if !graph.contains(meta.root_node_id) {
            return Err(StoreError::CorruptMetadata {
                path,
                reason: format!("root node {} is missing", meta.root_node_id),
            });
        }

        let store = Self::assemble(config, layout, meta, graph)?;
        store.inner.content.reconcile(&store.inner.records.live_refs())?;

        for node in store.inner.graph.in_flight() {
            store.inner.graph.fail(
                node.id,
                node.status,
                FailureMarker::Interrupted,
                "store reopened while the node was in flight",
            )?;
            warn!("Node {} was {} when the store closed; marked interrupted", node.id, node.status);
        }

        info!(
            "Opened project {} ({}) with {} nodes",
            store.project().name,
            project_id,
            store.inner.graph.len()
        );
        Ok(store)
    }

    /// Ids of every project under the configured root
    ///
    /// # Errors
    /// Returns `StorageIO` if the projects directory cannot be read
    pub fn list_projects(config: &StoreConfig) -> StoreResult<Vec<ProjectId>> {
        let dir = config.root.join("projects");
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                if entry.path().join("project.json").is_file() {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn assemble(config: StoreConfig, layout: ProjectLayout, meta: ProjectMeta, graph: VersionGraph) -> StoreResult<Self> {
        let content = ContentStore::open(layout.blobs_dir(), config.verify_on_read, config.fsync)?;
        let records = ArtifactIndex::load(layout.artifacts_dir(), config.fsync)?;
        let branches = BranchRegistry::load(layout.branches_dir(), config.fsync)?;
        let pins = PinSet::load(layout.pins_file(), config.fsync)?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                layout,
                meta: RwLock::new(meta),
                graph,
                content,
                records,
                branches,
                pins,
                gc_lock: Mutex::new(()),
            }),
        })
    }

    fn write_meta(&self) -> StoreResult<()> {
        let meta = self.inner.meta.read().clone();
        fs::write_json(&self.inner.layout.project_file(), &meta, self.inner.config.fsync)
    }

    // ------------------------------------------------------------------
    // Read handles
    // ------------------------------------------------------------------

    #[must_use]
    pub fn project(&self) -> ProjectMeta {
        self.inner.meta.read().clone()
    }

    #[inline]
    #[must_use]
    pub fn project_id(&self) -> ProjectId {
        self.inner.graph.project_id()
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    #[inline]
    #[must_use]
    pub fn graph(&self) -> &VersionGraph {
        &self.inner.graph
    }

    #[inline]
    #[must_use]
    pub fn content(&self) -> &ContentStore {
        &self.inner.content
    }

    #[inline]
    #[must_use]
    pub fn records(&self) -> &ArtifactIndex {
        &self.inner.records
    }

    /// Resolver bound to this store
    #[must_use]
    pub fn resolver(&self) -> CacheResolver {
        CacheResolver::new(self.clone())
    }

    /// Rename or describe the project
    ///
    /// # Errors
    /// Returns `StorageIO` if `project.json` cannot be written
    pub fn set_project_details(&self, name: &str, description: &str) -> StoreResult<ProjectMeta> {
        let mut meta = self.inner.meta.write();
        let mut next = meta.clone();
        next.name = name.to_string();
        next.description = description.to_string();
        next.updated_at = Utc::now();
        fs::write_json(&self.inner.layout.project_file(), &next, self.inner.config.fsync)?;
        *meta = next.clone();
        Ok(next)
    }

    /// # Errors
    /// Returns `NotFound` if the node does not exist
    pub fn node(&self, id: NodeId) -> StoreResult<VersionNode> {
        self.inner.graph.get(id)
    }

    /// Path from the root to `id`
    ///
    /// # Errors
    /// Returns `NotFound` if the node does not exist
    pub fn history(&self, id: NodeId) -> StoreResult<Vec<VersionNode>> {
        self.inner.graph.history(id)
    }

    /// # Errors
    /// Returns `NotFound` if the node does not exist
    pub fn children(&self, id: NodeId) -> StoreResult<Vec<VersionNode>> {
        self.inner.graph.children(id)
    }

    /// Every node in creation order
    #[must_use]
    pub fn nodes(&self) -> Vec<VersionNode> {
        self.inner.graph.list_nodes()
    }

    /// # Errors
    /// Returns `NotFound` if the record does not exist
    pub fn artifact_record(&self, id: ArtifactId) -> StoreResult<ArtifactRecord> {
        self.inner.records.get(id)
    }

    // ------------------------------------------------------------------
    // Artifacts
    // ------------------------------------------------------------------

    /// Store a typed payload as the result of `node_id` and complete it
    ///
    /// # Errors
    /// See [`save_encoded`](Self::save_encoded)
    pub fn save_artifact(&self, node_id: NodeId, payload: &ArtifactPayload, summary: &str) -> StoreResult<ArtifactRecord> {
        self.save_artifact_with(node_id, payload, summary, ArtifactExtras::default())
    }

    /// [`save_artifact`](Self::save_artifact) with a preview and dependencies
    ///
    /// # Errors
    /// See [`save_encoded`](Self::save_encoded)
    pub fn save_artifact_with(
        &self,
        node_id: NodeId,
        payload: &ArtifactPayload,
        summary: &str,
        extras: ArtifactExtras,
    ) -> StoreResult<ArtifactRecord> {
        let bytes = payload.encode()?;
        self.save_encoded(node_id, payload.artifact_type(), bytes, summary.to_string(), extras)
    }

    /// Store encoded payload bytes as the result of `node_id` and complete it
    ///
    /// The node must be `generating`, or `pending` (claimed here). Nothing is
    /// written unless the bytes decode as `artifact_type`. A failure while
    /// writing leaves the node `failed(error)`.
    ///
    /// # Errors
    /// - `Payload` if the bytes do not decode
    /// - `InvalidState` if the type does not match the node's stage or the
    ///   node is already terminal
    /// - `NotFound` for an unknown node or dependency
    /// - `ConcurrentModification` if another caller moved the node meanwhile
    pub fn save_encoded(
        &self,
        node_id: NodeId,
        artifact_type: ArtifactType,
        bytes: Vec<u8>,
        summary: String,
        extras: ArtifactExtras,
    ) -> StoreResult<ArtifactRecord> {
        let graph = &self.inner.graph;
        let node = graph.get(node_id)?;
        let expected = node.stage.output_type();
        if artifact_type != expected {
            return Err(StoreError::invalid(format!(
                "stage {} produces {expected}, not {artifact_type}",
                node.stage
            )));
        }
        ArtifactPayload::decode(artifact_type, &bytes)?;
        for dependency in &extras.dependencies {
            self.inner.records.get(*dependency)?;
        }

        match node.status {
            NodeStatus::Pending => {
                graph.transition(node_id, NodeStatus::Pending, NodeStatus::Generating)?;
            }
            NodeStatus::Generating => {}
            status => {
                return Err(StoreError::invalid(format!("node {node_id} is already {status}")));
            }
        }

        match self.write_artifact(&node, artifact_type, &bytes, summary, extras) {
            Ok(record) => {
                debug!(
                    "Saved {} artifact {} on node {}",
                    artifact_type,
                    record.content_hash.short(),
                    node_id
                );
                Ok(record)
            }
            Err(e) => {
                if let Err(fail_err) =
                    graph.fail(node_id, NodeStatus::Generating, FailureMarker::Error, &e.to_string())
                {
                    warn!("Could not mark node {} failed after save error: {}", node_id, fail_err);
                }
                Err(e)
            }
        }
    }

    /// Blob, record and completion of a node already claimed as `generating`
    fn write_artifact(
        &self,
        node: &VersionNode,
        artifact_type: ArtifactType,
        bytes: &[u8],
        summary: String,
        extras: ArtifactExtras,
    ) -> StoreResult<ArtifactRecord> {
        let content = &self.inner.content;
        let content_hash = content.put(bytes)?;
        let preview_ref = extras.preview.as_deref().map(|p| content.put(p)).transpose()?;

        let record = ArtifactRecord {
            id: ArtifactId::new(),
            node_id: node.id,
            stage: node.stage,
            artifact_type,
            content_hash,
            size: bytes.len() as u64,
            summary,
            dependencies: extras.dependencies,
            preview_ref,
            created_at: Utc::now(),
            reclaimed_at: None,
        };
        self.attach(&record)?;
        self.inner.graph.complete(node.id, record.id, content_hash)?;
        Ok(record)
    }

    fn attach(&self, record: &ArtifactRecord) -> StoreResult<()> {
        self.inner.records.insert(record.clone())?;
        for hash in record.blob_refs() {
            self.inner.content.add_ref(&hash, record.id)?;
        }
        Ok(())
    }

    /// Record of a completed node, if its artifact is still stored
    pub(crate) fn completed_record(&self, node: &VersionNode) -> StoreResult<ArtifactRecord> {
        if node.status != NodeStatus::Completed {
            return Err(StoreError::invalid(format!(
                "node {} is {}, not completed",
                node.id, node.status
            )));
        }
        let artifact_id = node
            .artifact_id
            .ok_or_else(|| StoreError::not_found(EntityKind::Artifact, format!("artifact of node {}", node.id)))?;
        let record = self.inner.records.get(artifact_id)?;
        if record.is_reclaimed() {
            return Err(StoreError::not_found(
                EntityKind::Artifact,
                format!("{artifact_id} (reclaimed)"),
            ));
        }
        if Some(record.content_hash) != node.artifact_ref {
            return Err(StoreError::CorruptMetadata {
                path: self.inner.layout.node_file(node.id),
                reason: format!("artifact_ref disagrees with record {artifact_id}"),
            });
        }
        Ok(record)
    }

    /// Whether a node found by cache key may be handed out again
    pub(crate) fn is_reusable(&self, node: &VersionNode) -> bool {
        match node.status {
            NodeStatus::Completed => node
                .artifact_id
                .and_then(|id| self.inner.records.get(id).ok())
                .is_some_and(|r| !r.is_reclaimed()),
            NodeStatus::Pending | NodeStatus::Generating => true,
            NodeStatus::Failed => false,
        }
    }

    /// Raw payload bytes and record of a completed node
    ///
    /// # Errors
    /// - `InvalidState` if the node is not completed
    /// - `NotFound` if the node is unknown or its artifact was reclaimed
    /// - `HashMismatch` if the blob is corrupt
    pub fn get_artifact_bytes(&self, node_id: NodeId) -> StoreResult<(Vec<u8>, ArtifactRecord)> {
        let node = self.inner.graph.get(node_id)?;
        let record = self.completed_record(&node)?;
        let bytes = self.inner.content.get(&record.content_hash)?;
        Ok((bytes, record))
    }

    /// Decoded payload and record of a completed node
    ///
    /// # Errors
    /// Same as [`get_artifact_bytes`](Self::get_artifact_bytes), plus
    /// `Payload` if the stored bytes no longer decode
    pub fn get_artifact(&self, node_id: NodeId) -> StoreResult<(ArtifactPayload, ArtifactRecord)> {
        let (bytes, record) = self.get_artifact_bytes(node_id)?;
        let payload = ArtifactPayload::decode(record.artifact_type, &bytes)?;
        Ok((payload, record))
    }

    /// Preview bytes of a completed node, if it has one
    ///
    /// # Errors
    /// Same as [`get_artifact_bytes`](Self::get_artifact_bytes)
    pub fn preview(&self, node_id: NodeId) -> StoreResult<Option<Vec<u8>>> {
        let node = self.inner.graph.get(node_id)?;
        let record = self.completed_record(&node)?;
        record
            .preview_ref
            .map(|hash| self.inner.content.get(&hash))
            .transpose()
    }

    // ------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------

    /// Run `executor` for `request` through the cache resolver
    ///
    /// With `advance_branch`, the request's branch (default: the parent's)
    /// moves to the resulting node when that node descends from its head;
    /// a missing branch is registered there if the parent is on live history.
    ///
    /// # Errors
    /// See [`CacheResolver::resolve_with`]
    #[tracing::instrument(skip(self, request, executor), fields(parent = %request.parent, stage = %request.stage))]
    pub async fn produce<E>(&self, request: ResolveRequest, executor: &E) -> StoreResult<Resolution>
    where
        E: StageExecutor + ?Sized,
    {
        let advance = request.advance_branch;
        let branch = match &request.branch {
            Some(name) => name.clone(),
            None => self.inner.graph.get(request.parent)?.branch_name,
        };

        let resolution = self
            .resolver()
            .resolve_with(request, |ctx| executor.execute(ctx))
            .await?;

        if advance {
            if let Some(resolved) = resolution.artifact() {
                self.advance_branch(&branch, resolved.node.id)?;
            }
        }
        Ok(resolution)
    }

    fn advance_branch(&self, name: &str, node: NodeId) -> StoreResult<()> {
        let branches = &self.inner.branches;
        if branches.contains(name) {
            let head = branches.get_head(name)?;
            if !self.inner.graph.is_ancestor(head, node)? {
                debug!("Not advancing {}: node {} does not descend from head {}", name, node, head);
                return Ok(());
            }
        }
        match branches.set_head(&self.inner.graph, name, node, &self.inner.pins.list()) {
            Ok(_) => Ok(()),
            Err(StoreError::InvalidState(reason)) => {
                debug!("Not advancing {}: {}", name, reason);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Branches
    // ------------------------------------------------------------------

    /// Fork `name` off completed node `from`
    ///
    /// The new node is a child of `from` repeating its stage and input
    /// hash, with its own artifact record on the same blob.
    ///
    /// # Errors
    /// - `InvalidState` for a bad or taken name, or a source that is not completed
    /// - `NotFound` if the source or its artifact is gone
    pub fn create_branch(&self, from: NodeId, name: &str, message: &str) -> StoreResult<VersionNode> {
        validate_branch_name(name)?;
        if self.inner.branches.contains(name) {
            return Err(StoreError::invalid(format!("branch {name} already exists")));
        }
        let graph = &self.inner.graph;
        let source = graph.get(from)?;
        let source_record = self.completed_record(&source)?;

        let node = graph.create_node(
            NewNode::child(from, source.stage, source.input_hash)
                .on_branch(name)
                .message(message),
        )?;
        graph.transition(node.id, NodeStatus::Pending, NodeStatus::Generating)?;
        let record = ArtifactRecord {
            id: ArtifactId::new(),
            node_id: node.id,
            dependencies: vec![source_record.id],
            created_at: Utc::now(),
            reclaimed_at: None,
            ..source_record
        };
        self.attach(&record)?;
        let node = graph.complete(node.id, record.id, record.content_hash)?;
        self.inner.branches.register(graph, name, node.id)?;

        info!("Created branch {} at node {} (from {})", name, node.id, from);
        Ok(node)
    }

    /// # Errors
    /// Returns `NotFound` for an unknown branch
    pub fn head(&self, branch: &str) -> StoreResult<NodeId> {
        self.inner.branches.get_head(branch)
    }

    /// Move a branch head forward, or register a new branch at `node`
    ///
    /// A new branch must start at a node whose parent is on the history of
    /// an existing branch head or pin.
    ///
    /// # Errors
    /// - `InvalidState` if `node` is not completed, does not descend from
    ///   the current head, or would start a branch off dead history
    /// - `NotFound` if `node` or its artifact is gone
    pub fn set_head(&self, branch: &str, node: NodeId) -> StoreResult<BranchRecord> {
        let target = self.inner.graph.get(node)?;
        self.completed_record(&target)?;
        self.inner
            .branches
            .set_head(&self.inner.graph, branch, node, &self.inner.pins.list())
    }

    /// Remove a branch pointer; nodes stay
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown branch
    pub fn delete_branch(&self, branch: &str) -> StoreResult<BranchRecord> {
        self.inner.branches.delete(branch)
    }

    /// Every branch, sorted by name
    #[must_use]
    pub fn branches(&self) -> Vec<BranchRecord> {
        self.inner.branches.list()
    }

    /// History of a branch head
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown branch
    pub fn branch_history(&self, branch: &str) -> StoreResult<Vec<VersionNode>> {
        self.history(self.head(branch)?)
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Keep `node` and its ancestors alive across garbage collection
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown node
    pub fn pin(&self, node: NodeId) -> StoreResult<bool> {
        self.inner.graph.get(node)?;
        self.inner.pins.insert(node)
    }

    /// # Errors
    /// Returns `StorageIO` if `pins.json` cannot be written
    pub fn unpin(&self, node: NodeId) -> StoreResult<bool> {
        self.inner.pins.remove(node)
    }

    #[must_use]
    pub fn pinned(&self) -> Vec<NodeId> {
        self.inner.pins.list()
    }

    /// Reclaim artifacts of nodes no branch head, pin or in-flight node reaches
    ///
    /// # Errors
    /// Returns `StorageIO` on filesystem failure; the run can be repeated
    #[tracing::instrument(skip(self), fields(project = %self.project_id()))]
    pub fn collect_garbage(&self) -> StoreResult<GcReport> {
        let _running = self.inner.gc_lock.lock();
        GarbageCollector {
            graph: &self.inner.graph,
            records: &self.inner.records,
            content: &self.inner.content,
            branches: &self.inner.branches,
            pins: &self.inner.pins,
            grace: self.inner.config.gc_grace,
        }
        .run()
    }
}
