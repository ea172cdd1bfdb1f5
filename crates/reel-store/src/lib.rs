//! Reel Store - versioned artifact storage
//!
//! Persists every intermediate result of a staged media pipeline so that:
//! - Identical work at the same pipeline position is never recomputed
//! - Alternatives live side by side as branches of one history tree
//! - Identical bytes are stored once, whatever branch produced them
//! - Unreachable content is reclaimed without touching live data
//!
//! # Example
//!
//! ```rust,no_run
//! use reel_artifact::{ArtifactPayload, ContentHash, Script, Stage};
//! use reel_store::{ArtifactStore, StageOutput, StoreConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StoreConfig::new("/var/lib/reel");
//! let store = ArtifactStore::create_project(config, "Tide", "A keeper waits for a ship")?;
//! let root = store.project().root_node_id;
//!
//! let resolution = store
//!     .resolver()
//!     .resolve_or_compute(root, Stage::Script, ContentHash::of_str("v1"), |_ctx| async {
//!         let script = ArtifactPayload::Script(Script::default());
//!         let output = StageOutput::from_payload(&script, "first draft")?;
//!         Ok::<_, anyhow::Error>(output)
//!     })
//!     .await?;
//!
//! assert!(resolution.is_computed());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod branch;
pub mod config;
pub mod content;
pub mod error;
pub mod executor;
mod fs;
mod locks;
pub mod gc;
pub mod graph;
pub mod records;
pub mod resolver;
pub mod store;
pub mod types;

pub use branch::{validate_branch_name, BranchRegistry};
pub use config::StoreConfig;
pub use content::{ContentStore, SweepOutcome};
pub use error::{EntityKind, StoreError, StoreResult};
pub use executor::{StageContext, StageExecutor, StageOutput, StoreView};
pub use gc::{GcReport, PinSet};
pub use graph::{NewNode, VersionGraph, DEFAULT_BRANCH};
pub use records::ArtifactIndex;
pub use resolver::{CacheResolver, ComputeFailure, Resolution, ResolveRequest, ResolvedArtifact};
pub use store::{ArtifactExtras, ArtifactStore};
pub use types::{
    ArtifactId, ArtifactRecord, BranchRecord, CacheKey, FailureMarker, NodeId, NodeStatus,
    ProjectId, ProjectMeta, VersionNode, ERROR_KEY, FAILURE_KEY, SCHEMA_VERSION,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
