//! Store configuration
//!
//! Built in code with the `with_*` methods or loaded from TOML:
//!
//! ```toml
//! root = "/var/lib/reel"
//! verify_on_read = true
//! wait_timeout_secs = 600
//! gc_grace_secs = 600
//! fsync = true
//! ```

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for an [`ArtifactStore`](crate::ArtifactStore)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory holding `projects/<project_id>/...`
    pub root: PathBuf,
    /// Re-hash blobs on every read and fail on mismatch
    pub verify_on_read: bool,
    /// Default time a caller waits on another caller's computation
    #[serde(rename = "wait_timeout_secs", with = "secs")]
    pub wait_timeout: Duration,
    /// Minimum age before garbage collection reclaims unreferenced data
    #[serde(rename = "gc_grace_secs", with = "secs")]
    pub gc_grace: Duration,
    /// Flush files and directories before renaming them into place
    pub fsync: bool,
}

impl StoreConfig {
    /// Default configuration rooted at `root`
    #[inline]
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// With read verification on or off
    #[inline]
    #[must_use]
    pub fn with_verify_on_read(mut self, verify: bool) -> Self {
        self.verify_on_read = verify;
        self
    }

    /// With default wait timeout
    #[inline]
    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// With garbage collection grace period
    #[inline]
    #[must_use]
    pub fn with_gc_grace(mut self, grace: Duration) -> Self {
        self.gc_grace = grace;
        self
    }

    /// With fsync on or off
    #[inline]
    #[must_use]
    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    /// Parse TOML text
    ///
    /// # Errors
    /// Returns [`StoreError::Config`] on malformed input or unknown keys
    pub fn from_toml_str(text: &str) -> StoreResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    ///
    /// # Errors
    /// Returns [`StoreError::StorageIO`] if unreadable, [`StoreError::Config`] if invalid
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    /// Reject configurations the store cannot run with
    ///
    /// # Errors
    /// Returns [`StoreError::Config`] describing the first problem found
    pub fn validate(&self) -> StoreResult<()> {
        if self.root.as_os_str().is_empty() {
            return Err(StoreError::Config("root must not be empty".into()));
        }
        if self.wait_timeout.is_zero() {
            return Err(StoreError::Config("wait_timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("reel-data"),
            verify_on_read: true,
            wait_timeout: Duration::from_secs(600),
            gc_grace: Duration::from_secs(600),
            fsync: true,
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
