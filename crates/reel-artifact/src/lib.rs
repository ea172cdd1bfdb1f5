//! Reel Artifact Model
//!
//! Content hashes, production stages and typed payloads shared by the
//! versioned store and the stage executors that feed it.
//!
//! # Core Concepts
//!
//! - [`ContentHash`]: 32-byte Blake3 digest used for content addressing
//! - [`Fingerprint`]: builder for the input hash of a stage invocation
//! - [`Stage`]: ordered enumeration of pipeline stages
//! - [`ArtifactPayload`]: one schema per stage output, tagged by [`ArtifactType`]
//!
//! # Example
//!
//! ```rust
//! use reel_artifact::{ArtifactPayload, ArtifactType, InputText, Stage};
//!
//! let payload = ArtifactPayload::Input(InputText { text: "hello".into(), style: None });
//! let bytes = payload.encode().unwrap();
//! assert_eq!(Stage::Input.output_type(), ArtifactType::Input);
//! assert_eq!(ArtifactPayload::decode(ArtifactType::Input, &bytes).unwrap(), payload);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod hash;
mod payload;
mod stage;

pub use hash::{ContentHash, Fingerprint, HashError};
pub use payload::{
    ArtifactPayload, ArtifactType, AudioClip, AudioKind, AudioTrack, Caption, Character,
    ImageRef, ImageReference, InputText, PayloadError, RenderedVideo, SceneDescription,
    SceneElement, SceneVisual, Script, ScriptScene, Shot, ShotSize, TextOverlay, Timeline,
};
pub use stage::{Stage, UnknownStage};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
