//! Typed artifact payloads
//!
//! Each stage emits one payload shape. [`ArtifactPayload`] is the tagged union
//! of all of them; the blob pool only ever sees the encoded bytes of the inner
//! schema, and [`ArtifactType`] says how to decode them again.
//!
//! Encoding is JSON with struct fields in declaration order and maps as
//! `BTreeMap`, so equal payloads always encode to equal bytes and dedup works.

use crate::hash::ContentHash;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Tag identifying a payload schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Input,
    Script,
    SceneDescription,
    ImageReference,
    Timeline,
    AudioTrack,
    TextOverlay,
    RenderedVideo,
}

impl ArtifactType {
    /// Stable identifier, used in records and logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ArtifactType::Input => "input",
            ArtifactType::Script => "script",
            ArtifactType::SceneDescription => "scene_description",
            ArtifactType::ImageReference => "image_reference",
            ArtifactType::Timeline => "timeline",
            ArtifactType::AudioTrack => "audio_track",
            ArtifactType::TextOverlay => "text_overlay",
            ArtifactType::RenderedVideo => "rendered_video",
        }
    }

    const ALL: [ArtifactType; 8] = [
        ArtifactType::Input,
        ArtifactType::Script,
        ArtifactType::SceneDescription,
        ArtifactType::ImageReference,
        ArtifactType::Timeline,
        ArtifactType::AudioTrack,
        ArtifactType::TextOverlay,
        ArtifactType::RenderedVideo,
    ];
}

impl Display for ArtifactType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| PayloadError::UnknownType(s.to_string()))
    }
}

/// Payload of any stage, tagged by its [`ArtifactType`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "artifact_type", content = "data", rename_all = "snake_case")]
pub enum ArtifactPayload {
    Input(InputText),
    Script(Script),
    SceneDescription(SceneDescription),
    ImageReference(ImageReference),
    Timeline(Timeline),
    AudioTrack(AudioTrack),
    TextOverlay(TextOverlay),
    RenderedVideo(RenderedVideo),
}

impl ArtifactPayload {
    /// Schema tag of this payload
    #[must_use]
    pub const fn artifact_type(&self) -> ArtifactType {
        match self {
            ArtifactPayload::Input(_) => ArtifactType::Input,
            ArtifactPayload::Script(_) => ArtifactType::Script,
            ArtifactPayload::SceneDescription(_) => ArtifactType::SceneDescription,
            ArtifactPayload::ImageReference(_) => ArtifactType::ImageReference,
            ArtifactPayload::Timeline(_) => ArtifactType::Timeline,
            ArtifactPayload::AudioTrack(_) => ArtifactType::AudioTrack,
            ArtifactPayload::TextOverlay(_) => ArtifactType::TextOverlay,
            ArtifactPayload::RenderedVideo(_) => ArtifactType::RenderedVideo,
        }
    }

    /// Encode the inner schema to bytes
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let bytes = match self {
            ArtifactPayload::Input(p) => serde_json::to_vec(p),
            ArtifactPayload::Script(p) => serde_json::to_vec(p),
            ArtifactPayload::SceneDescription(p) => serde_json::to_vec(p),
            ArtifactPayload::ImageReference(p) => serde_json::to_vec(p),
            ArtifactPayload::Timeline(p) => serde_json::to_vec(p),
            ArtifactPayload::AudioTrack(p) => serde_json::to_vec(p),
            ArtifactPayload::TextOverlay(p) => serde_json::to_vec(p),
            ArtifactPayload::RenderedVideo(p) => serde_json::to_vec(p),
        };
        bytes.map_err(|source| PayloadError::Encode {
            artifact_type: self.artifact_type(),
            source,
        })
    }

    /// Content hash of the encoded payload
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn content_hash(&self) -> Result<ContentHash, PayloadError> {
        Ok(ContentHash::compute(&self.encode()?))
    }

    /// Decode bytes according to a schema tag
    ///
    /// # Errors
    /// Returns [`PayloadError::Decode`] if the bytes do not match the schema
    pub fn decode(artifact_type: ArtifactType, bytes: &[u8]) -> Result<Self, PayloadError> {
        Ok(match artifact_type {
            ArtifactType::Input => ArtifactPayload::Input(decode_as(artifact_type, bytes)?),
            ArtifactType::Script => ArtifactPayload::Script(decode_as(artifact_type, bytes)?),
            ArtifactType::SceneDescription => {
                ArtifactPayload::SceneDescription(decode_as(artifact_type, bytes)?)
            }
            ArtifactType::ImageReference => {
                ArtifactPayload::ImageReference(decode_as(artifact_type, bytes)?)
            }
            ArtifactType::Timeline => ArtifactPayload::Timeline(decode_as(artifact_type, bytes)?),
            ArtifactType::AudioTrack => {
                ArtifactPayload::AudioTrack(decode_as(artifact_type, bytes)?)
            }
            ArtifactType::TextOverlay => {
                ArtifactPayload::TextOverlay(decode_as(artifact_type, bytes)?)
            }
            ArtifactType::RenderedVideo => {
                ArtifactPayload::RenderedVideo(decode_as(artifact_type, bytes)?)
            }
        })
    }
}

fn decode_as<T: DeserializeOwned>(artifact_type: ArtifactType, bytes: &[u8]) -> Result<T, PayloadError> {
    serde_json::from_slice(bytes).map_err(|source| PayloadError::Decode {
        artifact_type,
        source,
    })
}

/// Errors from encoding or decoding payloads
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// Bytes do not match the declared schema
    #[error("payload is not a valid {artifact_type}: {source}")]
    Decode {
        artifact_type: ArtifactType,
        #[source]
        source: serde_json::Error,
    },

    /// Serialization failed
    #[error("failed to encode {artifact_type} payload: {source}")]
    Encode {
        artifact_type: ArtifactType,
        #[source]
        source: serde_json::Error,
    },

    /// Unrecognised type tag
    #[error("unknown artifact type: {0}")]
    UnknownType(String),
}

// ---------------------------------------------------------------------------
// Stage schemas
// ---------------------------------------------------------------------------

/// User-supplied source text (root of every project)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputText {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

/// Screenplay
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Script {
    pub title: String,
    pub premise: String,
    #[serde(default)]
    pub theme: String,
    #[serde(default)]
    pub scenes: Vec<ScriptScene>,
    /// Keyed by character id
    #[serde(default)]
    pub characters: BTreeMap<String, Character>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptScene {
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub elements: Vec<SceneElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SceneElement {
    Dialogue { character_id: String, text: String },
    Action { description: String },
    Narration { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
}

/// Visual description for each scene
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SceneDescription {
    pub scenes: Vec<SceneVisual>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneVisual {
    pub scene_order: u32,
    pub visual_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atmosphere: Option<String>,
    #[serde(default)]
    pub characters: Vec<String>,
}

/// Generated stills, referenced by location rather than embedded
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageReference {
    pub images: Vec<ImageRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub scene_order: u32,
    pub uri: String,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Shot list with timing
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Timeline {
    pub shots: Vec<Shot>,
}

impl Timeline {
    /// End time of the last shot, in seconds
    #[must_use]
    pub fn duration_secs(&self) -> f64 {
        self.shots
            .iter()
            .map(|s| s.start_secs + s.duration_secs)
            .fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shot {
    pub id: String,
    pub scene_order: u32,
    pub start_secs: f64,
    pub duration_secs: f64,
    pub shot_size: ShotSize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_movement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_uri: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotSize {
    ExtremeLong,
    Long,
    Full,
    Medium,
    CloseUp,
    ExtremeCloseUp,
}

/// Mixed audio clips
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AudioTrack {
    pub clips: Vec<AudioClip>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioClip {
    pub id: String,
    pub kind: AudioKind,
    pub start_secs: f64,
    pub end_secs: f64,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<String>,
    #[serde(default = "unit_volume")]
    pub volume: f64,
}

fn unit_volume() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioKind {
    Dialogue,
    Effect,
    Music,
}

/// Captions and titles burned over the video
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TextOverlay {
    pub captions: Vec<Caption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Caption {
    pub start_secs: f64,
    pub end_secs: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

/// A rendered video file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedVideo {
    pub uri: String,
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: String,
}
