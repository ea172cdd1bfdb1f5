//! Production stages
//!
//! The pipeline runs stages in a fixed order. A node's stage may never precede
//! its parent's stage, although a branch may repeat the same stage.

use crate::payload::ArtifactType;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// One step of the production pipeline, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Source text supplied by the user
    Input,
    /// Screenplay generation
    Script,
    /// Per-scene visual descriptions
    Description,
    /// Still image synthesis
    Image,
    /// Shot layout and timing
    Storyboard,
    /// Animated clips
    Animation,
    /// Dialogue, effects and music
    Audio,
    /// Captions and text overlays
    Subtitle,
    /// Final composition render
    Compose,
    /// Delivery encode
    Output,
}

impl Stage {
    /// Every stage, in pipeline order
    pub const ALL: [Stage; 10] = [
        Stage::Input,
        Stage::Script,
        Stage::Description,
        Stage::Image,
        Stage::Storyboard,
        Stage::Animation,
        Stage::Audio,
        Stage::Subtitle,
        Stage::Compose,
        Stage::Output,
    ];

    /// Position in the pipeline, starting at 0 for [`Stage::Input`]
    #[inline]
    #[must_use]
    pub const fn ordinal(self) -> u32 {
        self as u32
    }

    /// Stage at a pipeline position
    #[must_use]
    pub fn from_ordinal(ordinal: u32) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    /// The stage that normally follows this one
    #[must_use]
    pub fn next(self) -> Option<Self> {
        Self::from_ordinal(self.ordinal() + 1)
    }

    /// Whether a node at `self` may be the child of a node at `parent`
    #[inline]
    #[must_use]
    pub fn may_follow(self, parent: Stage) -> bool {
        self >= parent
    }

    /// Payload shape produced by this stage
    #[must_use]
    pub const fn output_type(self) -> ArtifactType {
        match self {
            Stage::Input => ArtifactType::Input,
            Stage::Script => ArtifactType::Script,
            Stage::Description => ArtifactType::SceneDescription,
            Stage::Image => ArtifactType::ImageReference,
            Stage::Storyboard => ArtifactType::Timeline,
            Stage::Audio => ArtifactType::AudioTrack,
            Stage::Subtitle => ArtifactType::TextOverlay,
            Stage::Animation | Stage::Compose | Stage::Output => ArtifactType::RenderedVideo,
        }
    }

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Stage::Input => "input",
            Stage::Script => "script",
            Stage::Description => "description",
            Stage::Image => "image",
            Stage::Storyboard => "storyboard",
            Stage::Animation => "animation",
            Stage::Audio => "audio",
            Stage::Subtitle => "subtitle",
            Stage::Compose => "compose",
            Stage::Output => "output",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

/// Returned when parsing an unrecognised stage name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage: {0}")]
pub struct UnknownStage(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_follow_pipeline_order() {
        for (i, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.ordinal() as usize, i);
            assert_eq!(Stage::from_ordinal(i as u32), Some(*stage));
        }
        assert_eq!(Stage::from_ordinal(10), None);
    }

    #[test]
    fn next_walks_the_pipeline() {
        assert_eq!(Stage::Input.next(), Some(Stage::Script));
        assert_eq!(Stage::Compose.next(), Some(Stage::Output));
        assert_eq!(Stage::Output.next(), None);
    }

    #[test]
    fn may_follow_allows_repeats_but_not_regressions() {
        assert!(Stage::Script.may_follow(Stage::Input));
        assert!(Stage::Script.may_follow(Stage::Script));
        assert!(Stage::Output.may_follow(Stage::Input));
        assert!(!Stage::Input.may_follow(Stage::Script));
    }

    #[test]
    fn names_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(stage.to_string().parse::<Stage>().unwrap(), stage);
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{}\"", stage.as_str()));
        }
        assert_eq!("voiceover".parse::<Stage>(), Err(UnknownStage("voiceover".into())));
    }

    #[test]
    fn output_types() {
        assert_eq!(Stage::Script.output_type(), ArtifactType::Script);
        assert_eq!(Stage::Storyboard.output_type(), ArtifactType::Timeline);
        assert_eq!(Stage::Compose.output_type(), ArtifactType::RenderedVideo);
    }
}
