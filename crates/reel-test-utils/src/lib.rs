//! Testing utilities for Reel workspace
//!
//! Shared fixtures: temp-dir stores, sample payloads for every stage and
//! scripted stage executors.

#![allow(missing_docs)]

use reel_artifact::{
    ArtifactPayload, ArtifactType, AudioClip, AudioKind, AudioTrack, Caption, Character,
    ContentHash, ImageRef, ImageReference, RenderedVideo, SceneDescription, SceneElement,
    SceneVisual, Script, ScriptScene, Shot, ShotSize, Stage, TextOverlay, Timeline,
};
use reel_store::{
    ArtifactStore, NewNode, NodeId, StageContext, StageExecutor, StageOutput, StoreConfig,
    VersionNode,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Install a `tracing` subscriber honouring `RUST_LOG`; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config for tests: no fsync, no GC grace, short waits
pub fn test_config(root: &std::path::Path) -> StoreConfig {
    StoreConfig::new(root)
        .with_fsync(false)
        .with_gc_grace(Duration::ZERO)
        .with_wait_timeout(Duration::from_secs(10))
}

/// A store in a temp directory, removed on drop
pub struct TestStore {
    pub dir: TempDir,
    pub store: ArtifactStore,
}

impl TestStore {
    pub fn new() -> Self {
        Self::with_input("A lighthouse keeper waits for a ship that never comes.")
    }

    pub fn with_input(text: &str) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::create_project(test_config(dir.path()), "test", text).unwrap();
        Self { dir, store }
    }

    pub fn config(&self) -> StoreConfig {
        test_config(self.dir.path())
    }

    pub fn root(&self) -> NodeId {
        self.store.project().root_node_id
    }

    /// Open the same project again, as a restarted process would
    pub fn reopen(&self) -> ArtifactStore {
        ArtifactStore::open(self.config(), self.store.project_id()).unwrap()
    }

    /// Child of `parent` at `stage`, completed with [`payload_for`]`(stage, seed)`
    pub fn completed_child(&self, parent: NodeId, stage: Stage, seed: &str) -> VersionNode {
        let node = self
            .store
            .graph()
            .create_node(NewNode::child(parent, stage, ContentHash::of_str(seed)))
            .unwrap();
        self.store
            .save_artifact(node.id, &payload_for(stage, seed), seed)
            .unwrap();
        self.store.node(node.id).unwrap()
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestStore {
    type Target = ArtifactStore;

    fn deref(&self) -> &ArtifactStore {
        &self.store
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

pub fn sample_script(seed: &str) -> Script {
    let mut characters = BTreeMap::new();
    characters.insert(
        "mira".to_string(),
        Character {
            name: "Mira".into(),
            description: "keeper of the light".into(),
            voice_id: None,
        },
    );
    Script {
        title: format!("Tide {seed}"),
        premise: "A keeper waits for a ship".into(),
        theme: "patience".into(),
        scenes: vec![ScriptScene {
            order: 1,
            title: Some("Dusk".into()),
            location: Some("lighthouse".into()),
            elements: vec![
                SceneElement::Action {
                    description: "Mira lights the lamp".into(),
                },
                SceneElement::Dialogue {
                    character_id: "mira".into(),
                    text: seed.to_string(),
                },
            ],
        }],
        characters,
    }
}

pub fn sample_description(seed: &str) -> SceneDescription {
    SceneDescription {
        scenes: vec![SceneVisual {
            scene_order: 1,
            visual_prompt: format!("lighthouse at dusk, {seed}"),
            atmosphere: Some("calm".into()),
            characters: vec!["mira".into()],
        }],
    }
}

pub fn sample_images(seed: &str) -> ImageReference {
    ImageReference {
        images: vec![ImageRef {
            scene_order: 1,
            uri: format!("file:///frames/{seed}.png"),
            width: 1920,
            height: 1080,
            prompt: None,
        }],
    }
}

pub fn sample_timeline(seed: &str) -> Timeline {
    Timeline {
        shots: vec![Shot {
            id: format!("shot-{seed}"),
            scene_order: 1,
            start_secs: 0.0,
            duration_secs: 4.0,
            shot_size: ShotSize::Long,
            camera_movement: Some("pan".into()),
            transition_in: None,
            image_uri: None,
        }],
    }
}

pub fn sample_audio(seed: &str) -> AudioTrack {
    AudioTrack {
        clips: vec![AudioClip {
            id: format!("clip-{seed}"),
            kind: AudioKind::Dialogue,
            start_secs: 0.5,
            end_secs: 3.0,
            uri: format!("file:///audio/{seed}.wav"),
            text: Some(seed.to_string()),
            character_id: Some("mira".into()),
            volume: 1.0,
        }],
    }
}

pub fn sample_overlay(seed: &str) -> TextOverlay {
    TextOverlay {
        captions: vec![Caption {
            start_secs: 0.5,
            end_secs: 3.0,
            text: seed.to_string(),
            position: None,
        }],
    }
}

pub fn sample_video(seed: &str) -> RenderedVideo {
    RenderedVideo {
        uri: format!("file:///renders/{seed}.mp4"),
        duration_secs: 4.0,
        width: 1920,
        height: 1080,
        fps: 24,
        codec: "h264".into(),
    }
}

/// A payload of the type `stage` produces; different seeds give different bytes
pub fn payload_for(stage: Stage, seed: &str) -> ArtifactPayload {
    match stage.output_type() {
        ArtifactType::Input => ArtifactPayload::Input(reel_artifact::InputText {
            text: seed.to_string(),
            style: None,
        }),
        ArtifactType::Script => ArtifactPayload::Script(sample_script(seed)),
        ArtifactType::SceneDescription => ArtifactPayload::SceneDescription(sample_description(seed)),
        ArtifactType::ImageReference => ArtifactPayload::ImageReference(sample_images(seed)),
        ArtifactType::Timeline => ArtifactPayload::Timeline(sample_timeline(seed)),
        ArtifactType::AudioTrack => ArtifactPayload::AudioTrack(sample_audio(seed)),
        ArtifactType::TextOverlay => ArtifactPayload::TextOverlay(sample_overlay(seed)),
        ArtifactType::RenderedVideo => ArtifactPayload::RenderedVideo(sample_video(seed)),
    }
}

// ---------------------------------------------------------------------------
// Executors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Behaviour {
    /// Return [`payload_for`] the context's stage
    Payload(String),
    /// Return these bytes verbatim
    Bytes(Vec<u8>),
    /// Return an error with this message
    Fail(String),
}

/// Scripted executor that counts its invocations
#[derive(Debug)]
pub struct CountingExecutor {
    calls: AtomicUsize,
    delay: Duration,
    behaviour: Behaviour,
}

impl CountingExecutor {
    /// Succeeds with [`payload_for`]`(stage, seed)`
    pub fn new(seed: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            behaviour: Behaviour::Payload(seed.to_string()),
        }
    }

    /// Fails every call with `message`
    pub fn failing(message: &str) -> Self {
        Self {
            behaviour: Behaviour::Fail(message.to_string()),
            ..Self::new("")
        }
    }

    /// Returns `bytes` without checking them
    pub fn returning_bytes(bytes: &[u8]) -> Self {
        Self {
            behaviour: Behaviour::Bytes(bytes.to_vec()),
            ..Self::new("")
        }
    }

    /// Sleep before answering
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl StageExecutor for CountingExecutor {
    async fn execute(&self, ctx: StageContext) -> anyhow::Result<StageOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behaviour {
            Behaviour::Payload(seed) => {
                let payload = payload_for(ctx.stage, seed);
                Ok(StageOutput::from_payload(&payload, format!("{} {seed}", ctx.stage))?)
            }
            Behaviour::Bytes(bytes) => Ok(StageOutput::new(bytes.clone(), "raw bytes")),
            Behaviour::Fail(message) => Err(anyhow::anyhow!("{message}")),
        }
    }
}
