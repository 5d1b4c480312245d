//! Scene/asset boundary.
//!
//! The engine never builds meshes or materials itself. A [`SceneBackend`] owns
//! the renderer-side objects and hands the engine opaque handles for meshes,
//! clips (animation groups) and morph targets. Everything the engine does to
//! the scene goes through this trait.

use crate::blend::BlendScheduler;
use crate::character::ClipCategory;
use crate::error::AnimationResult;
use crate::morph::MorphAnimator;
use crate::observer::ObserverRegistry;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Opaque handle to a renderable mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshHandle(pub u64);

/// Opaque handle to an animation clip (all animatables of one animation group)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClipHandle(pub u64);

/// Opaque handle to a morph target (blend shape)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MorphTargetHandle(pub u64);

/// Reference to a model asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub uri: String,
}

impl ModelRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

impl From<&str> for ModelRef {
    fn from(uri: &str) -> Self {
        Self::new(uri)
    }
}

/// Reference to a clip asset to attach to a character
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipRef {
    /// Clip name, matched case-insensitively
    pub name: String,
    /// Asset location
    pub uri: String,
    /// Explicit category. Inferred from the name when absent.
    #[serde(default)]
    pub category: Option<ClipCategory>,
    /// Explicit loop flag. Defaults to looping for idle and talking clips.
    #[serde(default)]
    pub looped: Option<bool>,
}

impl ClipRef {
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            category: None,
            looped: None,
        }
    }

    pub fn with_category(mut self, category: ClipCategory) -> Self {
        self.category = Some(category);
        self
    }
}

/// One mesh produced by a model load
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedMesh {
    pub handle: MeshHandle,
    pub vertex_count: usize,
}

/// What the scene hands back after loading a model
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedModel {
    pub meshes: Vec<LoadedMesh>,
    pub morph_targets: Vec<(String, MorphTargetHandle)>,
}

impl LoadedModel {
    /// True if at least one mesh carries geometry
    pub fn is_renderable(&self) -> bool {
        self.meshes.iter().any(|m| m.vertex_count > 0)
    }

    pub fn mesh_handles(&self) -> Vec<MeshHandle> {
        self.meshes.iter().map(|m| m.handle).collect()
    }
}

/// What the scene hands back after loading a clip
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadedClip {
    pub handle: ClipHandle,
    pub duration_frames: u32,
}

/// How a clip should be started
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipPlayback {
    pub looped: bool,
    pub speed: f32,
    pub weight: f32,
}

impl Default for ClipPlayback {
    fn default() -> Self {
        Self {
            looped: false,
            speed: 1.0,
            weight: 1.0,
        }
    }
}

/// Renderer-side collaborator.
///
/// Implementations apply clip weights to every animatable of the clip and
/// report clips that reached their natural end from [`SceneBackend::advance`].
pub trait SceneBackend {
    fn load_model(&mut self, model: &ModelRef) -> AnimationResult<LoadedModel>;

    fn load_clip(&mut self, model: &LoadedModel, clip: &ClipRef) -> AnimationResult<LoadedClip>;

    fn play_clip(&mut self, clip: ClipHandle, playback: ClipPlayback);

    fn stop_clip(&mut self, clip: ClipHandle);

    fn set_clip_weight(&mut self, clip: ClipHandle, weight: f32);

    fn set_morph_influence(&mut self, target: MorphTargetHandle, influence: f32);

    /// Advance the animation mixer by `dt`. Returns non-looping clips that
    /// finished during this step, in handle order.
    fn advance(&mut self, dt: Duration) -> Vec<ClipHandle>;

    /// Release everything created for a character
    fn release(&mut self, meshes: &[MeshHandle], clips: &[ClipHandle]);
}

/// Mutable engine state the controllers share for one operation
pub(crate) struct AnimationContext<'a, S: SceneBackend + ?Sized> {
    pub scene: &'a mut S,
    pub blend: &'a mut BlendScheduler,
    pub observers: &'a mut ObserverRegistry,
    pub morphs: &'a mut MorphAnimator,
}
