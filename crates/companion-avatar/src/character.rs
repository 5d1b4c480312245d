//! Character domain entity: clips, morph targets and load state.

use crate::error::{AnimationError, AnimationResult};
use crate::scene::{ClipHandle, MeshHandle, MorphTargetHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Arena handle for a character. The generation changes every time a slot is
/// reused, so handles held by late callbacks stop resolving once the
/// character they pointed at has been replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacterId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl CharacterId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for CharacterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "character#{}v{}", self.index, self.generation)
    }
}

/// What a clip is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipCategory {
    Idle,
    Talking,
    Expression,
}

impl ClipCategory {
    /// Classify a clip by its name when the asset did not say
    pub fn infer(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.contains("idle") {
            ClipCategory::Idle
        } else if lower.contains("talk") || lower.contains("speak") {
            ClipCategory::Talking
        } else {
            ClipCategory::Expression
        }
    }
}

/// A named animation clip attached to a character. Immutable once attached.
#[derive(Debug, Clone, PartialEq)]
pub struct AnimationClip {
    name: String,
    category: ClipCategory,
    looped: bool,
    duration_frames: u32,
    handle: ClipHandle,
}

impl AnimationClip {
    pub fn new(
        name: impl Into<String>,
        category: ClipCategory,
        looped: bool,
        duration_frames: u32,
        handle: ClipHandle,
    ) -> Self {
        Self {
            name: name.into(),
            category,
            looped,
            duration_frames,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> ClipCategory {
        self.category
    }

    pub fn looped(&self) -> bool {
        self.looped
    }

    pub fn duration_frames(&self) -> u32 {
        self.duration_frames
    }

    pub fn handle(&self) -> ClipHandle {
        self.handle
    }
}

/// A named blend shape on one of the character's meshes
#[derive(Debug, Clone, PartialEq)]
pub struct MorphTarget {
    name: String,
    handle: MorphTargetHandle,
}

impl MorphTarget {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> MorphTargetHandle {
        self.handle
    }
}

/// In-memory representation of a loaded avatar
#[derive(Debug, Clone)]
pub struct Character {
    id: CharacterId,
    model: String,
    meshes: Vec<MeshHandle>,
    clips: Vec<AnimationClip>,
    // lowercase name -> index into `clips`
    clip_index: HashMap<String, usize>,
    // lowercase name -> target
    morph_targets: HashMap<String, MorphTarget>,
    loaded: bool,
    current_clip: Option<ClipHandle>,
}

impl Character {
    pub(crate) fn new(id: CharacterId, model: impl Into<String>, meshes: Vec<MeshHandle>) -> Self {
        Self {
            id,
            model: model.into(),
            meshes,
            clips: Vec::new(),
            clip_index: HashMap::new(),
            morph_targets: HashMap::new(),
            loaded: false,
            current_clip: None,
        }
    }

    /// Attach a clip. Names are unique under case-insensitive comparison.
    pub(crate) fn attach_clip(&mut self, clip: AnimationClip) -> AnimationResult<()> {
        let key = clip.name.to_lowercase();
        if self.clip_index.contains_key(&key) {
            return Err(AnimationError::Scene(format!(
                "duplicate clip name '{}'",
                clip.name
            )));
        }
        self.clip_index.insert(key, self.clips.len());
        self.clips.push(clip);
        Ok(())
    }

    pub(crate) fn attach_morph_target(&mut self, name: impl Into<String>, handle: MorphTargetHandle) {
        let name = name.into();
        self.morph_targets
            .insert(name.to_lowercase(), MorphTarget { name, handle });
    }

    pub(crate) fn mark_loaded(&mut self) {
        self.loaded = true;
    }

    pub(crate) fn set_current_clip(&mut self, clip: Option<ClipHandle>) {
        self.current_clip = clip;
    }

    pub fn id(&self) -> CharacterId {
        self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn ensure_loaded(&self) -> AnimationResult<()> {
        if self.loaded {
            Ok(())
        } else {
            Err(AnimationError::NotLoaded)
        }
    }

    pub fn meshes(&self) -> &[MeshHandle] {
        &self.meshes
    }

    pub fn clips(&self) -> &[AnimationClip] {
        &self.clips
    }

    /// Case-insensitive clip lookup
    pub fn clip(&self, name: &str) -> Option<&AnimationClip> {
        self.clip_index
            .get(&name.to_lowercase())
            .map(|&i| &self.clips[i])
    }

    pub fn clip_by_handle(&self, handle: ClipHandle) -> Option<&AnimationClip> {
        self.clips.iter().find(|c| c.handle == handle)
    }

    /// Clips of one category in attachment order
    pub fn clips_in(&self, category: ClipCategory) -> Vec<&AnimationClip> {
        self.clips.iter().filter(|c| c.category == category).collect()
    }

    pub fn clip_handles(&self) -> Vec<ClipHandle> {
        self.clips.iter().map(|c| c.handle).collect()
    }

    /// Case-insensitive morph target lookup
    pub fn morph_target(&self, name: &str) -> Option<&MorphTarget> {
        self.morph_targets.get(&name.to_lowercase())
    }

    pub fn morph_targets(&self) -> impl Iterator<Item = &MorphTarget> {
        self.morph_targets.values()
    }

    pub fn current_clip(&self) -> Option<ClipHandle> {
        self.current_clip
    }
}
