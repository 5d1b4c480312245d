//! Headless scene backend.
//!
//! Simulates the animation mixer without a renderer: clips have a frame count
//! and play at a fixed frame rate, non-looping clips report their natural end,
//! and weights, speeds and morph influences are recorded for inspection. Used by
//! the daemon, by server deployments that only need the animation state, and by
//! tests.

use crate::error::{AnimationError, AnimationResult};
use crate::scene::{
    ClipHandle, ClipPlayback, ClipRef, LoadedClip, LoadedMesh, LoadedModel, MeshHandle, ModelRef,
    MorphTargetHandle, SceneBackend,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_FRAME_RATE: f32 = 60.0;

#[derive(Debug, Clone)]
struct ModelAsset {
    mesh_vertices: Vec<usize>,
    morph_targets: Vec<String>,
}

#[derive(Debug, Clone)]
struct PlayingClip {
    frame: f32,
    duration_frames: u32,
    looped: bool,
    speed: f32,
}

#[derive(Debug)]
pub struct HeadlessScene {
    frame_rate: f32,
    models: HashMap<String, ModelAsset>,
    clips: HashMap<String, u32>,
    next_handle: u64,
    clip_frames: HashMap<ClipHandle, u32>,
    playing: BTreeMap<ClipHandle, PlayingClip>,
    weights: HashMap<ClipHandle, f32>,
    influences: HashMap<MorphTargetHandle, f32>,
    live_meshes: HashSet<MeshHandle>,
}

impl HeadlessScene {
    pub fn new() -> Self {
        Self::with_frame_rate(DEFAULT_FRAME_RATE)
    }

    pub fn with_frame_rate(frame_rate: f32) -> Self {
        Self {
            frame_rate: if frame_rate > 0.0 { frame_rate } else { DEFAULT_FRAME_RATE },
            models: HashMap::new(),
            clips: HashMap::new(),
            next_handle: 0,
            clip_frames: HashMap::new(),
            playing: BTreeMap::new(),
            weights: HashMap::new(),
            influences: HashMap::new(),
            live_meshes: HashSet::new(),
        }
    }

    /// Register a model asset: one vertex count per mesh, plus morph target names
    pub fn register_model(
        &mut self,
        uri: impl Into<String>,
        mesh_vertices: Vec<usize>,
        morph_targets: &[&str],
    ) -> &mut Self {
        self.models.insert(
            uri.into(),
            ModelAsset {
                mesh_vertices,
                morph_targets: morph_targets.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }

    /// Register a clip asset and its length in frames
    pub fn register_clip(&mut self, uri: impl Into<String>, duration_frames: u32) -> &mut Self {
        self.clips.insert(uri.into(), duration_frames);
        self
    }

    fn allocate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    pub fn frame_rate(&self) -> f32 {
        self.frame_rate
    }

    pub fn is_playing(&self, clip: ClipHandle) -> bool {
        self.playing.contains_key(&clip)
    }

    pub fn playing_clips(&self) -> Vec<ClipHandle> {
        self.playing.keys().copied().collect()
    }

    /// Last weight applied to a clip, whether or not it is still playing
    pub fn weight(&self, clip: ClipHandle) -> Option<f32> {
        self.weights.get(&clip).copied()
    }

    pub fn speed(&self, clip: ClipHandle) -> Option<f32> {
        self.playing.get(&clip).map(|p| p.speed)
    }

    pub fn is_looping(&self, clip: ClipHandle) -> Option<bool> {
        self.playing.get(&clip).map(|p| p.looped)
    }

    pub fn influence(&self, target: MorphTargetHandle) -> f32 {
        self.influences.get(&target).copied().unwrap_or(0.0)
    }

    pub fn live_mesh_count(&self) -> usize {
        self.live_meshes.len()
    }

    /// Length of a loaded clip in real time at normal speed
    pub fn clip_duration(&self, clip: ClipHandle) -> Option<Duration> {
        self.clip_frames
            .get(&clip)
            .map(|&frames| Duration::from_secs_f32(frames as f32 / self.frame_rate))
    }
}

impl Default for HeadlessScene {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneBackend for HeadlessScene {
    fn load_model(&mut self, model: &ModelRef) -> AnimationResult<LoadedModel> {
        let asset = self
            .models
            .get(&model.uri)
            .cloned()
            .ok_or_else(|| AnimationError::LoadFailure(format!("model '{}' not found", model.uri)))?;

        let mut meshes = Vec::with_capacity(asset.mesh_vertices.len());
        for vertex_count in asset.mesh_vertices {
            let handle = MeshHandle(self.allocate());
            self.live_meshes.insert(handle);
            meshes.push(LoadedMesh {
                handle,
                vertex_count,
            });
        }
        let mut morph_targets = Vec::with_capacity(asset.morph_targets.len());
        for name in asset.morph_targets {
            let handle = MorphTargetHandle(self.allocate());
            morph_targets.push((name, handle));
        }
        debug!(uri = %model.uri, meshes = meshes.len(), "headless model loaded");
        Ok(LoadedModel {
            meshes,
            morph_targets,
        })
    }

    fn load_clip(&mut self, _model: &LoadedModel, clip: &ClipRef) -> AnimationResult<LoadedClip> {
        let frames = *self
            .clips
            .get(&clip.uri)
            .ok_or_else(|| AnimationError::Scene(format!("clip asset '{}' not found", clip.uri)))?;
        let handle = ClipHandle(self.allocate());
        self.clip_frames.insert(handle, frames);
        Ok(LoadedClip {
            handle,
            duration_frames: frames,
        })
    }

    fn play_clip(&mut self, clip: ClipHandle, playback: ClipPlayback) {
        let duration_frames = self.clip_frames.get(&clip).copied().unwrap_or(0);
        self.weights.insert(clip, playback.weight);
        self.playing.insert(
            clip,
            PlayingClip {
                frame: 0.0,
                duration_frames,
                looped: playback.looped,
                speed: playback.speed,
            },
        );
    }

    fn stop_clip(&mut self, clip: ClipHandle) {
        self.playing.remove(&clip);
    }

    fn set_clip_weight(&mut self, clip: ClipHandle, weight: f32) {
        self.weights.insert(clip, weight);
    }

    fn set_morph_influence(&mut self, target: MorphTargetHandle, influence: f32) {
        self.influences.insert(target, influence);
    }

    fn advance(&mut self, dt: Duration) -> Vec<ClipHandle> {
        let frames = dt.as_secs_f32() * self.frame_rate;
        let mut ended = Vec::new();
        for (handle, clip) in self.playing.iter_mut() {
            clip.frame += frames * clip.speed;
            if clip.duration_frames == 0 {
                continue;
            }
            let length = clip.duration_frames as f32;
            if clip.frame >= length {
                if clip.looped {
                    clip.frame %= length;
                } else {
                    ended.push(*handle);
                }
            }
        }
        for handle in &ended {
            self.playing.remove(handle);
        }
        ended
    }

    fn release(&mut self, meshes: &[MeshHandle], clips: &[ClipHandle]) {
        for m in meshes {
            self.live_meshes.remove(m);
        }
        for c in clips {
            self.playing.remove(c);
            self.clip_frames.remove(c);
            self.weights.remove(c);
        }
    }
}
