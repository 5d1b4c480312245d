//! Animation Service facade.
//!
//! Owns the scene backend and every per-character session. Characters live in
//! a generational arena; exactly one is active at a time and loading another
//! disposes the previous one first. Each character has at most one clip
//! session (idle, talking or one-shot), so overlapping sessions can't exist.
//!
//! The service is driven by the render loop through [`AnimationService::tick`].

use crate::analyzer::{AnalyzerConfig, AudioSource};
use crate::blend::{BlendCompletion, BlendScheduler};
use crate::character::{AnimationClip, Character, CharacterId, ClipCategory};
use crate::error::{AnimationError, AnimationResult};
use crate::idle::{IdleController, IdleCyclingState, IdleSession};
use crate::morph::MorphAnimator;
use crate::observer::{ObserverKind, ObserverRegistry, Subscription};
use crate::scene::{AnimationContext, ClipHandle, ClipPlayback, ClipRef, ModelRef, SceneBackend};
use crate::talking::{TalkingConfig, TalkingController, TalkingSession};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Avatar section of the companion configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    pub blend_step: f32,
    pub talk_settle_ms: u64,
    pub talk_speed: f32,
    pub talk_weight: f32,
    pub idle_history: usize,
    pub fft_size: usize,
    pub smoothing: f32,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            blend_step: crate::blend::DEFAULT_BLEND_STEP,
            talk_settle_ms: 100,
            talk_speed: 0.8,
            talk_weight: 0.8,
            idle_history: crate::idle::DEFAULT_IDLE_HISTORY,
            fft_size: 256,
            smoothing: 0.8,
        }
    }
}

impl AvatarConfig {
    pub fn talking(&self) -> TalkingConfig {
        TalkingConfig {
            settle_ms: self.talk_settle_ms,
            speed: self.talk_speed,
            weight: self.talk_weight,
        }
    }

    pub fn analyzer(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            fft_size: self.fft_size,
            smoothing: self.smoothing,
            ..AnalyzerConfig::default()
        }
    }
}

/// Options for [`AnimationService::play_one_shot`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OneShotOptions {
    pub speed: f32,
    pub weight: f32,
    /// Resume idle cycling when the clip ends naturally
    pub return_to_idle: bool,
}

impl Default for OneShotOptions {
    fn default() -> Self {
        Self {
            speed: 1.0,
            weight: 1.0,
            return_to_idle: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Idle,
    Talking,
    OneShot,
}

#[derive(Debug)]
struct OneShotSession {
    clip: ClipHandle,
    subscription: Subscription,
    return_to_idle: bool,
}

#[derive(Debug)]
enum ClipSession {
    Idle(IdleSession),
    Talking(TalkingSession),
    OneShot(OneShotSession),
}

impl ClipSession {
    fn kind(&self) -> SessionKind {
        match self {
            ClipSession::Idle(_) => SessionKind::Idle,
            ClipSession::Talking(_) => SessionKind::Talking,
            ClipSession::OneShot(_) => SessionKind::OneShot,
        }
    }
}

struct Active {
    character: Character,
    session: Option<ClipSession>,
}

struct Slot {
    generation: u32,
    active: Option<Active>,
}

struct Engine<S> {
    scene: S,
    blend: BlendScheduler,
    observers: ObserverRegistry,
    morphs: MorphAnimator,
}

impl<S: SceneBackend> Engine<S> {
    fn ctx(&mut self) -> AnimationContext<'_, S> {
        AnimationContext {
            scene: &mut self.scene,
            blend: &mut self.blend,
            observers: &mut self.observers,
            morphs: &mut self.morphs,
        }
    }
}

pub struct AnimationService<S: SceneBackend> {
    engine: Engine<S>,
    idle: IdleController,
    talking: TalkingController,
    slots: Vec<Slot>,
    active: Option<CharacterId>,
}

impl<S: SceneBackend> AnimationService<S> {
    pub fn new(scene: S, config: &AvatarConfig) -> Self {
        Self::build(
            scene,
            config,
            IdleController::new(config.idle_history),
            TalkingController::new(config.talking(), config.analyzer()),
        )
    }

    /// Deterministic clip selection for tests and replays
    pub fn with_seed(scene: S, config: &AvatarConfig, seed: u64) -> Self {
        Self::build(
            scene,
            config,
            IdleController::with_rng(config.idle_history, StdRng::seed_from_u64(seed)),
            TalkingController::with_rng(
                config.talking(),
                config.analyzer(),
                StdRng::seed_from_u64(seed.wrapping_add(1)),
            ),
        )
    }

    fn build(
        scene: S,
        config: &AvatarConfig,
        idle: IdleController,
        talking: TalkingController,
    ) -> Self {
        Self {
            engine: Engine {
                scene,
                blend: BlendScheduler::new(config.blend_step),
                observers: ObserverRegistry::new(),
                morphs: MorphAnimator::new(),
            },
            idle,
            talking,
            slots: Vec::new(),
            active: None,
        }
    }

    pub fn scene(&self) -> &S {
        &self.engine.scene
    }

    pub fn scene_mut(&mut self) -> &mut S {
        &mut self.engine.scene
    }

    pub fn active_character(&self) -> Option<CharacterId> {
        self.active
    }

    pub fn character(&self, id: CharacterId) -> AnimationResult<&Character> {
        lookup(&self.slots, id).map(|a| &a.character)
    }

    /// Kind of the character's current clip session, if any
    pub fn session_kind(&self, id: CharacterId) -> AnimationResult<Option<SessionKind>> {
        lookup(&self.slots, id).map(|a| a.session.as_ref().map(ClipSession::kind))
    }

    pub fn idle_state(&self, id: CharacterId) -> AnimationResult<Option<&IdleCyclingState>> {
        lookup(&self.slots, id).map(|a| match &a.session {
            Some(ClipSession::Idle(s)) => s.cycling_state(),
            _ => None,
        })
    }

    pub fn talking_session(&self, id: CharacterId) -> AnimationResult<Option<&TalkingSession>> {
        lookup(&self.slots, id).map(|a| match &a.session {
            Some(ClipSession::Talking(s)) => Some(s),
            _ => None,
        })
    }

    pub fn observer_count(&self, id: CharacterId, kind: ObserverKind) -> usize {
        self.engine.observers.count(id, kind)
    }

    pub fn morph_influence(&self, id: CharacterId, name: &str) -> AnimationResult<f32> {
        let character = self.character(id)?;
        let target = character
            .morph_target(name)
            .ok_or_else(|| AnimationError::MorphTargetNotFound(name.to_string()))?;
        Ok(self.engine.morphs.influence(target.handle()))
    }

    /// Load a model and its clips as the new active character.
    ///
    /// The previous character is disposed before loading begins. Clips that
    /// fail to load are skipped.
    pub fn load_character(
        &mut self,
        model: &ModelRef,
        clips: &[ClipRef],
    ) -> AnimationResult<CharacterId> {
        if let Some(previous) = self.active.take() {
            info!(character = %previous, "♻️ Replacing active character");
            self.unload_character(previous)?;
        }

        let loaded = self.engine.scene.load_model(model)?;
        if !loaded.is_renderable() {
            self.engine.scene.release(&loaded.mesh_handles(), &[]);
            return Err(AnimationError::LoadFailure(format!(
                "model '{}' has no renderable geometry",
                model.uri
            )));
        }

        let id = self.allocate();
        let mut character = Character::new(id, model.uri.clone(), loaded.mesh_handles());
        for clip_ref in clips {
            let clip = match self.engine.scene.load_clip(&loaded, clip_ref) {
                Ok(clip) => clip,
                Err(e) => {
                    warn!(character = %id, clip = %clip_ref.name, "⚠️ Skipping clip: {}", e);
                    continue;
                }
            };
            let category = clip_ref
                .category
                .unwrap_or_else(|| ClipCategory::infer(&clip_ref.name));
            let looped = clip_ref
                .looped
                .unwrap_or(category != ClipCategory::Expression);
            let attached = character.attach_clip(AnimationClip::new(
                clip_ref.name.clone(),
                category,
                looped,
                clip.duration_frames,
                clip.handle,
            ));
            if let Err(e) = attached {
                warn!(character = %id, "⚠️ Skipping clip: {}", e);
                self.engine.scene.release(&[], &[clip.handle]);
            }
        }
        for (name, handle) in &loaded.morph_targets {
            character.attach_morph_target(name.clone(), *handle);
        }
        character.mark_loaded();

        info!(
            character = %id,
            model = %model.uri,
            clips = character.clips().len(),
            morph_targets = loaded.morph_targets.len(),
            "🎭 Character loaded"
        );
        if let Some(slot) = self.slots.get_mut(id.index as usize) {
            slot.active = Some(Active {
                character,
                session: None,
            });
        }
        self.active = Some(id);
        Ok(id)
    }

    fn allocate(&mut self) -> CharacterId {
        let index = match self.slots.iter().position(|s| s.active.is_none()) {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    active: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        CharacterId {
            index: index as u32,
            generation: slot.generation,
        }
    }

    /// Start idling. A no-op when an idle session is already running.
    pub fn start_idle(&mut self, id: CharacterId) -> AnimationResult<()> {
        let active = lookup_mut(&mut self.slots, id)?;
        active.character.ensure_loaded()?;
        if matches!(active.session, Some(ClipSession::Idle(_))) {
            return Ok(());
        }
        let mut ctx = self.engine.ctx();
        end_session(&mut ctx, &mut self.idle, &mut self.talking, active);
        let (session, _) = self.idle.start(&mut ctx, &mut active.character)?;
        active.session = Some(ClipSession::Idle(session));
        Ok(())
    }

    /// Switch to the talking pose, optionally driving the mouth from `audio`
    pub fn start_talking(
        &mut self,
        id: CharacterId,
        audio: Option<Box<dyn AudioSource>>,
    ) -> AnimationResult<()> {
        let active = lookup_mut(&mut self.slots, id)?;
        active.character.ensure_loaded()?;
        if active.character.clips_in(ClipCategory::Talking).is_empty() {
            return Err(AnimationError::NotReady("no talking clip".to_string()));
        }
        let mut ctx = self.engine.ctx();
        end_session(&mut ctx, &mut self.idle, &mut self.talking, active);
        let session = self.talking.start(&mut ctx, &mut active.character, audio)?;
        active.session = Some(ClipSession::Talking(session));
        Ok(())
    }

    /// Leave the talking pose and go back to idling.
    ///
    /// A character without idle clips is left in its rest pose.
    pub fn stop_talking(&mut self, id: CharacterId) -> AnimationResult<()> {
        let active = lookup_mut(&mut self.slots, id)?;
        active.character.ensure_loaded()?;
        if matches!(active.session, Some(ClipSession::Talking(_))) {
            let mut ctx = self.engine.ctx();
            end_session(&mut ctx, &mut self.idle, &mut self.talking, active);
        }
        match self.start_idle(id) {
            Err(AnimationError::NoIdleClips) => {
                warn!(character = %id, "No idle clips, staying in rest pose");
                Ok(())
            }
            other => other,
        }
    }

    /// Play a clip once by name (case-insensitive)
    pub fn play_one_shot(
        &mut self,
        id: CharacterId,
        clip_name: &str,
        options: OneShotOptions,
    ) -> AnimationResult<BlendCompletion> {
        let active = lookup_mut(&mut self.slots, id)?;
        active.character.ensure_loaded()?;
        let clip = active
            .character
            .clip(clip_name)
            .map(|c| c.handle())
            .ok_or_else(|| AnimationError::ClipNotFound(clip_name.to_string()))?;

        let mut ctx = self.engine.ctx();
        end_session(&mut ctx, &mut self.idle, &mut self.talking, active);
        let done = ctx.blend.cross_fade(
            ctx.scene,
            id,
            None,
            clip,
            ClipPlayback {
                looped: false,
                speed: options.speed,
                weight: options.weight,
            },
        );
        let subscription = ctx.observers.subscribe(id, ObserverKind::ClipEnd);
        active.character.set_current_clip(Some(clip));
        active.session = Some(ClipSession::OneShot(OneShotSession {
            clip,
            subscription,
            return_to_idle: options.return_to_idle,
        }));
        info!(character = %id, clip = clip_name, "🎬 One-shot started");
        Ok(done)
    }

    /// Set a morph target, interpolating linearly over `duration`
    pub fn set_morph_target(
        &mut self,
        id: CharacterId,
        name: &str,
        value: f32,
        duration: Duration,
    ) -> AnimationResult<()> {
        let active = lookup_mut(&mut self.slots, id)?;
        active.character.ensure_loaded()?;
        let target = active
            .character
            .morph_target(name)
            .map(|m| m.handle())
            .ok_or_else(|| AnimationError::MorphTargetNotFound(name.to_string()))?;
        let engine = &mut self.engine;
        engine
            .morphs
            .tween_to(&mut engine.scene, id, target, value, duration);
        Ok(())
    }

    /// End whatever clip session is running without starting another
    pub fn stop(&mut self, id: CharacterId) -> AnimationResult<()> {
        let active = lookup_mut(&mut self.slots, id)?;
        let mut ctx = self.engine.ctx();
        end_session(&mut ctx, &mut self.idle, &mut self.talking, active);
        Ok(())
    }

    /// Tear a character down and release its scene resources
    pub fn unload_character(&mut self, id: CharacterId) -> AnimationResult<()> {
        let active = lookup_mut(&mut self.slots, id)?;
        let mut ctx = self.engine.ctx();
        end_session(&mut ctx, &mut self.idle, &mut self.talking, active);
        ctx.blend.cancel_owner(id);
        ctx.observers.detach_all(id);
        ctx.morphs.clear_owner(id);
        for target in active.character.morph_targets() {
            ctx.morphs.forget(target.handle());
        }
        ctx.scene
            .release(active.character.meshes(), &active.character.clip_handles());

        if let Some(slot) = self.slots.get_mut(id.index as usize) {
            slot.active = None;
        }
        if self.active == Some(id) {
            self.active = None;
        }
        info!(character = %id, "🗑️ Character unloaded");
        Ok(())
    }

    /// Release every character. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        let live: Vec<CharacterId> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.active.is_some())
            .map(|(i, s)| CharacterId {
                index: i as u32,
                generation: s.generation,
            })
            .collect();
        for id in live {
            if let Err(e) = self.unload_character(id) {
                debug!(character = %id, "dispose skipped: {}", e);
            }
        }
        self.active = None;
    }

    /// Advance one render frame
    pub fn tick(&mut self, dt: Duration) {
        let ended = self.engine.scene.advance(dt);
        let mut ctx = self.engine.ctx();
        ctx.blend.tick(ctx.scene);

        if let Some(id) = self.active {
            if let Ok(active) = lookup_mut(&mut self.slots, id) {
                if let Some(ClipSession::Talking(session)) = &mut active.session {
                    self.talking
                        .tick(&mut ctx, &mut active.character, session, dt);
                }

                for clip in ended {
                    let finished_shot = match &mut active.session {
                        Some(ClipSession::Idle(session)) => {
                            self.idle
                                .on_clip_end(&mut ctx, &mut active.character, session, clip);
                            None
                        }
                        Some(ClipSession::OneShot(shot))
                            if shot.clip == clip && ctx.observers.is_live(id, shot.subscription) =>
                        {
                            Some((shot.subscription, shot.return_to_idle))
                        }
                        _ => None,
                    };
                    let Some((subscription, resume_idle)) = finished_shot else {
                        continue;
                    };
                    ctx.observers.unsubscribe(id, subscription);
                    active.session = None;
                    active.character.set_current_clip(None);
                    debug!(character = %id, "one-shot finished");
                    if resume_idle {
                        match self.idle.start(&mut ctx, &mut active.character) {
                            Ok((session, _)) => active.session = Some(ClipSession::Idle(session)),
                            Err(e) => warn!(character = %id, "Idle not resumed: {}", e),
                        }
                    }
                }
            }
        }

        ctx.morphs.tick(ctx.scene, dt);
    }
}

fn lookup(slots: &[Slot], id: CharacterId) -> AnimationResult<&Active> {
    slots
        .get(id.index as usize)
        .filter(|s| s.generation == id.generation)
        .and_then(|s| s.active.as_ref())
        .ok_or(AnimationError::StaleCharacter)
}

fn lookup_mut(slots: &mut [Slot], id: CharacterId) -> AnimationResult<&mut Active> {
    slots
        .get_mut(id.index as usize)
        .filter(|s| s.generation == id.generation)
        .and_then(|s| s.active.as_mut())
        .ok_or(AnimationError::StaleCharacter)
}

/// Close the character's clip session and stop whatever it was playing
fn end_session<S: SceneBackend>(
    ctx: &mut AnimationContext<'_, S>,
    idle: &mut IdleController,
    talking: &mut TalkingController,
    active: &mut Active,
) {
    let id = active.character.id();
    match active.session.take() {
        Some(ClipSession::Idle(session)) => idle.stop(ctx, &mut active.character, session),
        Some(ClipSession::Talking(session)) => talking.stop(ctx, &mut active.character, session),
        Some(ClipSession::OneShot(shot)) => {
            ctx.observers.unsubscribe(id, shot.subscription);
            ctx.blend.cancel_owner(id);
            ctx.scene.stop_clip(shot.clip);
            active.character.set_current_clip(None);
        }
        None => {
            ctx.blend.cancel_owner(id);
            if let Some(clip) = active.character.current_clip() {
                ctx.scene.stop_clip(clip);
                active.character.set_current_clip(None);
            }
        }
    }
}
