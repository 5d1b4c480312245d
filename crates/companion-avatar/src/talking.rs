//! Talking / Lip-Sync Controller.
//!
//! Plays a talking clip on top of the base pose and, when the response audio
//! is supplied, opens the mouth from the analyzer's volume every frame.

use crate::analyzer::{volume, AnalyzerConfig, AudioSource, FrequencyAnalyzer};
use crate::character::{Character, ClipCategory};
use crate::error::{AnimationError, AnimationResult};
use crate::morph::clamp_influence;
use crate::observer::{ObserverKind, Subscription};
use crate::scene::{AnimationContext, ClipHandle, ClipPlayback, MorphTargetHandle, SceneBackend};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const JAW_OPEN: &str = "jawOpen";
pub const MOUTH_OPEN: &str = "mouthOpen";
pub const TEETH_MOUTH_OPEN: &str = "teethMouthOpen";

/// Per-frame influences for the three mouth targets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MouthInfluences {
    pub jaw_open: f32,
    pub mouth_open: f32,
    pub teeth_mouth_open: f32,
}

impl MouthInfluences {
    pub const CLOSED: MouthInfluences = MouthInfluences {
        jaw_open: 0.0,
        mouth_open: 0.0,
        teeth_mouth_open: 0.0,
    };
}

/// Map a [0,1] volume onto mouth influences. Always within [0,1].
pub fn mouth_influences(volume: f32) -> MouthInfluences {
    let v = if volume.is_nan() { 0.0 } else { volume.max(0.0) };
    MouthInfluences {
        jaw_open: clamp_influence(v * 2.5),
        mouth_open: clamp_influence(v * 2.0),
        teeth_mouth_open: clamp_influence(v * 1.5),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TalkingConfig {
    /// Pause between tearing down the previous clip and starting the talking clip
    pub settle_ms: u64,
    pub speed: f32,
    /// Cap on the talking clip's blend weight
    pub weight: f32,
}

impl Default for TalkingConfig {
    fn default() -> Self {
        Self {
            settle_ms: 100,
            speed: 0.8,
            weight: 0.8,
        }
    }
}

/// Mouth targets the binding found on the character. Missing ones are skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundMorphTargets {
    pub jaw_open: Option<MorphTargetHandle>,
    pub mouth_open: Option<MorphTargetHandle>,
    pub teeth_mouth_open: Option<MorphTargetHandle>,
}

impl BoundMorphTargets {
    fn resolve(character: &Character) -> Self {
        let find = |name: &str| character.morph_target(name).map(|m| m.handle());
        Self {
            jaw_open: find(JAW_OPEN),
            mouth_open: find(MOUTH_OPEN),
            teeth_mouth_open: find(TEETH_MOUTH_OPEN),
        }
    }

    fn is_empty(&self) -> bool {
        self.jaw_open.is_none() && self.mouth_open.is_none() && self.teeth_mouth_open.is_none()
    }

    fn pairs(&self, m: MouthInfluences) -> [(Option<MorphTargetHandle>, f32); 3] {
        [
            (self.jaw_open, m.jaw_open),
            (self.mouth_open, m.mouth_open),
            (self.teeth_mouth_open, m.teeth_mouth_open),
        ]
    }
}

/// Audio-to-mouth binding. Lives from talking start to stop.
pub struct LipSyncBinding {
    source: Box<dyn AudioSource>,
    position: Duration,
    targets: BoundMorphTargets,
    token: Subscription,
    analyzer: FrequencyAnalyzer,
    exhausted: bool,
}

impl LipSyncBinding {
    pub fn targets(&self) -> BoundMorphTargets {
        self.targets
    }

    pub fn token(&self) -> Subscription {
        self.token
    }

    pub fn position(&self) -> Duration {
        self.position
    }
}

impl fmt::Debug for LipSyncBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LipSyncBinding")
            .field("position", &self.position)
            .field("targets", &self.targets)
            .field("token", &self.token)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TalkingPhase {
    /// Waiting out the settle delay before the clip starts
    Settling { remaining: Duration },
    Playing,
}

#[derive(Debug)]
pub struct TalkingSession {
    clip: ClipHandle,
    phase: TalkingPhase,
    binding: Option<LipSyncBinding>,
}

impl TalkingSession {
    pub fn clip(&self) -> ClipHandle {
        self.clip
    }

    pub fn phase(&self) -> TalkingPhase {
        self.phase
    }

    pub fn binding(&self) -> Option<&LipSyncBinding> {
        self.binding.as_ref()
    }
}

pub struct TalkingController {
    config: TalkingConfig,
    analyzer: AnalyzerConfig,
    rng: StdRng,
}

impl TalkingController {
    pub fn new(config: TalkingConfig, analyzer: AnalyzerConfig) -> Self {
        Self::with_rng(config, analyzer, StdRng::from_entropy())
    }

    pub fn with_rng(config: TalkingConfig, analyzer: AnalyzerConfig, rng: StdRng) -> Self {
        Self {
            config,
            analyzer,
            rng,
        }
    }

    pub fn config(&self) -> &TalkingConfig {
        &self.config
    }

    /// Open a talking session. The caller has already torn down the previous
    /// clip session, so nothing is playing; the clip starts after the settle delay.
    pub(crate) fn start<S: SceneBackend + ?Sized>(
        &mut self,
        ctx: &mut AnimationContext<'_, S>,
        character: &mut Character,
        audio: Option<Box<dyn AudioSource>>,
    ) -> AnimationResult<TalkingSession> {
        character.ensure_loaded()?;
        let talking = character.clips_in(ClipCategory::Talking);
        if talking.is_empty() {
            return Err(AnimationError::NotReady("no talking clip".to_string()));
        }
        let clip = talking[self.rng.gen_range(0..talking.len())].handle();
        let id = character.id();

        let binding = match audio {
            Some(source) => {
                let targets = BoundMorphTargets::resolve(character);
                if targets.is_empty() {
                    warn!(character = %id, "No mouth morph targets, lip-sync disabled");
                    None
                } else {
                    Some(LipSyncBinding {
                        source,
                        position: Duration::ZERO,
                        targets,
                        token: ctx.observers.subscribe(id, ObserverKind::AnalyzerFrame),
                        analyzer: FrequencyAnalyzer::new(self.analyzer),
                        exhausted: false,
                    })
                }
            }
            None => None,
        };

        let mut session = TalkingSession {
            clip,
            phase: TalkingPhase::Settling {
                remaining: Duration::from_millis(self.config.settle_ms),
            },
            binding,
        };
        if self.config.settle_ms == 0 {
            self.begin_clip(ctx, character, &mut session);
        }
        info!(
            character = %id,
            lip_sync = session.binding.is_some(),
            "🗣️ Talking started"
        );
        Ok(session)
    }

    fn begin_clip<S: SceneBackend + ?Sized>(
        &self,
        ctx: &mut AnimationContext<'_, S>,
        character: &mut Character,
        session: &mut TalkingSession,
    ) {
        let _ = ctx.blend.cross_fade(
            ctx.scene,
            character.id(),
            None,
            session.clip,
            ClipPlayback {
                looped: true,
                speed: self.config.speed,
                weight: self.config.weight,
            },
        );
        character.set_current_clip(Some(session.clip));
        session.phase = TalkingPhase::Playing;
    }

    pub(crate) fn tick<S: SceneBackend + ?Sized>(
        &mut self,
        ctx: &mut AnimationContext<'_, S>,
        character: &mut Character,
        session: &mut TalkingSession,
        dt: Duration,
    ) {
        if let TalkingPhase::Settling { remaining } = session.phase {
            let remaining = remaining.saturating_sub(dt);
            if remaining.is_zero() {
                self.begin_clip(ctx, character, session);
            } else {
                session.phase = TalkingPhase::Settling { remaining };
            }
        }

        let id = character.id();
        let Some(binding) = session.binding.as_mut() else {
            return;
        };
        if binding.exhausted || !ctx.observers.is_live(id, binding.token) {
            return;
        }
        binding.position += dt;
        let mouth = match binding.analyzer.sample(binding.source.as_ref(), binding.position) {
            Some(bins) => mouth_influences(volume(bins)),
            None => {
                binding.exhausted = true;
                debug!(character = %id, "lip-sync source exhausted");
                MouthInfluences::CLOSED
            }
        };
        for (target, value) in binding.targets.pairs(mouth) {
            if let Some(t) = target {
                ctx.morphs.apply(ctx.scene, t, value);
            }
        }
    }

    /// Unbind the analyzer, zero the mouth and stop the clip
    pub(crate) fn stop<S: SceneBackend + ?Sized>(
        &mut self,
        ctx: &mut AnimationContext<'_, S>,
        character: &mut Character,
        session: TalkingSession,
    ) {
        let id = character.id();
        if let Some(binding) = session.binding {
            ctx.observers.unsubscribe(id, binding.token);
        }
        ctx.blend.cancel_owner(id);
        for target in BoundMorphTargets::resolve(character)
            .pairs(MouthInfluences::CLOSED)
            .into_iter()
            .filter_map(|(t, _)| t)
        {
            ctx.morphs.apply(ctx.scene, target, 0.0);
        }
        if session.phase == TalkingPhase::Playing {
            ctx.scene.stop_clip(session.clip);
        }
        character.set_current_clip(None);
        info!(character = %id, "🤐 Talking stopped");
    }
}

impl Default for TalkingController {
    fn default() -> Self {
        Self::new(TalkingConfig::default(), AnalyzerConfig::default())
    }
}
