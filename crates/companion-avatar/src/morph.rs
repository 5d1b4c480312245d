//! Morph target influences and linear tweens.
//!
//! Every influence the engine writes goes through [`MorphAnimator::apply`],
//! which clamps to [0,1] and remembers the value so a later tween starts from
//! where the face actually is.

use crate::character::CharacterId;
use crate::scene::{MorphTargetHandle, SceneBackend};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
struct MorphTween {
    owner: CharacterId,
    from: f32,
    to: f32,
    elapsed: Duration,
    duration: Duration,
}

#[derive(Debug, Default)]
pub struct MorphAnimator {
    current: HashMap<MorphTargetHandle, f32>,
    tweens: HashMap<MorphTargetHandle, MorphTween>,
}

pub fn clamp_influence(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

impl MorphAnimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write an influence immediately. Cancels any tween on the target.
    pub fn apply<S: SceneBackend + ?Sized>(
        &mut self,
        scene: &mut S,
        target: MorphTargetHandle,
        value: f32,
    ) -> f32 {
        self.tweens.remove(&target);
        self.write(scene, target, value)
    }

    fn write<S: SceneBackend + ?Sized>(
        &mut self,
        scene: &mut S,
        target: MorphTargetHandle,
        value: f32,
    ) -> f32 {
        let value = clamp_influence(value);
        self.current.insert(target, value);
        scene.set_morph_influence(target, value);
        value
    }

    /// Interpolate linearly from the current influence to `value` over
    /// `duration`. A zero duration applies immediately.
    pub fn tween_to<S: SceneBackend + ?Sized>(
        &mut self,
        scene: &mut S,
        owner: CharacterId,
        target: MorphTargetHandle,
        value: f32,
        duration: Duration,
    ) {
        if duration.is_zero() {
            self.apply(scene, target, value);
            return;
        }
        let from = self.influence(target);
        self.tweens.insert(
            target,
            MorphTween {
                owner,
                from,
                to: clamp_influence(value),
                elapsed: Duration::ZERO,
                duration,
            },
        );
    }

    pub fn tick<S: SceneBackend + ?Sized>(&mut self, scene: &mut S, dt: Duration) {
        if self.tweens.is_empty() {
            return;
        }
        let mut updates = Vec::with_capacity(self.tweens.len());
        self.tweens.retain(|target, tween| {
            tween.elapsed += dt;
            let t = (tween.elapsed.as_secs_f32() / tween.duration.as_secs_f32()).min(1.0);
            updates.push((*target, tween.from + (tween.to - tween.from) * t));
            t < 1.0
        });
        for (target, value) in updates {
            self.write(scene, target, value);
        }
    }

    /// Drop every tween belonging to a character. Influences already written stay.
    pub fn clear_owner(&mut self, owner: CharacterId) {
        self.tweens.retain(|_, t| t.owner != owner);
    }

    pub fn forget(&mut self, target: MorphTargetHandle) {
        self.tweens.remove(&target);
        self.current.remove(&target);
    }

    pub fn influence(&self, target: MorphTargetHandle) -> f32 {
        self.current.get(&target).copied().unwrap_or(0.0)
    }

    pub fn is_tweening(&self, target: MorphTargetHandle) -> bool {
        self.tweens.contains_key(&target)
    }
}
