//! Blend Scheduler — weighted cross-fades between two clips.
//!
//! A cross-fade is an explicit ramp object registered under a [`RampToken`].
//! Every render tick advances all live ramps by one step. Each character has at
//! most one live ramp: a new request for the same character supersedes the old
//! one, which is unsubscribed and its completion resolved as
//! [`BlendOutcome::Superseded`].

use crate::character::CharacterId;
use crate::scene::{ClipHandle, ClipPlayback, SceneBackend};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

/// Default per-tick weight increment
pub const DEFAULT_BLEND_STEP: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RampToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendOutcome {
    /// The target clip reached its max weight
    Completed,
    /// A newer cross-fade for the same character took over
    Superseded,
    /// The ramp was cancelled by a teardown
    Cancelled,
}

/// Completion signal of one ramp
#[derive(Debug)]
pub struct BlendCompletion {
    token: RampToken,
    rx: oneshot::Receiver<BlendOutcome>,
}

impl BlendCompletion {
    pub fn token(&self) -> RampToken {
        self.token
    }

    /// Non-blocking check. `None` while the ramp is still running.
    pub fn try_outcome(&mut self) -> Option<BlendOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(BlendOutcome::Cancelled),
        }
    }

    pub async fn wait(self) -> BlendOutcome {
        self.rx.await.unwrap_or(BlendOutcome::Cancelled)
    }
}

struct Ramp {
    owner: CharacterId,
    from: Option<ClipHandle>,
    to: ClipHandle,
    weight_from: f32,
    weight_to: f32,
    step: f32,
    max_weight: f32,
    done: Option<oneshot::Sender<BlendOutcome>>,
}

impl Ramp {
    fn resolve(&mut self, outcome: BlendOutcome) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(outcome);
        }
    }
}

pub struct BlendScheduler {
    step: f32,
    next_token: u64,
    ramps: HashMap<RampToken, Ramp>,
    by_owner: HashMap<CharacterId, RampToken>,
}

impl BlendScheduler {
    pub fn new(step: f32) -> Self {
        let step = if step.is_finite() && step > 0.0 {
            step.min(1.0)
        } else {
            1.0
        };
        Self {
            step,
            next_token: 0,
            ramps: HashMap::new(),
            by_owner: HashMap::new(),
        }
    }

    pub fn step(&self) -> f32 {
        self.step
    }

    /// Cross-fade `from` → `to` for one character.
    ///
    /// Stops `from`, starts `to` at weight 0 and ramps it up to
    /// `playback.weight` (clamped to [0,1]) on subsequent ticks.
    pub fn cross_fade<S: SceneBackend + ?Sized>(
        &mut self,
        scene: &mut S,
        owner: CharacterId,
        from: Option<ClipHandle>,
        to: ClipHandle,
        playback: ClipPlayback,
    ) -> BlendCompletion {
        if let Some(old) = self.by_owner.remove(&owner) {
            if let Some(mut ramp) = self.ramps.remove(&old) {
                debug!(?old, "blend ramp superseded");
                ramp.resolve(BlendOutcome::Superseded);
            }
        }

        let from = from.filter(|f| *f != to);
        if let Some(a) = from {
            scene.stop_clip(a);
        }
        scene.play_clip(
            to,
            ClipPlayback {
                weight: 0.0,
                ..playback
            },
        );

        self.next_token += 1;
        let token = RampToken(self.next_token);
        let (tx, rx) = oneshot::channel();
        self.ramps.insert(
            token,
            Ramp {
                owner,
                from,
                to,
                weight_from: 1.0,
                weight_to: 0.0,
                step: self.step,
                max_weight: playback.weight.clamp(0.0, 1.0),
                done: Some(tx),
            },
        );
        self.by_owner.insert(owner, token);
        BlendCompletion { token, rx }
    }

    /// Advance every live ramp by one step
    pub fn tick<S: SceneBackend + ?Sized>(&mut self, scene: &mut S) {
        let mut finished = Vec::new();
        for (token, ramp) in self.ramps.iter_mut() {
            ramp.weight_to = (ramp.weight_to + ramp.step).min(ramp.max_weight);
            ramp.weight_from = (ramp.weight_from - ramp.step).max(0.0);
            scene.set_clip_weight(ramp.to, ramp.weight_to);
            if let Some(a) = ramp.from {
                scene.set_clip_weight(a, ramp.weight_from);
            }
            if ramp.weight_to >= ramp.max_weight {
                finished.push(*token);
            }
        }
        for token in finished {
            if let Some(mut ramp) = self.ramps.remove(&token) {
                if self.by_owner.get(&ramp.owner) == Some(&token) {
                    self.by_owner.remove(&ramp.owner);
                }
                ramp.resolve(BlendOutcome::Completed);
            }
        }
    }

    pub fn cancel(&mut self, token: RampToken) -> bool {
        match self.ramps.remove(&token) {
            Some(mut ramp) => {
                if self.by_owner.get(&ramp.owner) == Some(&token) {
                    self.by_owner.remove(&ramp.owner);
                }
                ramp.resolve(BlendOutcome::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn cancel_owner(&mut self, owner: CharacterId) -> bool {
        match self.by_owner.get(&owner).copied() {
            Some(token) => self.cancel(token),
            None => false,
        }
    }

    pub fn is_active(&self, token: RampToken) -> bool {
        self.ramps.contains_key(&token)
    }

    pub fn active_for(&self, owner: CharacterId) -> Option<RampToken> {
        self.by_owner.get(&owner).copied()
    }

    pub fn active_count(&self) -> usize {
        self.ramps.len()
    }
}

impl Default for BlendScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_BLEND_STEP)
    }
}
