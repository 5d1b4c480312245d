//! Idle Variation Controller.
//!
//! Keeps an avatar visibly alive by rotating among its idle clips. With more
//! than one idle clip, each clip plays once (non-looping); its natural end
//! selects the next clip with a weighted no-immediate-repeat rule and
//! cross-fades to it.

use crate::blend::BlendCompletion;
use crate::character::{Character, ClipCategory};
use crate::error::{AnimationError, AnimationResult};
use crate::observer::{ObserverKind, Subscription};
use crate::scene::{AnimationContext, ClipHandle, ClipPlayback, SceneBackend};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use tracing::{debug, info};

pub const DEFAULT_IDLE_HISTORY: usize = 3;

const WEIGHT_FRESH: u32 = 3;
const WEIGHT_SEEN: u32 = 1;

/// Select the next idle clip index.
///
/// `history` holds recently played indices, most recent at the back. The
/// current index is never chosen. An index absent from history weighs 3, one in
/// history but outside the two most recent entries weighs 1, and the two most
/// recent entries weigh 0. If every candidate weighs 0 the choice is uniform
/// over all non-current indices.
///
/// `count` must be at least 2.
pub fn pick_next_index<R: Rng + ?Sized>(
    current: usize,
    count: usize,
    history: &VecDeque<usize>,
    rng: &mut R,
) -> usize {
    debug_assert!(count >= 2);
    let recent: Vec<usize> = history.iter().rev().take(2).copied().collect();
    let candidates: Vec<usize> = (0..count).filter(|&i| i != current).collect();
    let weights: Vec<u32> = candidates
        .iter()
        .map(|i| {
            if !history.contains(i) {
                WEIGHT_FRESH
            } else if recent.contains(i) {
                0
            } else {
                WEIGHT_SEEN
            }
        })
        .collect();

    match WeightedIndex::new(&weights) {
        Ok(dist) => candidates[dist.sample(rng)],
        // every candidate weighs zero
        Err(_) => candidates[rng.gen_range(0..candidates.len())],
    }
}

/// Cycling bookkeeping for one idle session
#[derive(Debug, Clone)]
pub struct IdleCyclingState {
    available: Vec<ClipHandle>,
    history: VecDeque<usize>,
    max_history: usize,
    current_index: usize,
    selections: u64,
}

impl IdleCyclingState {
    fn new(available: Vec<ClipHandle>, current_index: usize, max_history: usize) -> Self {
        Self {
            available,
            history: VecDeque::with_capacity(max_history),
            max_history: max_history.max(1),
            current_index,
            selections: 0,
        }
    }

    pub fn available_clips(&self) -> &[ClipHandle] {
        &self.available
    }

    pub fn recent_history(&self) -> &VecDeque<usize> {
        &self.history
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current_clip(&self) -> ClipHandle {
        self.available[self.current_index]
    }

    /// Number of clip-end driven selections made so far
    pub fn selections(&self) -> u64 {
        self.selections
    }

    /// Record the current index and move to the next one
    fn advance<R: Rng + ?Sized>(&mut self, rng: &mut R) -> usize {
        self.history.push_back(self.current_index);
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
        self.current_index =
            pick_next_index(self.current_index, self.available.len(), &self.history, rng);
        self.selections += 1;
        self.current_index
    }
}

/// An active idle session
#[derive(Debug)]
pub enum IdleSession {
    /// Exactly one idle clip, looping
    Single { clip: ClipHandle },
    /// Several idle clips, rotated on clip end
    Cycling {
        state: IdleCyclingState,
        subscription: Subscription,
    },
}

impl IdleSession {
    pub fn current_clip(&self) -> ClipHandle {
        match self {
            IdleSession::Single { clip } => *clip,
            IdleSession::Cycling { state, .. } => state.current_clip(),
        }
    }

    pub fn cycling_state(&self) -> Option<&IdleCyclingState> {
        match self {
            IdleSession::Single { .. } => None,
            IdleSession::Cycling { state, .. } => Some(state),
        }
    }
}

pub struct IdleController {
    rng: StdRng,
    history: usize,
}

impl IdleController {
    pub fn new(history: usize) -> Self {
        Self::with_rng(history, StdRng::from_entropy())
    }

    pub fn with_rng(history: usize, rng: StdRng) -> Self {
        Self {
            rng,
            history: history.max(1),
        }
    }

    /// Start idling. The caller must have torn down any previous clip session.
    pub(crate) fn start<S: SceneBackend + ?Sized>(
        &mut self,
        ctx: &mut AnimationContext<'_, S>,
        character: &mut Character,
    ) -> AnimationResult<(IdleSession, BlendCompletion)> {
        character.ensure_loaded()?;
        let idle: Vec<ClipHandle> = character
            .clips_in(ClipCategory::Idle)
            .iter()
            .map(|c| c.handle())
            .collect();
        let id = character.id();

        match idle.len() {
            0 => Err(AnimationError::NoIdleClips),
            1 => {
                let clip = idle[0];
                let done = ctx.blend.cross_fade(
                    ctx.scene,
                    id,
                    character.current_clip(),
                    clip,
                    ClipPlayback {
                        looped: true,
                        ..Default::default()
                    },
                );
                character.set_current_clip(Some(clip));
                info!(character = %id, "🧍 Idle started (single clip)");
                Ok((IdleSession::Single { clip }, done))
            }
            count => {
                let first = self.rng.gen_range(0..count);
                let state = IdleCyclingState::new(idle, first, self.history);
                let clip = state.current_clip();
                let done = ctx.blend.cross_fade(
                    ctx.scene,
                    id,
                    character.current_clip(),
                    clip,
                    ClipPlayback::default(),
                );
                character.set_current_clip(Some(clip));
                let subscription = ctx.observers.subscribe(id, ObserverKind::ClipEnd);
                info!(character = %id, clips = count, "🧍 Idle cycling started");
                Ok((IdleSession::Cycling { state, subscription }, done))
            }
        }
    }

    /// Route a natural clip end. Returns true if the session advanced.
    pub(crate) fn on_clip_end<S: SceneBackend + ?Sized>(
        &mut self,
        ctx: &mut AnimationContext<'_, S>,
        character: &mut Character,
        session: &mut IdleSession,
        ended: ClipHandle,
    ) -> bool {
        let IdleSession::Cycling {
            state,
            subscription,
        } = session
        else {
            return false;
        };
        let id = character.id();
        if !ctx.observers.is_live(id, *subscription) || state.current_clip() != ended {
            return false;
        }

        let previous = state.current_clip();
        let next = state.advance(&mut self.rng);
        let clip = state.current_clip();
        // completion is not awaited by anyone; the ramp still runs to its end
        let _ = ctx
            .blend
            .cross_fade(ctx.scene, id, Some(previous), clip, ClipPlayback::default());
        character.set_current_clip(Some(clip));
        debug!(character = %id, next, history = ?state.history, "idle clip advanced");
        true
    }

    /// Cancel cycling, detach observers and stop the current clip
    pub(crate) fn stop<S: SceneBackend + ?Sized>(
        &mut self,
        ctx: &mut AnimationContext<'_, S>,
        character: &mut Character,
        session: IdleSession,
    ) {
        let id = character.id();
        if let IdleSession::Cycling { subscription, .. } = &session {
            ctx.observers.unsubscribe(id, *subscription);
        }
        ctx.blend.cancel_owner(id);
        ctx.scene.stop_clip(session.current_clip());
        character.set_current_clip(None);
        debug!(character = %id, "idle stopped");
    }
}

impl Default for IdleController {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_HISTORY)
    }
}
