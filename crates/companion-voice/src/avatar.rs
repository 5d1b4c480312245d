//! Coupling between the conversation and the animation engine.
//!
//! The orchestrator only needs two things from the avatar: start talking
//! along with the reply audio, and go back to idling. [`SharedAvatar`] does
//! this against an [`AnimationService`] that the render loop also ticks.

use crate::error::VoiceResult;
use companion_avatar::{AnimationService, AudioSource, CharacterId, PcmAudio, SceneBackend};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

pub trait AvatarPort: Send + Sync {
    /// Enter the talking pose; the mouth follows `audio` when given
    fn start_talking(&self, audio: Option<PcmAudio>) -> VoiceResult<()>;

    /// Leave the talking pose and resume idling
    fn stop_talking(&self) -> VoiceResult<()>;
}

/// Avatar port that does nothing, for voice-only setups
#[derive(Debug, Default)]
pub struct NoAvatar;

impl AvatarPort for NoAvatar {
    fn start_talking(&self, _audio: Option<PcmAudio>) -> VoiceResult<()> {
        Ok(())
    }

    fn stop_talking(&self) -> VoiceResult<()> {
        Ok(())
    }
}

/// Animation service shared between the render loop and the orchestrator
pub type SharedService<S> = Arc<Mutex<AnimationService<S>>>;

/// [`AvatarPort`] bound to one character of a shared [`AnimationService`].
///
/// When the character is replaced, calls made with the old id fail with
/// `StaleCharacter` until [`SharedAvatar::rebind`] points at the new one.
pub struct SharedAvatar<S: SceneBackend> {
    service: SharedService<S>,
    character: Mutex<Option<CharacterId>>,
}

impl<S: SceneBackend> SharedAvatar<S> {
    pub fn new(service: SharedService<S>, character: Option<CharacterId>) -> Self {
        Self {
            service,
            character: Mutex::new(character),
        }
    }

    pub fn rebind(&self, character: Option<CharacterId>) {
        *self.character.lock() = character;
    }

    pub fn character(&self) -> Option<CharacterId> {
        *self.character.lock()
    }

    pub fn service(&self) -> &SharedService<S> {
        &self.service
    }
}

impl<S: SceneBackend + Send> AvatarPort for SharedAvatar<S> {
    fn start_talking(&self, audio: Option<PcmAudio>) -> VoiceResult<()> {
        let Some(id) = self.character() else {
            debug!("no character bound, talking skipped");
            return Ok(());
        };
        let source = audio.map(|a| Box::new(a) as Box<dyn AudioSource>);
        self.service.lock().start_talking(id, source)?;
        Ok(())
    }

    fn stop_talking(&self) -> VoiceResult<()> {
        let Some(id) = self.character() else {
            return Ok(());
        };
        self.service.lock().stop_talking(id)?;
        Ok(())
    }
}
