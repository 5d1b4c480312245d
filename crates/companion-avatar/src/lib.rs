//! Companion avatar animation engine.
//!
//! A small domain model (character, clips, morph targets) plus the use-cases
//! that keep the avatar alive: idle-clip variety cycling, audio-reactive
//! lip-sync and weighted cross-fades. Rendering stays behind [`SceneBackend`];
//! the engine is ticked by the render loop and never spawns threads.

pub mod analyzer;
pub mod blend;
pub mod character;
pub mod error;
pub mod headless;
pub mod idle;
pub mod morph;
pub mod observer;
pub mod scene;
pub mod service;
pub mod talking;

pub use analyzer::{volume, AnalyzerConfig, AudioSource, FrequencyAnalyzer, PcmAudio};
pub use blend::{BlendCompletion, BlendOutcome, BlendScheduler, RampToken};
pub use character::{AnimationClip, Character, CharacterId, ClipCategory, MorphTarget};
pub use error::{AnimationError, AnimationResult};
pub use headless::HeadlessScene;
pub use idle::{pick_next_index, IdleCyclingState, IdleSession};
pub use observer::{ObserverKind, Subscription};
pub use scene::{
    ClipHandle, ClipPlayback, ClipRef, LoadedClip, LoadedMesh, LoadedModel, MeshHandle, ModelRef,
    MorphTargetHandle, SceneBackend,
};
pub use service::{AnimationService, AvatarConfig, OneShotOptions, SessionKind};
pub use talking::{
    mouth_influences, MouthInfluences, TalkingConfig, TalkingPhase, TalkingSession, JAW_OPEN,
    MOUTH_OPEN, TEETH_MOUTH_OPEN,
};
