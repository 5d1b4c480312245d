//! # Companion Voice - Conversation Orchestration
//!
//! Turn-taking for the AI companion: a streaming speech-capture session is
//! segmented into utterances by silence, each utterance is dispatched to the
//! dialog service, and the reply is synthesized and played while the avatar
//! talks along with it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                   Conversation Orchestrator                       │
//! │  ┌──────────────┐  ┌───────────────────┐  ┌──────────────┐      │
//! │  │Speech capture│→ │ConversationSession│→ │    Dialog    │      │
//! │  │ (transcripts)│  │ (state + timers)  │  │   service    │      │
//! │  └──────────────┘  └───────────────────┘  └──────────────┘      │
//! │                            ↓                      ↓              │
//! │  ┌──────────────┐  ┌───────────────────┐  ┌──────────────┐      │
//! │  │    Avatar    │← │   Audio player    │← │     TTS      │      │
//! │  │  (lip-sync)  │  │  (poll to end)    │  │ (base64 WAV) │      │
//! │  └──────────────┘  └───────────────────┘  └──────────────┘      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The session is a plain state machine; [`ConversationOrchestrator`] runs it
//! on tokio and talks to the collaborators.

pub mod audio;
pub mod avatar;
pub mod capture;
pub mod config;
pub mod dialog;
pub mod error;
pub mod orchestrator;
pub mod playback;
pub mod session;
pub mod timers;
pub mod tts;

pub use audio::{decode_base64_wav, decode_wav, encode_base64_wav, encode_wav};
pub use avatar::{AvatarPort, NoAvatar, SharedAvatar, SharedService};
pub use capture::{CaptureConfig, CaptureEvent, CaptureSink, FinalMeta, ManualCapture, SpeechCapture};
pub use config::{CompanionConfig, ConversationConfig};
pub use dialog::{DialogService, HttpDialogClient, PlaceholderDialog};
pub use error::{VoiceError, VoiceResult};
pub use orchestrator::{Collaborators, ConversationOrchestrator, OrchestratorHandle};
#[cfg(feature = "playback")]
pub use playback::SpeakerPlayer;
pub use playback::{AudioPlayer, ClockPlayer};
pub use session::{
    CaptureId, Command, ConversationEvent, ConversationSession, ConversationState, Input,
    NoticeKind, SessionSnapshot, TurnId,
};
pub use timers::{TimerKind, TimerRegistry};
pub use tts::{
    HttpSpeechSynthesizer, PlaceholderSynthesizer, SpeechSynthesizer, VoiceConfig, MAX_TTS_CHARS,
};
