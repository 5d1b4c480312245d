//! Error types for the companion conversation system

use companion_avatar::AnimationError;
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the conversation orchestration system
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Speech stream restarted (restart #{0})")]
    TransientStreamRestart(u32),

    #[error("Processing timed out")]
    ProcessingTimeout,

    #[error("Text too long for synthesis: {len} characters (max {max})")]
    TextTooLong { len: usize, max: usize },

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Speech capture error: {0}")]
    Capture(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Avatar error: {0}")]
    Avatar(#[from] AnimationError),
}

impl VoiceError {
    /// Whether the conversation can carry on (back to idle) after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, VoiceError::Config(_) | VoiceError::ChannelSend(_))
    }

    /// Message to show the user, if this error should be visible at all
    pub fn user_message(&self) -> Option<String> {
        match self {
            VoiceError::TransientStreamRestart(_) => None,
            VoiceError::ServiceUnavailable(_) => {
                Some("The companion can't be reached right now.".to_string())
            }
            VoiceError::Capture(_) => {
                Some("Speech recognition isn't available right now.".to_string())
            }
            VoiceError::ProcessingTimeout => {
                Some("That took too long. Please try again.".to_string())
            }
            VoiceError::TextTooLong { .. } => {
                Some("The reply was too long to speak aloud.".to_string())
            }
            VoiceError::Avatar(e) if e.is_benign() => None,
            other => Some(format!("Something went wrong: {}", other)),
        }
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        VoiceError::ServiceUnavailable(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Decode(err.to_string())
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        VoiceError::Decode(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}
