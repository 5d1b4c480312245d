//! Companion configuration.
//!
//! Loaded from an optional TOML file and the environment. Precedence: env
//! `COMPANION__*` keys > file at `COMPANION_CONFIG` (default
//! `config/companion.toml`) > defaults.
//!
//! | Env | Default |
//! |-----|---------|
//! | COMPANION__CONVERSATION__SILENCE_MS | 2000 |
//! | COMPANION__CONVERSATION__CONFIDENCE_THRESHOLD | 0.15 |
//! | COMPANION__CONVERSATION__CONTINUOUS_MODE | false |
//! | COMPANION__CAPTURE__LANGUAGE_CODE | en-US |
//! | COMPANION__VOICE__VOICE_NAME | en-US-Standard-C |
//! | COMPANION__AVATAR__BLEND_STEP | 0.05 |

use crate::capture::CaptureConfig;
use crate::error::VoiceResult;
use crate::tts::VoiceConfig;
use companion_avatar::AvatarConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "COMPANION_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/companion.toml";

/// Turn-taking timings and conversation behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Quiet time after the last transcript before auto-dispatch
    pub silence_ms: u64,
    /// Finals at or below this confidence are not dispatched
    pub confidence_threshold: f32,
    /// Budget for dialog plus synthesis
    pub response_timeout_ms: u64,
    /// Ceiling on any single Processing or Responding phase
    pub hard_timeout_ms: u64,
    /// Force-clears a stuck processing flag
    pub processing_watchdog_ms: u64,
    pub playback_poll_interval_ms: u64,
    pub playback_poll_attempts: u32,
    /// Pause before listening resumes in continuous mode
    pub resume_settle_ms: u64,
    pub continuous_mode: bool,
    pub user_id: String,
    /// Reply shown when the dialog service can't be reached
    pub fallback_reply: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            silence_ms: 2000,
            confidence_threshold: 0.15,
            response_timeout_ms: 15_000,
            hard_timeout_ms: 15_000,
            processing_watchdog_ms: 5000,
            playback_poll_interval_ms: 500,
            playback_poll_attempts: 30,
            resume_settle_ms: 600,
            continuous_mode: false,
            user_id: "companion-user".to_string(),
            fallback_reply: "I'm having trouble connecting right now. Let's try again in a moment."
                .to_string(),
        }
    }
}

impl ConversationConfig {
    pub fn silence(&self) -> Duration {
        Duration::from_millis(self.silence_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_timeout_ms)
    }

    pub fn processing_watchdog(&self) -> Duration {
        Duration::from_millis(self.processing_watchdog_ms)
    }

    pub fn playback_poll_interval(&self) -> Duration {
        Duration::from_millis(self.playback_poll_interval_ms)
    }

    pub fn resume_settle(&self) -> Duration {
        Duration::from_millis(self.resume_settle_ms)
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    pub conversation: ConversationConfig,
    pub capture: CaptureConfig,
    pub voice: VoiceConfig,
    pub avatar: AvatarConfig,
}

impl CompanionConfig {
    /// Load from `COMPANION_CONFIG` (or the default path) and the environment
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load from a specific file (skipped if missing) and the environment
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("COMPANION")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(built.try_deserialize()?)
    }
}
