//! **Text-to-speech** — turns reply text into response audio.
//!
//! Backends return decoded mono PCM; the wire format (base64 WAV) is handled
//! here so the orchestrator never sees it.

use crate::audio::{decode_base64_wav, encode_base64_wav, tone};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use companion_avatar::PcmAudio;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Longest text a synthesizer accepts, in characters
pub const MAX_TTS_CHARS: usize = 5000;

/// Voice selection sent with every synthesis request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceConfig {
    #[serde(alias = "language_code")]
    pub language_code: String,
    #[serde(alias = "voice_name")]
    pub voice_name: String,
    pub gender: String,
    #[serde(alias = "speaking_rate")]
    pub speaking_rate: f32,
    pub pitch: f32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            language_code: "en-US".to_string(),
            voice_name: "en-US-Standard-C".to_string(),
            gender: "FEMALE".to_string(),
            speaking_rate: 1.0,
            pitch: 0.0,
        }
    }
}

/// Reject text over [`MAX_TTS_CHARS`] before it reaches a backend
pub fn check_length(text: &str) -> VoiceResult<()> {
    let len = text.chars().count();
    if len > MAX_TTS_CHARS {
        return Err(VoiceError::TextTooLong {
            len,
            max: MAX_TTS_CHARS,
        });
    }
    Ok(())
}

/// Backend that turns reply text into audio
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> VoiceResult<PcmAudio>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeRequest<'a> {
    text: &'a str,
    voice_config: &'a VoiceConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeReply {
    base64_audio: String,
}

/// TTS over HTTP: `POST {base}/synthesize` with `{text, voiceConfig}`, reply `{base64Audio}`.
/// Uses `TTS_API_URL` and optionally `TTS_API_KEY` (bearer).
#[derive(Debug, Clone)]
pub struct HttpSpeechSynthesizer {
    /// Base URL without trailing slash
    pub base_url: String,
    pub api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpSpeechSynthesizer {
    /// Build from environment: TTS_API_URL (required), TTS_API_KEY.
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("TTS_API_URL")
            .map_err(|_| VoiceError::Config("TTS requires TTS_API_URL".to_string()))?;
        let api_key = std::env::var("TTS_API_KEY").ok().filter(|k| !k.trim().is_empty());
        Self::new(base_url, api_key)
    }

    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> VoiceResult<PcmAudio> {
        let text = text.trim();
        check_length(text)?;
        if text.is_empty() {
            return Ok(PcmAudio::new(Vec::new(), 16000));
        }

        let url = format!("{}/synthesize", self.base_url);
        let mut request = self.client.post(&url).json(&SynthesizeRequest {
            text,
            voice_config: voice,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let res = request.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::ServiceUnavailable(format!(
                "TTS API error {}: {}",
                status, body
            )));
        }
        let reply: SynthesizeReply = res.json().await?;
        let audio = decode_base64_wav(&reply.base64_audio)?;
        debug!(duration = ?audio.duration(), "synthesized reply");
        Ok(audio)
    }
}

/// Placeholder TTS: a soft tone whose length follows the text. Goes through
/// the same base64 WAV path as the HTTP backend.
#[derive(Debug, Clone)]
pub struct PlaceholderSynthesizer {
    pub sample_rate: u32,
    /// Seconds of audio per character of text
    pub seconds_per_char: f32,
}

impl Default for PlaceholderSynthesizer {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            seconds_per_char: 0.06,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for PlaceholderSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> VoiceResult<PcmAudio> {
        check_length(text)?;
        let chars = text.trim().chars().count();
        let seconds = chars as f32 * self.seconds_per_char / voice.speaking_rate.max(0.25);
        let pitch = 220.0 * 2f32.powf(voice.pitch / 12.0);
        let payload = encode_base64_wav(&tone(pitch, seconds, self.sample_rate, 0.3))?;
        decode_base64_wav(&payload)
    }
}
