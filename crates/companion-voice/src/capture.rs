//! Speech-capture collaborator.
//!
//! The capture service streams microphone audio to a speech recognizer and
//! reports transcripts back. Events are delivered through a [`CaptureSink`]
//! that carries the capture generation it was opened for, so events from a
//! session that has since been closed are recognised and dropped.

use crate::error::VoiceResult;
use crate::session::{CaptureId, Input};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Recognizer settings sent with `configure`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureConfig {
    pub encoding: String,
    #[serde(alias = "sample_rate")]
    pub sample_rate: u32,
    #[serde(alias = "language_code")]
    pub language_code: String,
    #[serde(alias = "interim_results")]
    pub interim_results: bool,
    #[serde(alias = "single_utterance")]
    pub single_utterance: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            encoding: "LINEAR16".to_string(),
            sample_rate: 16000,
            language_code: "en-US".to_string(),
            interim_results: true,
            single_utterance: false,
        }
    }
}

/// Bookkeeping attached to a final transcript
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FinalMeta {
    /// Stream restarts the recognizer went through during this utterance
    pub restart_count: u32,
    /// Result end time corrected for restarts, in milliseconds
    pub corrected_time: Option<f64>,
}

/// Events emitted by the speech-capture service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaptureEvent {
    /// Provisional transcript of the current utterance
    Interim { transcript: String, confidence: f32 },

    /// Finalized transcript of an utterance
    Final {
        transcript: String,
        confidence: f32,
        #[serde(default)]
        meta: FinalMeta,
    },

    /// Capture or recognizer failure
    Error { message: String },

    /// The capture session ended on its own
    End,

    /// The transport reconnected the recognizer stream
    StreamRestart { count: u32 },

    /// Audio is being bridged across a stream restart
    AudioBridging,
}

/// Where a capture session delivers its events
#[derive(Debug, Clone)]
pub struct CaptureSink {
    capture: CaptureId,
    tx: mpsc::UnboundedSender<Input>,
}

impl CaptureSink {
    pub(crate) fn new(capture: CaptureId, tx: mpsc::UnboundedSender<Input>) -> Self {
        Self { capture, tx }
    }

    pub fn capture(&self) -> CaptureId {
        self.capture
    }

    /// Deliver an event. Returns false once the orchestrator is gone.
    pub fn emit(&self, event: CaptureEvent) -> bool {
        self.tx
            .send(Input::Capture {
                capture: self.capture,
                event,
            })
            .is_ok()
    }
}

/// Speech-capture service
#[async_trait]
pub trait SpeechCapture: Send + Sync {
    /// Establish the connection to the recognizer. Called once.
    async fn connect(&self) -> VoiceResult<()>;

    /// Send recognizer settings. Called once, after `connect`.
    async fn configure(&self, config: &CaptureConfig) -> VoiceResult<()>;

    /// Open a capture session that reports into `sink`
    async fn start(&self, sink: CaptureSink) -> VoiceResult<()>;

    /// Close the current capture session
    async fn stop(&self) -> VoiceResult<()>;
}

/// Capture service fed by hand: whoever holds it pushes transcript events
/// into the currently open session. Used by the daemon's console and by tests.
#[derive(Debug, Default)]
pub struct ManualCapture {
    sink: Mutex<Option<CaptureSink>>,
    config: Mutex<Option<CaptureConfig>>,
    starts: Mutex<u32>,
}

impl ManualCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an event into the open session. Returns false if none is open.
    pub fn push(&self, event: CaptureEvent) -> bool {
        match self.sink.lock().as_ref() {
            Some(sink) => sink.emit(event),
            None => {
                debug!("capture closed, event dropped");
                false
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Number of sessions opened so far
    pub fn starts(&self) -> u32 {
        *self.starts.lock()
    }

    pub fn config(&self) -> Option<CaptureConfig> {
        self.config.lock().clone()
    }

    /// Sink of the open session, for feeding events from elsewhere
    pub fn sink(&self) -> Option<CaptureSink> {
        self.sink.lock().clone()
    }
}

#[async_trait]
impl SpeechCapture for ManualCapture {
    async fn connect(&self) -> VoiceResult<()> {
        Ok(())
    }

    async fn configure(&self, config: &CaptureConfig) -> VoiceResult<()> {
        *self.config.lock() = Some(config.clone());
        Ok(())
    }

    async fn start(&self, sink: CaptureSink) -> VoiceResult<()> {
        *self.sink.lock() = Some(sink);
        *self.starts.lock() += 1;
        Ok(())
    }

    async fn stop(&self) -> VoiceResult<()> {
        self.sink.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_event_wire_shape() {
        let json = r#"{"type":"final","transcript":"hi","confidence":0.5,
                       "meta":{"restartCount":2,"correctedTime":1530.0}}"#;
        let event: CaptureEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            CaptureEvent::Final {
                transcript: "hi".into(),
                confidence: 0.5,
                meta: FinalMeta {
                    restart_count: 2,
                    corrected_time: Some(1530.0),
                },
            }
        );
    }

    #[test]
    fn stream_restart_wire_shape() {
        let event: CaptureEvent =
            serde_json::from_str(r#"{"type":"stream_restart","count":3}"#).unwrap();
        assert_eq!(event, CaptureEvent::StreamRestart { count: 3 });
    }

    #[test]
    fn config_serializes_camel_case() {
        let value = serde_json::to_value(CaptureConfig::default()).unwrap();
        assert_eq!(value["sampleRate"], 16000);
        assert_eq!(value["languageCode"], "en-US");
        assert_eq!(value["interimResults"], true);
        assert_eq!(value["singleUtterance"], false);
    }

    #[test]
    fn config_accepts_snake_case_keys() {
        let config: CaptureConfig =
            serde_json::from_str(r#"{"sample_rate":48000,"single_utterance":true}"#).unwrap();
        assert_eq!(config.sample_rate, 48000);
        assert!(config.single_utterance);
        assert_eq!(config.encoding, "LINEAR16");
    }

    #[tokio::test]
    async fn manual_capture_routes_to_open_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let capture = ManualCapture::new();
        assert!(!capture.push(CaptureEvent::End));

        capture
            .start(CaptureSink::new(CaptureId::new(4), tx))
            .await
            .unwrap();
        assert!(capture.push(CaptureEvent::AudioBridging));
        match rx.recv().await {
            Some(Input::Capture { capture: id, event }) => {
                assert_eq!(id, CaptureId::new(4));
                assert_eq!(event, CaptureEvent::AudioBridging);
            }
            other => panic!("unexpected {:?}", other),
        }

        capture.stop().await.unwrap();
        assert!(!capture.is_open());
    }
}
