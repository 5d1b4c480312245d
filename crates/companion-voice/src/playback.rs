//! Response audio playback.
//!
//! The orchestrator starts playback and then polls [`AudioPlayer::is_playing`]
//! until it reports false. `stop()` is the barge-in kill-switch: it clears
//! whatever is queued and falls silent immediately.

use crate::error::VoiceResult;
use companion_avatar::PcmAudio;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

pub trait AudioPlayer: Send + Sync {
    /// Start playing `audio`, replacing anything already playing
    fn play(&self, audio: &PcmAudio) -> VoiceResult<()>;

    /// Stop playback and clear the queue. Safe to call when idle.
    fn stop(&self);

    fn is_playing(&self) -> bool;
}

/// Player without an output device: "plays" for the audio's duration on the
/// tokio clock. Used by the headless daemon and by paused-time tests.
#[derive(Debug, Default)]
pub struct ClockPlayer {
    until: Mutex<Option<Instant>>,
    plays: Mutex<u32>,
}

impl ClockPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of clips started so far
    pub fn plays(&self) -> u32 {
        *self.plays.lock()
    }
}

impl AudioPlayer for ClockPlayer {
    fn play(&self, audio: &PcmAudio) -> VoiceResult<()> {
        *self.until.lock() = Some(Instant::now() + audio.duration());
        *self.plays.lock() += 1;
        debug!(duration = ?audio.duration(), "clock playback started");
        Ok(())
    }

    fn stop(&self) {
        self.until.lock().take();
    }

    fn is_playing(&self) -> bool {
        matches!(*self.until.lock(), Some(until) if Instant::now() < until)
    }
}

#[cfg(feature = "playback")]
pub use speaker::SpeakerPlayer;

#[cfg(feature = "playback")]
mod speaker {
    use super::AudioPlayer;
    use crate::error::{VoiceError, VoiceResult};
    use companion_avatar::PcmAudio;
    use rodio::buffer::SamplesBuffer;
    use rodio::{OutputStream, Sink};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use tracing::info;

    /// Plays response audio on the default output device.
    ///
    /// `rodio::OutputStream` is not `Send`, so a dedicated thread owns it for
    /// the player's lifetime; the player only holds the sink.
    pub struct SpeakerPlayer {
        sink: Arc<Sink>,
        _shutdown: mpsc::Sender<()>,
    }

    impl SpeakerPlayer {
        pub fn new() -> VoiceResult<Self> {
            let (ready_tx, ready_rx) = mpsc::channel::<VoiceResult<Arc<Sink>>>();
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

            thread::Builder::new()
                .name("companion-speaker".to_string())
                .spawn(move || {
                    let opened = OutputStream::try_default()
                        .map_err(|e| VoiceError::Playback(e.to_string()))
                        .and_then(|(stream, handle)| {
                            Sink::try_new(&handle)
                                .map(|sink| (stream, Arc::new(sink)))
                                .map_err(|e| VoiceError::Playback(e.to_string()))
                        });
                    match opened {
                        Ok((_stream, sink)) => {
                            if ready_tx.send(Ok(sink)).is_ok() {
                                // Keep the stream alive until the player is dropped
                                let _ = shutdown_rx.recv();
                            }
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                        }
                    }
                })
                .map_err(|e| VoiceError::Playback(format!("speaker thread: {}", e)))?;

            let sink = ready_rx
                .recv()
                .map_err(|_| VoiceError::Playback("speaker thread exited".to_string()))??;
            info!("🔊 Speaker ready for response playback");
            Ok(Self {
                sink,
                _shutdown: shutdown_tx,
            })
        }
    }

    impl AudioPlayer for SpeakerPlayer {
        fn play(&self, audio: &PcmAudio) -> VoiceResult<()> {
            self.sink.stop();
            if audio.is_empty() {
                return Ok(());
            }
            self.sink.append(SamplesBuffer::new(
                1,
                audio.sample_rate(),
                audio.samples().to_vec(),
            ));
            self.sink.play();
            Ok(())
        }

        fn stop(&self) {
            self.sink.stop();
            info!("🔇 Playback stopped");
        }

        fn is_playing(&self) -> bool {
            !self.sink.empty()
        }
    }
}
