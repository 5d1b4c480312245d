//! Conversation session: the turn-taking state machine.
//!
//! The session does no I/O. It consumes [`Input`]s and timer expirations and
//! answers with [`Command`]s for the driver to carry out, which keeps every
//! transition synchronous and testable without a runtime:
//!
//! ```text
//! Idle --start--> Listening --final/silence--> Processing --reply--> Responding
//!   ^                 ^                                                  |
//!   |                 +------------- continuous mode (after settle) -----+
//!   +--------------------------------- otherwise ------------------------+
//! ```
//!
//! Capture sessions and turns carry generation ids. Anything that arrives
//! for a capture or turn that is no longer current is dropped, so a late
//! collaborator response can never resurrect a finished turn.

use crate::capture::CaptureEvent;
use crate::config::ConversationConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::timers::{TimerKind, TimerRegistry};
use chrono::{DateTime, Utc};
use companion_avatar::PcmAudio;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Generation id of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CaptureId(u64);

impl CaptureId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Generation id of a dispatched turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TurnId(u64);

impl TurnId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    Listening,
    Processing,
    Responding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// A collaborator service could not be reached
    ServiceUnavailable,
    /// The turn timed out; the user should repeat themselves
    TryAgain,
    /// Input arrived while a turn was already in flight
    Busy,
    /// The reply could not be spoken and is shown as text only
    SpeechUnavailable,
}

/// What the conversation reports to the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    StateChanged {
        from: ConversationState,
        to: ConversationState,
    },
    Interim {
        text: String,
    },
    Dispatched {
        turn: TurnId,
        text: String,
        timestamp: DateTime<Utc>,
    },
    Reply {
        turn: TurnId,
        text: String,
        fallback: bool,
        timestamp: DateTime<Utc>,
    },
    Notice {
        kind: NoticeKind,
        message: String,
    },
    ContinuousModeChanged {
        enabled: bool,
    },
}

/// Everything that can happen to a session
#[derive(Debug)]
pub enum Input {
    Start,
    Stop,
    SetContinuous(bool),
    /// Typed turn; skips the confidence gate
    SubmitText(String),
    /// Barge-in while the reply is playing
    Interrupt,
    Capture {
        capture: CaptureId,
        event: CaptureEvent,
    },
    /// The capture service failed to open a session
    CaptureFailed {
        capture: CaptureId,
        error: VoiceError,
    },
    Reply {
        turn: TurnId,
        result: VoiceResult<String>,
    },
    Speech {
        turn: TurnId,
        result: VoiceResult<PcmAudio>,
    },
    /// Answer to [`Command::PollPlayback`]
    Playback {
        turn: TurnId,
        playing: bool,
    },
}

/// Side effects requested by the session
#[derive(Debug, Clone)]
pub enum Command {
    OpenCapture { capture: CaptureId },
    CloseCapture { capture: CaptureId },
    /// Stop response audio and return the avatar to idle
    StopSpeaking,
    Dispatch { turn: TurnId, text: String },
    Synthesize { turn: TurnId, text: String },
    /// Play the reply and start the avatar talking
    Speak { turn: TurnId, audio: PcmAudio },
    PollPlayback { turn: TurnId },
    /// Abort in-flight collaborator work for the turn
    CancelWork { turn: TurnId },
    Emit(ConversationEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnPhase {
    Dialog,
    Synthesis,
    Playback { polls: u32 },
}

#[derive(Debug, Clone, Copy)]
struct ActiveTurn {
    id: TurnId,
    phase: TurnPhase,
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: ConversationState,
    pub continuous_mode: bool,
    pub is_processing: bool,
    pub restart_count: u32,
    pub interim_text: String,
    pub final_transcript: String,
    pub capture_open: bool,
    pub turn: Option<TurnId>,
    pub pending_timers: usize,
}

pub struct ConversationSession {
    config: ConversationConfig,
    state: ConversationState,
    continuous_mode: bool,
    is_processing: bool,
    restart_count: u32,
    last_restart_at: Option<Instant>,
    interim_text: String,
    final_transcript: String,

    // Most recently opened capture, and whether it is still open
    capture: Option<CaptureId>,
    capture_open: bool,
    next_capture: u64,

    turn: Option<ActiveTurn>,
    next_turn: u64,

    timers: TimerRegistry,
}

impl ConversationSession {
    pub fn new(config: ConversationConfig) -> Self {
        let continuous_mode = config.continuous_mode;
        Self {
            config,
            state: ConversationState::Idle,
            continuous_mode,
            is_processing: false,
            restart_count: 0,
            last_restart_at: None,
            interim_text: String::new(),
            final_transcript: String::new(),
            capture: None,
            capture_open: false,
            next_capture: 0,
            turn: None,
            next_turn: 0,
            timers: TimerRegistry::new(),
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn continuous_mode(&self) -> bool {
        self.continuous_mode
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn last_restart_at(&self) -> Option<Instant> {
        self.last_restart_at
    }

    pub fn interim_text(&self) -> &str {
        &self.interim_text
    }

    pub fn final_transcript(&self) -> &str {
        &self.final_transcript
    }

    pub fn current_turn(&self) -> Option<TurnId> {
        self.turn.map(|t| t.id)
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            continuous_mode: self.continuous_mode,
            is_processing: self.is_processing,
            restart_count: self.restart_count,
            interim_text: self.interim_text.clone(),
            final_transcript: self.final_transcript.clone(),
            capture_open: self.capture_open,
            turn: self.current_turn(),
            pending_timers: self.timers.len(),
        }
    }

    /// Apply one input
    pub fn handle(&mut self, now: Instant, input: Input) -> Vec<Command> {
        let mut out = Vec::new();
        match input {
            Input::Start => self.start(now, &mut out),
            Input::Stop => self.stop(&mut out),
            Input::SetContinuous(enabled) => self.set_continuous(enabled, &mut out),
            Input::SubmitText(text) => self.submit_text(now, text, &mut out),
            Input::Interrupt => self.interrupt(now, &mut out),
            Input::Capture { capture, event } => self.on_capture(now, capture, event, &mut out),
            Input::CaptureFailed { capture, error } => {
                if self.capture == Some(capture) && self.capture_open {
                    self.capture_failed(error, &mut out);
                } else {
                    debug!(capture = capture.value(), "stale capture failure dropped");
                }
            }
            Input::Reply { turn, result } => self.on_reply(now, turn, result, &mut out),
            Input::Speech { turn, result } => self.on_speech(now, turn, result, &mut out),
            Input::Playback { turn, playing } => self.on_playback(now, turn, playing, &mut out),
        }
        out
    }

    /// Fire every timer due at `now`
    pub fn on_timeout(&mut self, now: Instant) -> Vec<Command> {
        let mut out = Vec::new();
        while let Some(kind) = self.timers.pop_due(now) {
            debug!(timer = ?kind, "timer fired");
            match kind {
                TimerKind::Silence => self.on_silence(now, &mut out),
                TimerKind::ResponseTimeout => self.on_response_timeout(&mut out),
                TimerKind::HardTimeout => self.on_hard_timeout(&mut out),
                TimerKind::ProcessingWatchdog => {
                    if self.is_processing {
                        warn!("⏱️ Processing flag stuck, clearing it");
                        self.is_processing = false;
                    }
                }
                TimerKind::PlaybackPoll => {
                    if let Some(turn) = self.turn.as_mut() {
                        if let TurnPhase::Playback { polls } = &mut turn.phase {
                            *polls += 1;
                            out.push(Command::PollPlayback { turn: turn.id });
                        }
                    }
                }
                TimerKind::ResumeListening => self.on_resume(now, &mut out),
            }
        }
        out
    }

    // ---------------------------------------------------------------------
    // Control
    // ---------------------------------------------------------------------

    fn start(&mut self, now: Instant, out: &mut Vec<Command>) {
        if self.state != ConversationState::Idle {
            debug!(state = ?self.state, "start ignored, conversation already running");
            return;
        }
        self.open_capture(now, out);
    }

    fn stop(&mut self, out: &mut Vec<Command>) {
        info!(state = ?self.state, "🛑 Stopping conversation");
        if let Some(turn) = self.turn.take() {
            out.push(Command::CancelWork { turn: turn.id });
            out.push(Command::StopSpeaking);
        }
        self.close_capture(out);
        self.timers.cancel_all();
        self.clear_buffers();
        self.is_processing = false;
        self.set_state(ConversationState::Idle, out);
    }

    fn set_continuous(&mut self, enabled: bool, out: &mut Vec<Command>) {
        if self.continuous_mode == enabled {
            return;
        }
        self.continuous_mode = enabled;
        info!(enabled, "🔁 Continuous mode changed");
        out.push(Command::Emit(ConversationEvent::ContinuousModeChanged { enabled }));

        if enabled {
            return;
        }
        if self.state == ConversationState::Listening {
            self.close_capture(out);
            self.timers.cancel(TimerKind::Silence);
            self.clear_buffers();
            self.set_state(ConversationState::Idle, out);
        } else if self.timers.cancel(TimerKind::ResumeListening) {
            self.set_state(ConversationState::Idle, out);
        }
    }

    fn submit_text(&mut self, now: Instant, text: String, out: &mut Vec<Command>) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        match self.state {
            ConversationState::Idle | ConversationState::Listening if !self.is_processing => {
                self.final_transcript = text.to_string();
                self.begin_turn(now, out);
            }
            _ => {
                debug!(state = ?self.state, "typed turn rejected while busy");
                out.push(Command::Emit(ConversationEvent::Notice {
                    kind: NoticeKind::Busy,
                    message: "Still working on the last message.".to_string(),
                }));
            }
        }
    }

    fn interrupt(&mut self, now: Instant, out: &mut Vec<Command>) {
        if self.state != ConversationState::Responding {
            return;
        }
        info!("✋ Reply interrupted");
        if let Some(turn) = self.turn.take() {
            out.push(Command::CancelWork { turn: turn.id });
        }
        out.push(Command::StopSpeaking);
        self.end_turn_bookkeeping();
        self.timers.cancel(TimerKind::ResumeListening);
        self.open_capture(now, out);
    }

    // ---------------------------------------------------------------------
    // Capture events
    // ---------------------------------------------------------------------

    fn on_capture(&mut self, now: Instant, capture: CaptureId, event: CaptureEvent, out: &mut Vec<Command>) {
        if self.capture != Some(capture) {
            debug!(capture = capture.value(), "event from old capture session dropped");
            return;
        }

        // Restarts belong to the transport and matter even after the capture
        // session was closed for the turn.
        match event {
            CaptureEvent::StreamRestart { count } => return self.on_stream_restart(now, count, out),
            CaptureEvent::AudioBridging => {
                debug!("audio bridging across stream restart");
                return;
            }
            _ => {}
        }

        if !self.capture_open || self.state != ConversationState::Listening {
            debug!(state = ?self.state, "transcript event outside listening dropped");
            return;
        }

        match event {
            CaptureEvent::Interim { transcript, confidence } => {
                debug!(confidence, "interim transcript");
                self.interim_text = transcript.clone();
                self.timers.arm(TimerKind::Silence, now, self.config.silence());
                out.push(Command::Emit(ConversationEvent::Interim { text: transcript }));
            }
            CaptureEvent::Final { transcript, confidence, meta } => {
                let transcript = transcript.trim();
                if transcript.is_empty() {
                    return;
                }
                if confidence > self.config.confidence_threshold {
                    debug!(confidence, restarts = meta.restart_count, "final transcript accepted");
                    self.final_transcript = transcript.to_string();
                    self.begin_turn(now, out);
                } else {
                    info!(
                        confidence,
                        threshold = self.config.confidence_threshold,
                        "low-confidence final transcript discarded"
                    );
                    self.interim_text.clear();
                    self.timers.cancel(TimerKind::Silence);
                }
            }
            CaptureEvent::End => {
                info!("🎤 Capture session ended");
                self.capture_open = false;
                if self.has_pending_text() {
                    self.promote_interim();
                    self.begin_turn(now, out);
                } else if self.continuous_mode {
                    self.open_capture(now, out);
                } else {
                    self.timers.cancel(TimerKind::Silence);
                    self.set_state(ConversationState::Idle, out);
                }
            }
            CaptureEvent::Error { message } => self.capture_failed(VoiceError::Capture(message), out),
            CaptureEvent::StreamRestart { .. } | CaptureEvent::AudioBridging => {}
        }
    }

    fn on_stream_restart(&mut self, now: Instant, count: u32, out: &mut Vec<Command>) {
        self.restart_count = count;
        self.last_restart_at = Some(now);
        let err = VoiceError::TransientStreamRestart(count);

        match self.state {
            ConversationState::Processing | ConversationState::Responding => {
                info!(count, state = ?self.state, "🔄 {}, abandoning turn", err);
                self.abandon_turn(out);
                if self.continuous_mode {
                    self.open_capture(now, out);
                } else {
                    self.set_state(ConversationState::Idle, out);
                }
            }
            _ => debug!(count, "{}", err),
        }
    }

    fn capture_failed(&mut self, err: VoiceError, out: &mut Vec<Command>) {
        warn!("🎤 Speech capture failed: {}", err);
        self.close_capture(out);
        self.timers.cancel(TimerKind::Silence);
        self.clear_buffers();
        let disabled = self.disable_continuous(out);
        self.notice(NoticeKind::ServiceUnavailable, &err, disabled, out);
        self.set_state(ConversationState::Idle, out);
    }

    fn on_silence(&mut self, now: Instant, out: &mut Vec<Command>) {
        if self.state != ConversationState::Listening {
            return;
        }
        if self.has_pending_text() {
            debug!("silence window elapsed, auto-dispatching");
            self.promote_interim();
            self.begin_turn(now, out);
        }
    }

    // ---------------------------------------------------------------------
    // Turn lifecycle
    // ---------------------------------------------------------------------

    fn begin_turn(&mut self, now: Instant, out: &mut Vec<Command>) {
        if self.is_processing || self.turn.is_some() {
            warn!("dispatch already in flight, transcript held");
            return;
        }

        self.close_capture(out);
        out.push(Command::StopSpeaking);
        self.timers.cancel(TimerKind::Silence);
        self.timers.cancel(TimerKind::ResumeListening);
        self.interim_text.clear();

        self.next_turn += 1;
        let id = TurnId(self.next_turn);
        self.turn = Some(ActiveTurn {
            id,
            phase: TurnPhase::Dialog,
        });
        self.is_processing = true;

        self.timers.arm(TimerKind::ResponseTimeout, now, self.config.response_timeout());
        // The hard timeout is armed once per turn and bounds the whole turn
        self.timers.arm(TimerKind::HardTimeout, now, self.config.hard_timeout());
        self.timers.arm(TimerKind::ProcessingWatchdog, now, self.config.processing_watchdog());

        self.set_state(ConversationState::Processing, out);
        let text = self.final_transcript.clone();
        info!(turn = id.value(), "📨 Dispatching: {}", text);
        out.push(Command::Emit(ConversationEvent::Dispatched {
            turn: id,
            text: text.clone(),
            timestamp: Utc::now(),
        }));
        out.push(Command::Dispatch { turn: id, text });
    }

    fn on_reply(&mut self, now: Instant, turn: TurnId, result: VoiceResult<String>, out: &mut Vec<Command>) {
        if !self.is_current(turn, TurnPhase::Dialog) {
            debug!(turn = turn.value(), "stale dialog reply dropped");
            return;
        }

        match result {
            Ok(text) if text.trim().is_empty() => {
                debug!(turn = turn.value(), "empty reply");
                self.finish_turn(now, out);
            }
            Ok(text) => {
                info!(turn = turn.value(), "💬 Reply received");
                out.push(Command::Emit(ConversationEvent::Reply {
                    turn,
                    text: text.clone(),
                    fallback: false,
                    timestamp: Utc::now(),
                }));
                self.set_phase(TurnPhase::Synthesis);
                self.set_state(ConversationState::Responding, out);
                out.push(Command::Synthesize { turn, text });
            }
            Err(err) => {
                warn!(turn = turn.value(), "Dialog failed: {}", err);
                let (kind, disabled) = match err {
                    VoiceError::ServiceUnavailable(_) => {
                        out.push(Command::Emit(ConversationEvent::Reply {
                            turn,
                            text: self.config.fallback_reply.clone(),
                            fallback: true,
                            timestamp: Utc::now(),
                        }));
                        (NoticeKind::ServiceUnavailable, self.disable_continuous(out))
                    }
                    _ => (NoticeKind::TryAgain, false),
                };
                self.notice(kind, &err, disabled, out);
                self.abandon_turn(out);
                self.set_state(ConversationState::Idle, out);
            }
        }
    }

    fn on_speech(&mut self, now: Instant, turn: TurnId, result: VoiceResult<PcmAudio>, out: &mut Vec<Command>) {
        if !self.is_current(turn, TurnPhase::Synthesis) {
            debug!(turn = turn.value(), "stale synthesis result dropped");
            return;
        }
        self.timers.cancel(TimerKind::ResponseTimeout);

        match result {
            Ok(audio) if audio.is_empty() => self.finish_turn(now, out),
            Ok(audio) => {
                debug!(turn = turn.value(), duration = ?audio.duration(), "🔊 Speaking reply");
                self.set_phase(TurnPhase::Playback { polls: 0 });
                self.timers.arm(TimerKind::PlaybackPoll, now, self.config.playback_poll_interval());
                out.push(Command::Speak { turn, audio });
            }
            Err(err) => {
                warn!(turn = turn.value(), "Speech synthesis failed, reply shown as text: {}", err);
                let disabled =
                    matches!(err, VoiceError::ServiceUnavailable(_)) && self.disable_continuous(out);
                self.notice(NoticeKind::SpeechUnavailable, &err, disabled, out);
                self.finish_turn(now, out);
            }
        }
    }

    fn on_playback(&mut self, now: Instant, turn: TurnId, playing: bool, out: &mut Vec<Command>) {
        let polls = match self.turn {
            Some(ActiveTurn {
                id,
                phase: TurnPhase::Playback { polls },
            }) if id == turn => polls,
            _ => {
                debug!(turn = turn.value(), "stale playback report dropped");
                return;
            }
        };

        if !playing {
            debug!(turn = turn.value(), polls, "playback finished");
        } else if polls >= self.config.playback_poll_attempts {
            warn!(turn = turn.value(), polls, "playback still running after poll limit, ending turn");
        } else {
            self.timers.arm(TimerKind::PlaybackPoll, now, self.config.playback_poll_interval());
            return;
        }

        out.push(Command::StopSpeaking);
        self.finish_turn(now, out);
    }

    fn on_response_timeout(&mut self, out: &mut Vec<Command>) {
        let waiting = matches!(
            self.turn,
            Some(ActiveTurn {
                phase: TurnPhase::Dialog | TurnPhase::Synthesis,
                ..
            })
        );
        if !waiting {
            return;
        }
        warn!("⏱️ Response timed out");
        self.notice(NoticeKind::TryAgain, &VoiceError::ProcessingTimeout, false, out);
        self.abandon_turn(out);
        self.set_state(ConversationState::Idle, out);
    }

    fn on_hard_timeout(&mut self, out: &mut Vec<Command>) {
        match self.state {
            ConversationState::Processing => {
                warn!("⏱️ Hard timeout while processing");
                self.notice(NoticeKind::TryAgain, &VoiceError::ProcessingTimeout, false, out);
            }
            ConversationState::Responding => {
                debug!("hard timeout while responding");
            }
            _ => return,
        }
        self.abandon_turn(out);
        self.close_capture(out);
        self.timers.cancel_all();
        self.set_state(ConversationState::Idle, out);
    }

    fn on_resume(&mut self, now: Instant, out: &mut Vec<Command>) {
        if self.turn.is_some() || self.state == ConversationState::Listening {
            return;
        }
        if self.continuous_mode {
            self.open_capture(now, out);
        } else {
            self.set_state(ConversationState::Idle, out);
        }
    }

    /// Normal end of a turn: listen again after the settle delay in
    /// continuous mode, otherwise go idle.
    fn finish_turn(&mut self, now: Instant, out: &mut Vec<Command>) {
        if let Some(turn) = self.turn {
            info!(turn = turn.id.value(), "✅ Turn complete");
        }
        self.end_turn_bookkeeping();
        if self.continuous_mode {
            self.timers.arm(TimerKind::ResumeListening, now, self.config.resume_settle());
        } else {
            self.set_state(ConversationState::Idle, out);
        }
    }

    /// Drop the current turn without finishing it. The caller picks the
    /// next state.
    fn abandon_turn(&mut self, out: &mut Vec<Command>) {
        if let Some(turn) = self.turn {
            out.push(Command::CancelWork { turn: turn.id });
        }
        out.push(Command::StopSpeaking);
        self.end_turn_bookkeeping();
        self.timers.cancel(TimerKind::ResumeListening);
    }

    fn end_turn_bookkeeping(&mut self) {
        self.turn = None;
        self.is_processing = false;
        self.clear_buffers();
        for kind in [
            TimerKind::ResponseTimeout,
            TimerKind::HardTimeout,
            TimerKind::ProcessingWatchdog,
            TimerKind::PlaybackPoll,
        ] {
            self.timers.cancel(kind);
        }
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn open_capture(&mut self, now: Instant, out: &mut Vec<Command>) {
        self.close_capture(out);
        self.next_capture += 1;
        let capture = CaptureId(self.next_capture);
        self.capture = Some(capture);
        self.capture_open = true;
        self.timers.cancel(TimerKind::ResumeListening);
        debug!(capture = capture.value(), "opening capture session");
        out.push(Command::OpenCapture { capture });
        self.set_state(ConversationState::Listening, out);
    }

    fn close_capture(&mut self, out: &mut Vec<Command>) {
        if let (Some(capture), true) = (self.capture, self.capture_open) {
            self.capture_open = false;
            out.push(Command::CloseCapture { capture });
        }
    }

    fn set_state(&mut self, to: ConversationState, out: &mut Vec<Command>) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        info!("🎭 Conversation {:?} -> {:?}", from, to);
        out.push(Command::Emit(ConversationEvent::StateChanged { from, to }));
    }

    fn set_phase(&mut self, phase: TurnPhase) {
        if let Some(turn) = self.turn.as_mut() {
            turn.phase = phase;
        }
    }

    fn is_current(&self, turn: TurnId, phase: TurnPhase) -> bool {
        matches!(self.turn, Some(t) if t.id == turn && t.phase == phase)
    }

    /// Returns whether continuous mode was on
    fn disable_continuous(&mut self, out: &mut Vec<Command>) -> bool {
        if !self.continuous_mode {
            return false;
        }
        self.continuous_mode = false;
        info!("🔁 Continuous mode disabled");
        out.push(Command::Emit(ConversationEvent::ContinuousModeChanged { enabled: false }));
        true
    }

    fn notice(&self, kind: NoticeKind, err: &VoiceError, continuous_disabled: bool, out: &mut Vec<Command>) {
        if let Some(mut message) = err.user_message() {
            if continuous_disabled {
                message.push_str(" Continuous mode has been turned off.");
            }
            out.push(Command::Emit(ConversationEvent::Notice { kind, message }));
        }
    }

    fn has_pending_text(&self) -> bool {
        !self.final_transcript.trim().is_empty() || !self.interim_text.trim().is_empty()
    }

    fn promote_interim(&mut self) {
        if self.final_transcript.trim().is_empty() {
            self.final_transcript = std::mem::take(&mut self.interim_text).trim().to_string();
        }
    }

    fn clear_buffers(&mut self) {
        self.interim_text.clear();
        self.final_transcript.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FinalMeta;
    use std::time::Duration;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn session() -> (ConversationSession, Instant) {
        (ConversationSession::new(ConversationConfig::default()), Instant::now())
    }

    fn continuous() -> (ConversationSession, Instant) {
        let config = ConversationConfig {
            continuous_mode: true,
            ..ConversationConfig::default()
        };
        (ConversationSession::new(config), Instant::now())
    }

    fn opened(cmds: &[Command]) -> Option<CaptureId> {
        cmds.iter().find_map(|c| match c {
            Command::OpenCapture { capture } => Some(*capture),
            _ => None,
        })
    }

    fn dispatched(cmds: &[Command]) -> Vec<(TurnId, String)> {
        cmds.iter()
            .filter_map(|c| match c {
                Command::Dispatch { turn, text } => Some((*turn, text.clone())),
                _ => None,
            })
            .collect()
    }

    fn notices(cmds: &[Command]) -> Vec<NoticeKind> {
        cmds.iter()
            .filter_map(|c| match c {
                Command::Emit(ConversationEvent::Notice { kind, .. }) => Some(*kind),
                _ => None,
            })
            .collect()
    }

    fn has(cmds: &[Command], pred: impl Fn(&Command) -> bool) -> bool {
        cmds.iter().any(pred)
    }

    fn interim(capture: CaptureId, text: &str) -> Input {
        Input::Capture {
            capture,
            event: CaptureEvent::Interim {
                transcript: text.into(),
                confidence: 0.6,
            },
        }
    }

    fn final_event(capture: CaptureId, text: &str, confidence: f32) -> Input {
        Input::Capture {
            capture,
            event: CaptureEvent::Final {
                transcript: text.into(),
                confidence,
                meta: FinalMeta::default(),
            },
        }
    }

    fn restart(capture: CaptureId, count: u32) -> Input {
        Input::Capture {
            capture,
            event: CaptureEvent::StreamRestart { count },
        }
    }

    fn audio() -> PcmAudio {
        PcmAudio::new(vec![0.1f32; 8000], 16000)
    }

    /// Start and return the opened capture id
    fn listen(s: &mut ConversationSession, now: Instant) -> CaptureId {
        opened(&s.handle(now, Input::Start)).expect("Failed to open capture")
    }

    /// Drive a confident final into Processing and return the turn
    fn process(s: &mut ConversationSession, now: Instant, text: &str) -> (CaptureId, TurnId) {
        let capture = listen(s, now);
        let cmds = s.handle(now, final_event(capture, text, 0.9));
        (capture, dispatched(&cmds)[0].0)
    }

    /// Drive a turn into Responding with the reply being synthesized
    fn respond(s: &mut ConversationSession, now: Instant) -> (CaptureId, TurnId) {
        let (capture, turn) = process(s, now, "hi");
        s.handle(now, Input::Reply { turn, result: Ok("hello there".into()) });
        (capture, turn)
    }

    #[test]
    fn start_opens_capture_and_listens() {
        let (mut s, t0) = session();
        let cmds = s.handle(t0, Input::Start);
        assert!(opened(&cmds).is_some());
        assert_eq!(s.state(), ConversationState::Listening);

        assert!(s.handle(t0, Input::Start).is_empty());
    }

    #[test]
    fn silence_after_interim_dispatches_exactly_once() {
        let (mut s, t0) = session();
        let capture = listen(&mut s, t0);
        s.handle(t0, interim(capture, "hello"));

        assert!(dispatched(&s.on_timeout(t0 + ms(1999))).is_empty());
        assert_eq!(s.state(), ConversationState::Listening);

        let cmds = s.on_timeout(t0 + ms(2000));
        let sent = dispatched(&cmds);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "hello");
        assert_eq!(s.state(), ConversationState::Processing);

        let mut later = Vec::new();
        for step in 1..=40 {
            later.extend(s.on_timeout(t0 + ms(2000 + step * 500)));
        }
        assert!(dispatched(&later).is_empty());
    }

    #[test]
    fn each_interim_restarts_the_silence_window() {
        let (mut s, t0) = session();
        let capture = listen(&mut s, t0);
        s.handle(t0, interim(capture, "hel"));
        s.handle(t0 + ms(1500), interim(capture, "hello wor"));

        assert!(dispatched(&s.on_timeout(t0 + ms(2500))).is_empty());
        let sent = dispatched(&s.on_timeout(t0 + ms(3500)));
        assert_eq!(sent[0].1, "hello wor");
    }

    #[test]
    fn low_confidence_final_is_not_dispatched() {
        let (mut s, t0) = session();
        let capture = listen(&mut s, t0);
        s.handle(t0, interim(capture, "mumble"));

        let cmds = s.handle(t0, final_event(capture, "mumble", 0.10));
        assert!(dispatched(&cmds).is_empty());
        assert_eq!(s.state(), ConversationState::Listening);

        // The discarded utterance doesn't come back through the silence timer
        assert!(dispatched(&s.on_timeout(t0 + ms(5000))).is_empty());
        assert_eq!(s.state(), ConversationState::Listening);

        let cmds = s.handle(t0, final_event(capture, "borderline", 0.15));
        assert!(dispatched(&cmds).is_empty());
    }

    #[test]
    fn confident_final_goes_processing_then_responding() {
        let (mut s, t0) = session();
        let capture = listen(&mut s, t0);

        let cmds = s.handle(t0, final_event(capture, "hi", 0.5));
        assert_eq!(s.state(), ConversationState::Processing);
        assert!(s.is_processing());
        assert!(has(&cmds, |c| matches!(c, Command::CloseCapture { capture: id } if *id == capture)));
        assert!(has(&cmds, |c| matches!(c, Command::StopSpeaking)));
        let (turn, text) = dispatched(&cmds)[0].clone();
        assert_eq!(text, "hi");
        assert!(s.timers().is_armed(TimerKind::ResponseTimeout));
        assert!(s.timers().is_armed(TimerKind::HardTimeout));
        assert!(s.timers().is_armed(TimerKind::ProcessingWatchdog));

        let cmds = s.handle(t0 + ms(800), Input::Reply { turn, result: Ok("hello!".into()) });
        assert_eq!(s.state(), ConversationState::Responding);
        assert!(has(&cmds, |c| matches!(c, Command::Synthesize { text, .. } if text == "hello!")));
    }

    #[test]
    fn full_turn_plays_reply_then_goes_idle() {
        let (mut s, t0) = session();
        let (_, turn) = respond(&mut s, t0);

        let cmds = s.handle(t0 + ms(1000), Input::Speech { turn, result: Ok(audio()) });
        assert!(has(&cmds, |c| matches!(c, Command::Speak { .. })));
        assert!(!s.timers().is_armed(TimerKind::ResponseTimeout));

        let cmds = s.on_timeout(t0 + ms(1500));
        assert!(has(&cmds, |c| matches!(c, Command::PollPlayback { .. })));
        s.handle(t0 + ms(1500), Input::Playback { turn, playing: true });

        s.on_timeout(t0 + ms(2000));
        let cmds = s.handle(t0 + ms(2000), Input::Playback { turn, playing: false });
        assert!(has(&cmds, |c| matches!(c, Command::StopSpeaking)));
        assert_eq!(s.state(), ConversationState::Idle);
        assert!(!s.is_processing());
        assert!(s.final_transcript().is_empty());
        assert!(s.timers().is_empty());
    }

    #[test]
    fn continuous_mode_resumes_listening_after_settle() {
        let (mut s, t0) = continuous();
        let (first, turn) = respond(&mut s, t0);
        s.handle(t0, Input::Speech { turn, result: Ok(audio()) });
        s.on_timeout(t0 + ms(500));
        s.handle(t0 + ms(500), Input::Playback { turn, playing: false });

        assert_eq!(s.state(), ConversationState::Responding);
        assert!(s.current_turn().is_none());
        assert!(s.on_timeout(t0 + ms(1000)).is_empty());

        let cmds = s.on_timeout(t0 + ms(1100));
        let reopened = opened(&cmds).expect("Failed to reopen capture");
        assert_ne!(reopened, first);
        assert_eq!(s.state(), ConversationState::Listening);
    }

    #[test]
    fn stream_restart_while_processing_in_continuous_mode_listens() {
        let (mut s, t0) = continuous();
        let (capture, turn) = process(&mut s, t0, "hi");

        let cmds = s.handle(t0 + ms(300), restart(capture, 1));
        assert!(!s.is_processing());
        assert_eq!(s.state(), ConversationState::Listening);
        assert!(has(&cmds, |c| matches!(c, Command::CancelWork { turn: t } if *t == turn)));
        assert!(opened(&cmds).is_some());
        assert!(notices(&cmds).is_empty());
        assert_eq!(s.restart_count(), 1);
        assert!(s.last_restart_at().is_some());

        // The abandoned dialog reply is ignored
        let cmds = s.handle(t0 + ms(900), Input::Reply { turn, result: Ok("late".into()) });
        assert!(cmds.is_empty());
        assert_eq!(s.state(), ConversationState::Listening);
    }

    #[test]
    fn stream_restart_while_processing_otherwise_goes_idle() {
        let (mut s, t0) = session();
        let (capture, _) = process(&mut s, t0, "hi");

        let cmds = s.handle(t0 + ms(300), restart(capture, 2));
        assert!(!s.is_processing());
        assert_eq!(s.state(), ConversationState::Idle);
        assert!(opened(&cmds).is_none());
        assert!(notices(&cmds).is_empty());
        assert!(s.timers().is_empty());
    }

    #[test]
    fn stream_restart_while_responding_abandons_playback() {
        let (mut s, t0) = session();
        let (capture, turn) = respond(&mut s, t0);
        s.handle(t0, Input::Speech { turn, result: Ok(audio()) });

        let cmds = s.handle(t0 + ms(200), restart(capture, 1));
        assert!(has(&cmds, |c| matches!(c, Command::StopSpeaking)));
        assert_eq!(s.state(), ConversationState::Idle);
    }

    #[test]
    fn stream_restart_while_listening_keeps_the_transcript() {
        let (mut s, t0) = session();
        let capture = listen(&mut s, t0);
        s.handle(t0, interim(capture, "hello"));
        s.handle(t0 + ms(100), restart(capture, 1));

        assert_eq!(s.state(), ConversationState::Listening);
        assert_eq!(s.interim_text(), "hello");
        assert_eq!(dispatched(&s.on_timeout(t0 + ms(2000)))[0].1, "hello");
    }

    #[test]
    fn events_from_a_closed_capture_are_dropped() {
        let (mut s, t0) = continuous();
        let (old, _) = process(&mut s, t0, "hi");
        s.handle(t0, restart(old, 1));
        assert_eq!(s.state(), ConversationState::Listening);

        let cmds = s.handle(t0, final_event(old, "ghost", 0.9));
        assert!(cmds.is_empty());
        assert_eq!(s.state(), ConversationState::Listening);
    }

    #[test]
    fn stop_from_any_state_leaves_nothing_behind() {
        let builders: Vec<fn(&mut ConversationSession, Instant)> = vec![
            |_, _| {},
            |s, t| {
                let c = listen(s, t);
                s.handle(t, interim(c, "half a sent"));
            },
            |s, t| {
                process(s, t, "hi");
            },
            |s, t| {
                respond(s, t);
            },
            |s, t| {
                let (_, turn) = respond(s, t);
                s.handle(t, Input::Speech { turn, result: Ok(audio()) });
            },
        ];

        for build in builders {
            let (mut s, t0) = continuous();
            build(&mut s, t0);
            s.handle(t0, Input::Stop);

            let snap = s.snapshot();
            assert_eq!(snap.state, ConversationState::Idle);
            assert!(snap.interim_text.is_empty());
            assert!(snap.final_transcript.is_empty());
            assert!(!snap.is_processing);
            assert!(!snap.capture_open);
            assert_eq!(snap.turn, None);
            assert_eq!(snap.pending_timers, 0);
            assert!(s.on_timeout(t0 + ms(60_000)).is_empty());
        }
    }

    #[test]
    fn dialog_outage_falls_back_and_disables_continuous_mode() {
        let (mut s, t0) = continuous();
        let (_, turn) = process(&mut s, t0, "hi");

        let cmds = s.handle(
            t0 + ms(100),
            Input::Reply {
                turn,
                result: Err(VoiceError::ServiceUnavailable("connection refused".into())),
            },
        );
        assert!(has(&cmds, |c| matches!(
            c,
            Command::Emit(ConversationEvent::Reply { fallback: true, .. })
        )));
        assert!(has(&cmds, |c| matches!(
            c,
            Command::Emit(ConversationEvent::ContinuousModeChanged { enabled: false })
        )));
        assert_eq!(notices(&cmds), vec![NoticeKind::ServiceUnavailable]);
        assert!(!s.continuous_mode());
        assert_eq!(s.state(), ConversationState::Idle);
        assert!(s.timers().is_empty());
    }

    #[test]
    fn response_timeout_asks_to_try_again() {
        let (mut s, t0) = continuous();
        let (_, turn) = process(&mut s, t0, "hi");

        let cmds = s.on_timeout(t0 + ms(15_000));
        assert_eq!(notices(&cmds), vec![NoticeKind::TryAgain]);
        assert!(has(&cmds, |c| matches!(c, Command::CancelWork { turn: t } if *t == turn)));
        assert_eq!(s.state(), ConversationState::Idle);
        assert!(s.final_transcript().is_empty());
        assert!(s.timers().is_empty());
    }

    #[test]
    fn hard_timeout_counts_from_dispatch_not_from_the_reply() {
        let (mut s, t0) = session();
        let (_, turn) = process(&mut s, t0, "hi");

        s.handle(t0 + ms(9_000), Input::Reply { turn, result: Ok("long answer".into()) });
        s.handle(t0 + ms(14_000), Input::Speech { turn, result: Ok(audio()) });
        s.on_timeout(t0 + ms(14_500));
        s.handle(t0 + ms(14_500), Input::Playback { turn, playing: true });
        assert_eq!(s.state(), ConversationState::Responding);

        s.on_timeout(t0 + ms(15_000));
        assert_eq!(s.state(), ConversationState::Idle);

        // Later playback reports belong to a finished turn
        for step in 1..=14 {
            let now = t0 + ms(15_000 + step * 500);
            assert!(s.on_timeout(now).is_empty());
            assert!(s.handle(now, Input::Playback { turn, playing: true }).is_empty());
        }
        assert_eq!(s.state(), ConversationState::Idle);
    }

    #[test]
    fn hard_timeout_while_responding_goes_idle_quietly() {
        let (mut s, t0) = continuous();
        let (_, turn) = process(&mut s, t0, "hi");
        s.handle(t0 + ms(14_500), Input::Reply { turn, result: Ok("just in time".into()) });
        s.handle(t0 + ms(14_600), Input::Speech { turn, result: Ok(audio()) });
        assert_eq!(s.state(), ConversationState::Responding);

        let cmds = s.on_timeout(t0 + ms(15_000));
        assert!(notices(&cmds).is_empty());
        assert!(has(&cmds, |c| matches!(c, Command::CancelWork { turn: t } if *t == turn)));
        assert!(has(&cmds, |c| matches!(c, Command::StopSpeaking)));
        assert_eq!(s.state(), ConversationState::Idle);
        assert!(s.current_turn().is_none());
        assert!(!s.is_processing());
        assert!(s.timers().is_empty());
        assert!(s.continuous_mode());

        // No poll and no resume are left over
        assert!(s.on_timeout(t0 + ms(30_000)).is_empty());
        assert_eq!(s.state(), ConversationState::Idle);
    }

    #[test]
    fn dialog_error_other_than_outage_asks_to_try_again() {
        let (mut s, t0) = continuous();
        let (_, turn) = process(&mut s, t0, "hi");

        let cmds = s.handle(
            t0 + ms(100),
            Input::Reply {
                turn,
                result: Err(VoiceError::Decode("reply was not JSON".into())),
            },
        );
        assert_eq!(notices(&cmds), vec![NoticeKind::TryAgain]);
        assert!(!has(&cmds, |c| matches!(
            c,
            Command::Emit(ConversationEvent::Reply { fallback: true, .. })
        )));
        assert!(s.continuous_mode());
        assert_eq!(s.state(), ConversationState::Idle);
    }

    #[test]
    fn outage_notice_mentions_continuous_mode_only_when_it_was_on() {
        let message = |cmds: &[Command]| {
            cmds.iter()
                .find_map(|c| match c {
                    Command::Emit(ConversationEvent::Notice { message, .. }) => Some(message.clone()),
                    _ => None,
                })
                .expect("Failed to find notice")
        };
        let outage = || Err(VoiceError::ServiceUnavailable("connection refused".into()));

        let (mut s, t0) = continuous();
        let (_, turn) = process(&mut s, t0, "hi");
        let cmds = s.handle(t0, Input::Reply { turn, result: outage() });
        assert!(message(&cmds).contains("Continuous mode has been turned off"));

        let (mut s, t0) = session();
        let (_, turn) = process(&mut s, t0, "hi");
        let cmds = s.handle(t0, Input::Reply { turn, result: outage() });
        assert!(!message(&cmds).contains("Continuous"));
    }

    #[test]
    fn failed_capture_open_is_reported_as_outage() {
        let (mut s, t0) = continuous();
        let capture = listen(&mut s, t0);

        let cmds = s.handle(
            t0,
            Input::CaptureFailed {
                capture,
                error: VoiceError::Capture("microphone permission denied".into()),
            },
        );
        assert_eq!(notices(&cmds), vec![NoticeKind::ServiceUnavailable]);
        assert!(!s.continuous_mode());
        assert_eq!(s.state(), ConversationState::Idle);
        assert!(!s.snapshot().capture_open);
    }

    #[test]
    fn watchdog_only_clears_the_processing_flag() {
        let (mut s, t0) = session();
        process(&mut s, t0, "hi");

        s.on_timeout(t0 + ms(5000));
        assert!(!s.is_processing());
        assert_eq!(s.state(), ConversationState::Processing);
        assert!(s.current_turn().is_some());
    }

    #[test]
    fn synthesis_failure_finishes_as_text_only() {
        let (mut s, t0) = session();
        let (_, turn) = respond(&mut s, t0);

        let cmds = s.handle(
            t0,
            Input::Speech {
                turn,
                result: Err(VoiceError::TextTooLong { len: 6000, max: 5000 }),
            },
        );
        assert_eq!(notices(&cmds), vec![NoticeKind::SpeechUnavailable]);
        assert!(!has(&cmds, |c| matches!(c, Command::Speak { .. })));
        assert_eq!(s.state(), ConversationState::Idle);
    }

    #[test]
    fn playback_polling_gives_up_after_the_attempt_limit() {
        let config = ConversationConfig {
            hard_timeout_ms: 60_000,
            ..ConversationConfig::default()
        };
        let (mut s, t0) = (ConversationSession::new(config), Instant::now());
        let (_, turn) = respond(&mut s, t0);
        s.handle(t0, Input::Speech { turn, result: Ok(audio()) });

        let mut now = t0;
        for _ in 0..29 {
            now += ms(500);
            s.on_timeout(now);
            s.handle(now, Input::Playback { turn, playing: true });
            assert_eq!(s.state(), ConversationState::Responding);
        }
        now += ms(500);
        s.on_timeout(now);
        let cmds = s.handle(now, Input::Playback { turn, playing: true });
        assert!(has(&cmds, |c| matches!(c, Command::StopSpeaking)));
        assert_eq!(s.state(), ConversationState::Idle);
    }

    #[test]
    fn typed_turn_is_rejected_while_busy() {
        let (mut s, t0) = session();
        process(&mut s, t0, "hi");

        let cmds = s.handle(t0, Input::SubmitText("another".into()));
        assert!(dispatched(&cmds).is_empty());
        assert_eq!(notices(&cmds), vec![NoticeKind::Busy]);
    }

    #[test]
    fn typed_turn_from_idle_skips_capture() {
        let (mut s, t0) = session();
        let cmds = s.handle(t0, Input::SubmitText("  what's up  ".into()));
        assert_eq!(dispatched(&cmds)[0].1, "what's up");
        assert_eq!(s.state(), ConversationState::Processing);
        assert!(!has(&cmds, |c| matches!(c, Command::CloseCapture { .. })));
    }

    #[test]
    fn interrupt_while_responding_reopens_capture() {
        let (mut s, t0) = session();
        let (_, turn) = respond(&mut s, t0);
        s.handle(t0, Input::Speech { turn, result: Ok(audio()) });

        let cmds = s.handle(t0 + ms(200), Input::Interrupt);
        assert!(has(&cmds, |c| matches!(c, Command::StopSpeaking)));
        assert!(opened(&cmds).is_some());
        assert_eq!(s.state(), ConversationState::Listening);
        assert!(s.current_turn().is_none());
    }

    #[test]
    fn turning_continuous_off_while_listening_tears_down() {
        let (mut s, t0) = continuous();
        let capture = listen(&mut s, t0);
        s.handle(t0, interim(capture, "wait"));

        let cmds = s.handle(t0, Input::SetContinuous(false));
        assert!(has(&cmds, |c| matches!(c, Command::CloseCapture { .. })));
        assert_eq!(s.state(), ConversationState::Idle);
        assert!(s.interim_text().is_empty());
        assert!(s.timers().is_empty());
    }

    #[test]
    fn capture_end_dispatches_pending_interim() {
        let (mut s, t0) = session();
        let capture = listen(&mut s, t0);
        s.handle(t0, interim(capture, "good night"));

        let cmds = s.handle(t0, Input::Capture { capture, event: CaptureEvent::End });
        assert_eq!(dispatched(&cmds)[0].1, "good night");
        assert!(!has(&cmds, |c| matches!(c, Command::CloseCapture { .. })));
    }

    #[test]
    fn capture_error_while_listening_is_a_service_outage() {
        let (mut s, t0) = continuous();
        let capture = listen(&mut s, t0);

        let cmds = s.handle(
            t0,
            Input::Capture {
                capture,
                event: CaptureEvent::Error { message: "socket closed".into() },
            },
        );
        assert_eq!(notices(&cmds), vec![NoticeKind::ServiceUnavailable]);
        assert!(!s.continuous_mode());
        assert_eq!(s.state(), ConversationState::Idle);
    }
}
