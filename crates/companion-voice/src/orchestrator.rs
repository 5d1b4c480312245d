//! Conversation Orchestrator - the async driver around [`ConversationSession`]
//!
//! One task owns the session. Everything that happens to it (control calls,
//! capture events, collaborator results) arrives on a single inbox and is
//! applied in arrival order; timers are served from the session's registry.
//! The commands the session answers with are carried out here:
//! - capture open/close go to a sequential capture worker
//! - dialog and synthesis run as spawned tasks, aborted on cancel
//! - playback and avatar calls are made inline

use crate::avatar::AvatarPort;
use crate::capture::{CaptureConfig, CaptureSink, SpeechCapture};
use crate::config::{CompanionConfig, ConversationConfig};
use crate::dialog::DialogService;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::AudioPlayer;
use crate::session::{
    CaptureId, Command, ConversationEvent, ConversationSession, Input, SessionSnapshot, TurnId,
};
use crate::tts::{SpeechSynthesizer, VoiceConfig};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// External services the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub capture: Arc<dyn SpeechCapture>,
    pub dialog: Arc<dyn DialogService>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub player: Arc<dyn AudioPlayer>,
    pub avatar: Arc<dyn AvatarPort>,
}

/// Cheap, clonable control surface for a running orchestrator
#[derive(Clone)]
pub struct OrchestratorHandle {
    inbox: mpsc::UnboundedSender<Input>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl OrchestratorHandle {
    /// Begin listening
    pub fn start(&self) -> VoiceResult<()> {
        self.send(Input::Start)
    }

    /// Stop everything and return to idle. Always safe to call.
    pub fn stop(&self) -> VoiceResult<()> {
        self.send(Input::Stop)
    }

    pub fn set_continuous_mode(&self, enabled: bool) -> VoiceResult<()> {
        self.send(Input::SetContinuous(enabled))
    }

    /// Send a typed turn
    pub fn submit_text(&self, text: impl Into<String>) -> VoiceResult<()> {
        self.send(Input::SubmitText(text.into()))
    }

    /// Cut the reply short and listen again
    pub fn interrupt(&self) -> VoiceResult<()> {
        self.send(Input::Interrupt)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that is notified on every session change
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    fn send(&self, input: Input) -> VoiceResult<()> {
        self.inbox
            .send(input)
            .map_err(|e| VoiceError::ChannelSend(format!("orchestrator stopped: {:?}", e.0)))
    }
}

/// The running conversation system
pub struct ConversationOrchestrator {
    handle: OrchestratorHandle,
    events_rx: Option<mpsc::UnboundedReceiver<ConversationEvent>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<()>>,
}

impl ConversationOrchestrator {
    /// Spawn the driver on the current tokio runtime
    pub fn spawn(config: &CompanionConfig, collaborators: Collaborators) -> Self {
        info!("🎭 Initializing Conversation Orchestrator");

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let session = ConversationSession::new(config.conversation.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());

        let capture_tx = spawn_capture_worker(
            Arc::clone(&collaborators.capture),
            config.capture.clone(),
            inbox_tx.clone(),
        );

        let driver = Driver {
            session,
            conversation: config.conversation.clone(),
            voice: config.voice.clone(),
            collaborators,
            inbox_tx: inbox_tx.clone(),
            events_tx,
            snapshot_tx,
            capture_tx,
            work: HashMap::new(),
        };
        let task = tokio::spawn(driver.run(inbox_rx, shutdown_rx));

        info!("✅ Conversation Orchestrator running");
        Self {
            handle: OrchestratorHandle {
                inbox: inbox_tx,
                snapshot: snapshot_rx,
            },
            events_rx: Some(events_rx),
            shutdown_tx: Some(shutdown_tx),
            driver: Some(task),
        }
    }

    pub fn handle(&self) -> OrchestratorHandle {
        self.handle.clone()
    }

    /// Get the conversation event receiver. Can be taken once.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ConversationEvent>> {
        self.events_rx.take()
    }

    pub fn is_running(&self) -> bool {
        self.driver.as_ref().is_some_and(|d| !d.is_finished())
    }

    /// Stop the conversation and wait for the driver to wind down
    pub async fn shutdown(&mut self) -> VoiceResult<()> {
        info!("🛑 Shutting down Conversation Orchestrator");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.driver.take() {
            if let Err(e) = task.await {
                error!("Orchestrator driver failed: {}", e);
                return Err(VoiceError::ChannelSend(e.to_string()));
            }
        }
        info!("✅ Conversation Orchestrator stopped");
        Ok(())
    }
}

impl Drop for ConversationOrchestrator {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

enum CaptureOp {
    Open(CaptureId),
    Close(CaptureId),
}

/// Capture calls run one at a time, in the order the session issued them,
/// so a close can never overtake the open it belongs to.
fn spawn_capture_worker(
    capture: Arc<dyn SpeechCapture>,
    config: CaptureConfig,
    inbox: mpsc::UnboundedSender<Input>,
) -> mpsc::UnboundedSender<CaptureOp> {
    let (tx, mut rx) = mpsc::unbounded_channel::<CaptureOp>();
    tokio::spawn(async move {
        let mut connected = false;
        // Set once connecting fails in a way retrying can't fix
        let mut fatal: Option<String> = None;
        while let Some(op) = rx.recv().await {
            match op {
                CaptureOp::Open(id) => {
                    if let Some(reason) = &fatal {
                        let error = VoiceError::Capture(reason.clone());
                        let _ = inbox.send(Input::CaptureFailed { capture: id, error });
                        continue;
                    }
                    if !connected {
                        let ready = match capture.connect().await {
                            Ok(()) => capture.configure(&config).await,
                            Err(e) => Err(e),
                        };
                        if let Err(error) = ready {
                            if error.is_recoverable() {
                                warn!("🎤 Speech capture unavailable: {}", error);
                            } else {
                                error!("🎤 Speech capture disabled: {}", error);
                                fatal = Some(error.to_string());
                            }
                            let _ = inbox.send(Input::CaptureFailed { capture: id, error });
                            continue;
                        }
                        connected = true;
                        info!("🎤 Speech capture connected");
                    }
                    if let Err(error) = capture.start(CaptureSink::new(id, inbox.clone())).await {
                        warn!(capture = id.value(), "🎤 Capture failed to start: {}", error);
                        let _ = inbox.send(Input::CaptureFailed { capture: id, error });
                    }
                }
                CaptureOp::Close(id) => {
                    if let Err(e) = capture.stop().await {
                        warn!(capture = id.value(), "Capture stop failed: {}", e);
                    }
                }
            }
        }
        debug!("capture worker ended");
    });
    tx
}

struct Driver {
    session: ConversationSession,
    conversation: ConversationConfig,
    voice: VoiceConfig,
    collaborators: Collaborators,
    inbox_tx: mpsc::UnboundedSender<Input>,
    events_tx: mpsc::UnboundedSender<ConversationEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    capture_tx: mpsc::UnboundedSender<CaptureOp>,
    work: HashMap<TurnId, Vec<JoinHandle<()>>>,
}

impl Driver {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Input>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            let deadline = self.session.next_deadline().map(Instant::from_std);
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                input = inbox.recv() => match input {
                    Some(input) => {
                        let now = Instant::now().into_std();
                        let commands = self.session.handle(now, input);
                        self.execute(commands);
                    }
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let now = Instant::now().into_std();
                    let commands = self.session.on_timeout(now);
                    self.execute(commands);
                }
            }
            self.publish();
        }

        let now = Instant::now().into_std();
        let commands = self.session.handle(now, Input::Stop);
        self.execute(commands);
        self.publish();
        for (_, tasks) in self.work.drain() {
            tasks.iter().for_each(JoinHandle::abort);
        }
        debug!("orchestrator driver ended");
    }

    fn publish(&self) {
        let snapshot = self.session.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    /// Carry out commands. Answers that are available immediately (playback
    /// polls) are fed straight back so they keep their place in line.
    fn execute(&mut self, commands: Vec<Command>) {
        let mut queue: VecDeque<Command> = commands.into();
        while let Some(command) = queue.pop_front() {
            match command {
                Command::OpenCapture { capture } => {
                    let _ = self.capture_tx.send(CaptureOp::Open(capture));
                }
                Command::CloseCapture { capture } => {
                    let _ = self.capture_tx.send(CaptureOp::Close(capture));
                }
                Command::StopSpeaking => {
                    self.collaborators.player.stop();
                    if let Err(e) = self.collaborators.avatar.stop_talking() {
                        log_avatar_error("stop talking", &e);
                    }
                }
                Command::Dispatch { turn, text } => {
                    let dialog = Arc::clone(&self.collaborators.dialog);
                    let user_id = self.conversation.user_id.clone();
                    let inbox = self.inbox_tx.clone();
                    let task = tokio::spawn(async move {
                        let result = dialog.send(&user_id, &text).await;
                        let _ = inbox.send(Input::Reply { turn, result });
                    });
                    self.track(turn, task);
                }
                Command::Synthesize { turn, text } => {
                    let synthesizer = Arc::clone(&self.collaborators.synthesizer);
                    let voice = self.voice.clone();
                    let inbox = self.inbox_tx.clone();
                    let task = tokio::spawn(async move {
                        let result = synthesizer.synthesize(&text, &voice).await;
                        let _ = inbox.send(Input::Speech { turn, result });
                    });
                    self.track(turn, task);
                }
                Command::Speak { turn, audio } => {
                    self.work.remove(&turn);
                    if let Err(e) = self.collaborators.player.play(&audio) {
                        warn!(turn = turn.value(), "Playback failed: {}", e);
                    }
                    if let Err(e) = self.collaborators.avatar.start_talking(Some(audio)) {
                        log_avatar_error("start talking", &e);
                    }
                }
                Command::PollPlayback { turn } => {
                    let playing = self.collaborators.player.is_playing();
                    let now = Instant::now().into_std();
                    queue.extend(self.session.handle(now, Input::Playback { turn, playing }));
                }
                Command::CancelWork { turn } => {
                    if let Some(tasks) = self.work.remove(&turn) {
                        debug!(turn = turn.value(), tasks = tasks.len(), "cancelling turn work");
                        tasks.iter().for_each(JoinHandle::abort);
                    }
                }
                Command::Emit(event) => {
                    let _ = self.events_tx.send(event);
                }
            }
        }
    }

    fn track(&mut self, turn: TurnId, task: JoinHandle<()>) {
        self.work.retain(|_, tasks| {
            tasks.retain(|t| !t.is_finished());
            !tasks.is_empty()
        });
        self.work.entry(turn).or_default().push(task);
    }
}

fn log_avatar_error(action: &str, err: &VoiceError) {
    match err {
        VoiceError::Avatar(e) if e.is_benign() => debug!("avatar {}: {}", action, e),
        _ => warn!("Avatar failed to {}: {}", action, err),
    }
}
