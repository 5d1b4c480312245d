//! Companion daemon (headless runtime)
//!
//! Wires the conversation orchestrator to a headless avatar and drives the
//! avatar's render tick. Lines typed on stdin stand in for the speech
//! recognizer while capture is open, and are sent as typed turns otherwise.
//!
//! Console commands: `/start`, `/stop`, `/continuous on|off`, `/interrupt`,
//! `/play <clip>`, `/state`, `/quit`.

use anyhow::Context;
use companion_avatar::{
    AnimationService, CharacterId, ClipRef, HeadlessScene, ModelRef, OneShotOptions, JAW_OPEN,
    MOUTH_OPEN, TEETH_MOUTH_OPEN,
};
use companion_voice::{
    AudioPlayer, CaptureEvent, Collaborators, CompanionConfig, ConversationEvent,
    ConversationOrchestrator, DialogService, FinalMeta, HttpDialogClient, HttpSpeechSynthesizer,
    ManualCapture, OrchestratorHandle, PlaceholderDialog, PlaceholderSynthesizer, SharedAvatar,
    SharedService, SpeechSynthesizer,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Render rate of the headless avatar
const DEFAULT_FRAME_RATE: u64 = 30;

const AVATAR_MODEL: &str = "avatars/companion.glb";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[companion-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CompanionConfig::load().context("load companion config")?;
    let frame_rate = std::env::var("COMPANION_FRAME_RATE")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_FRAME_RATE)
        .clamp(1, 240);

    let (avatar, character) = load_avatar(&config).context("load avatar")?;
    let capture = Arc::new(ManualCapture::new());

    let mut orchestrator = ConversationOrchestrator::spawn(
        &config,
        Collaborators {
            capture: capture.clone(),
            dialog: dialog_service(),
            synthesizer: speech_synthesizer(),
            player: audio_player()?,
            avatar: Arc::new(SharedAvatar::new(Arc::clone(&avatar), Some(character))),
        },
    );
    let mut events = orchestrator
        .take_event_receiver()
        .context("event receiver already taken")?;
    let handle = orchestrator.handle();

    tracing::info!(
        frame_rate,
        continuous_mode = config.conversation.continuous_mode,
        character = %character,
        "Companion daemon started"
    );

    let frame = Duration::from_millis(1000 / frame_rate);
    let mut render = tokio::time::interval(frame);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = render.tick() => {
                avatar.lock().tick(frame);
            }
            Some(event) = events.recv() => {
                match serde_json::to_string(&event) {
                    Ok(json) => tracing::info!(event = %json, "conversation"),
                    Err(e) => tracing::warn!(error = %e, "event not serializable"),
                }
                if let ConversationEvent::Reply { text, fallback, .. } = &event {
                    println!("{} {}", if *fallback { "companion (offline):" } else { "companion:" }, text);
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !console(&line, &handle, &capture, &avatar, character) {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down daemon");
                break;
            }
        }
    }

    orchestrator.shutdown().await?;
    avatar.lock().dispose();
    Ok(())
}

/// Handle one console line. Returns false to quit.
fn console(
    line: &str,
    handle: &OrchestratorHandle,
    capture: &ManualCapture,
    avatar: &SharedService<HeadlessScene>,
    character: CharacterId,
) -> bool {
    let line = line.trim();
    let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
    let result = match command {
        "" => Ok(()),
        "/quit" => return false,
        "/start" => handle.start(),
        "/stop" => handle.stop(),
        "/interrupt" => handle.interrupt(),
        "/continuous" => handle.set_continuous_mode(matches!(arg.trim(), "on" | "true" | "1")),
        "/state" => {
            println!("{:?}", handle.snapshot());
            Ok(())
        }
        "/play" => {
            if let Err(e) = avatar
                .lock()
                .play_one_shot(character, arg.trim(), OneShotOptions::default())
            {
                tracing::warn!(error = %e, "one-shot failed");
            }
            Ok(())
        }
        _ if capture.is_open() => {
            // Stand-in for the recognizer: the line is a confident final transcript
            capture.push(CaptureEvent::Final {
                transcript: line.to_string(),
                confidence: 0.9,
                meta: FinalMeta::default(),
            });
            Ok(())
        }
        _ => handle.submit_text(line),
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, "console command failed");
        return false;
    }
    true
}

/// Demo avatar on the headless scene
fn load_avatar(config: &CompanionConfig) -> anyhow::Result<(SharedService<HeadlessScene>, CharacterId)> {
    let mut scene = HeadlessScene::with_frame_rate(30.0);
    scene.register_model(
        AVATAR_MODEL,
        vec![4200, 860, 310],
        &[JAW_OPEN, MOUTH_OPEN, TEETH_MOUTH_OPEN, "mouthSmile", "eyeBlinkLeft", "eyeBlinkRight"],
    );
    let clips = [
        ("idle_breathe", 120),
        ("idle_look_around", 150),
        ("idle_shift_weight", 90),
        ("talk_calm", 60),
        ("talk_animated", 48),
        ("wave", 45),
        ("nod", 30),
    ];
    let mut refs = Vec::with_capacity(clips.len());
    for (name, frames) in clips {
        let uri = format!("animations/{}.anim", name);
        scene.register_clip(uri.clone(), frames);
        refs.push(ClipRef::new(name, uri));
    }

    let mut service = AnimationService::new(scene, &config.avatar);
    let character = service.load_character(&ModelRef::new(AVATAR_MODEL), &refs)?;
    service.start_idle(character)?;
    Ok((Arc::new(Mutex::new(service)), character))
}

fn dialog_service() -> Arc<dyn DialogService> {
    if std::env::var("DIALOG_API_URL").is_err() {
        tracing::info!("DIALOG_API_URL not set; using placeholder dialog");
        return Arc::new(PlaceholderDialog::new());
    }
    match HttpDialogClient::from_env() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::warn!(error = %e, "dialog client unavailable; using placeholder dialog");
            Arc::new(PlaceholderDialog::new())
        }
    }
}

fn speech_synthesizer() -> Arc<dyn SpeechSynthesizer> {
    if std::env::var("TTS_API_URL").is_err() {
        tracing::info!("TTS_API_URL not set; using placeholder synthesizer");
        return Arc::new(PlaceholderSynthesizer::default());
    }
    match HttpSpeechSynthesizer::from_env() {
        Ok(tts) => Arc::new(tts),
        Err(e) => {
            tracing::warn!(error = %e, "TTS unavailable; using placeholder synthesizer");
            Arc::new(PlaceholderSynthesizer::default())
        }
    }
}

#[cfg(feature = "speaker")]
fn audio_player() -> anyhow::Result<Arc<dyn AudioPlayer>> {
    Ok(Arc::new(companion_voice::SpeakerPlayer::new()?))
}

#[cfg(not(feature = "speaker"))]
fn audio_player() -> anyhow::Result<Arc<dyn AudioPlayer>> {
    Ok(Arc::new(companion_voice::ClockPlayer::new()))
}
