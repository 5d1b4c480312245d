//! Integration tests for the animation service over the headless scene

use companion_avatar::{
    AnimationError, AnimationService, AvatarConfig, BlendOutcome, CharacterId, ClipCategory,
    ClipRef, HeadlessScene, ModelRef, ObserverKind, OneShotOptions, PcmAudio, SessionKind,
    TalkingPhase, JAW_OPEN, MOUTH_OPEN, TEETH_MOUTH_OPEN,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

const FRAME: Duration = Duration::from_millis(100);
const MODEL: &str = "avatars/mira.glb";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn scene() -> HeadlessScene {
    let mut scene = HeadlessScene::with_frame_rate(10.0);
    scene.register_model(MODEL, vec![1200, 300], &[JAW_OPEN, MOUTH_OPEN, TEETH_MOUTH_OPEN, "smile"]);
    scene.register_model("avatars/empty.glb", vec![0], &[]);
    for uri in ["idle_a.anim", "idle_b.anim", "idle_c.anim", "idle_d.anim"] {
        scene.register_clip(uri, 3);
    }
    scene.register_clip("talk_1.anim", 20);
    scene.register_clip("wave.anim", 4);
    scene
}

fn clips(idle: usize) -> Vec<ClipRef> {
    let mut refs: Vec<ClipRef> = ["idle_a", "idle_b", "idle_c", "idle_d"]
        .iter()
        .take(idle)
        .map(|name| ClipRef::new(*name, format!("{name}.anim")))
        .collect();
    refs.push(ClipRef::new("Talk_1", "talk_1.anim"));
    refs.push(ClipRef::new("Wave", "wave.anim").with_category(ClipCategory::Expression));
    refs
}

fn service(seed: u64, idle: usize) -> (AnimationService<HeadlessScene>, CharacterId) {
    init_tracing();
    let mut service = AnimationService::with_seed(scene(), &AvatarConfig::default(), seed);
    let id = service
        .load_character(&ModelRef::new(MODEL), &clips(idle))
        .expect("Failed to load character");
    (service, id)
}

/// Drive idle cycling and return the sequence of selected clip indices
fn idle_selections(service: &mut AnimationService<HeadlessScene>, id: CharacterId, n: usize) -> Vec<usize> {
    let mut seen = 0;
    let mut sequence = vec![service
        .idle_state(id)
        .unwrap()
        .expect("cycling")
        .current_index()];
    while sequence.len() < n {
        service.tick(FRAME);
        let state = service.idle_state(id).unwrap().expect("cycling");
        if state.selections() != seen {
            assert_eq!(state.selections(), seen + 1, "one selection per clip end");
            seen = state.selections();
            sequence.push(state.current_index());
        }
    }
    sequence
}

#[test]
fn load_skips_missing_clips() {
    init_tracing();
    let mut service = AnimationService::with_seed(scene(), &AvatarConfig::default(), 1);
    let mut refs = clips(2);
    refs.push(ClipRef::new("ghost", "ghost.anim"));
    let id = service
        .load_character(&ModelRef::new(MODEL), &refs)
        .expect("Failed to load character");

    let character = service.character(id).unwrap();
    assert!(character.is_loaded());
    assert_eq!(character.clips().len(), 4);
    assert!(character.clip("ghost").is_none());
    assert_eq!(character.clips_in(ClipCategory::Idle).len(), 2);
    assert_eq!(character.clips_in(ClipCategory::Talking).len(), 1);
}

#[test]
fn model_without_geometry_is_a_load_failure() {
    init_tracing();
    let mut service = AnimationService::with_seed(scene(), &AvatarConfig::default(), 1);
    let err = service
        .load_character(&ModelRef::new("avatars/empty.glb"), &[])
        .unwrap_err();
    assert!(matches!(err, AnimationError::LoadFailure(_)));
    assert_eq!(service.active_character(), None);
    assert_eq!(service.scene().live_mesh_count(), 0);
}

#[test]
fn idle_with_two_clips_never_repeats_consecutively() {
    for seed in 0..8 {
        let (mut service, id) = service(seed, 2);
        service.start_idle(id).unwrap();
        let sequence = idle_selections(&mut service, id, 40);
        for pair in sequence.windows(2) {
            assert_ne!(pair[0], pair[1], "seed {seed}: {sequence:?}");
        }
    }
}

#[test]
fn idle_with_three_or_more_clips_never_repeats_within_three() {
    for idle in [3, 4] {
        for seed in 0..8 {
            let (mut service, id) = service(seed, idle);
            service.start_idle(id).unwrap();
            let sequence = idle_selections(&mut service, id, 60);
            for w in sequence.windows(3) {
                assert!(
                    w[0] != w[1] && w[1] != w[2] && w[0] != w[2],
                    "idle={idle} seed={seed}: {sequence:?}"
                );
            }
            let state = service.idle_state(id).unwrap().unwrap();
            assert!(state.recent_history().len() <= 3);
        }
    }
}

#[test]
fn single_idle_clip_loops_without_cycling() {
    let (mut service, id) = service(1, 1);
    service.start_idle(id).unwrap();

    assert_eq!(service.session_kind(id).unwrap(), Some(SessionKind::Idle));
    assert!(service.idle_state(id).unwrap().is_none());
    let clip = service.character(id).unwrap().clip("idle_a").unwrap().handle();
    assert_eq!(service.scene().is_looping(clip), Some(true));
    for _ in 0..30 {
        service.tick(FRAME);
    }
    assert!(service.scene().is_playing(clip));
    assert_eq!(service.observer_count(id, ObserverKind::ClipEnd), 0);
}

#[test]
fn start_idle_is_idempotent() {
    let (mut service, id) = service(2, 3);
    service.start_idle(id).unwrap();
    let first = service.idle_state(id).unwrap().unwrap().current_clip();
    service.start_idle(id).unwrap();
    assert_eq!(service.idle_state(id).unwrap().unwrap().current_clip(), first);
    assert_eq!(service.observer_count(id, ObserverKind::ClipEnd), 1);
}

#[test]
fn no_idle_clips_is_reported() {
    let (mut service, id) = service(1, 0);
    assert_eq!(service.start_idle(id), Err(AnimationError::NoIdleClips));
    assert!(AnimationError::NoIdleClips.is_benign());
    // stop_talking treats it as a no-op
    assert_eq!(service.stop_talking(id), Ok(()));
}

#[test]
fn talking_replaces_idle_and_settles_before_playing() {
    let (mut service, id) = service(3, 3);
    service.start_idle(id).unwrap();
    service.start_talking(id, None).unwrap();

    assert_eq!(service.session_kind(id).unwrap(), Some(SessionKind::Talking));
    assert_eq!(service.observer_count(id, ObserverKind::ClipEnd), 0);
    let talk = service.character(id).unwrap().clip("talk_1").unwrap().handle();
    let session = service.talking_session(id).unwrap().unwrap();
    assert!(matches!(session.phase(), TalkingPhase::Settling { .. }));
    assert!(!service.scene().is_playing(talk));

    service.tick(FRAME);
    let session = service.talking_session(id).unwrap().unwrap();
    assert_eq!(session.phase(), TalkingPhase::Playing);
    assert_eq!(service.scene().speed(talk), Some(0.8));
    assert_eq!(service.scene().is_looping(talk), Some(true));

    for _ in 0..30 {
        service.tick(FRAME);
    }
    let weight = service.scene().weight(talk).unwrap();
    assert!((weight - 0.8).abs() < 1e-5, "talking weight {weight}");
}

#[test]
fn talking_without_talking_clip_is_not_ready() {
    init_tracing();
    let mut service = AnimationService::with_seed(scene(), &AvatarConfig::default(), 1);
    let id = service
        .load_character(
            &ModelRef::new(MODEL),
            &[ClipRef::new("idle_a", "idle_a.anim"), ClipRef::new("idle_b", "idle_b.anim")],
        )
        .unwrap();
    service.start_idle(id).unwrap();

    let err = service.start_talking(id, None).unwrap_err();
    assert!(matches!(err, AnimationError::NotReady(_)));
    // avatar keeps idling
    assert_eq!(service.session_kind(id).unwrap(), Some(SessionKind::Idle));
}

#[test]
fn lip_sync_follows_audio_and_stays_in_range() {
    let (mut service, id) = service(4, 2);
    let mut rng = StdRng::seed_from_u64(9);
    let noise: Vec<f32> = (0..32_000).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let audio = PcmAudio::new(noise, 16_000);

    service.start_talking(id, Some(Box::new(audio))).unwrap();
    assert_eq!(service.observer_count(id, ObserverKind::AnalyzerFrame), 1);
    for _ in 0..6 {
        service.tick(FRAME);
        for name in [JAW_OPEN, MOUTH_OPEN, TEETH_MOUTH_OPEN] {
            let v = service.morph_influence(id, name).unwrap();
            assert!((0.0..=1.0).contains(&v), "{name} = {v}");
        }
    }
    assert_eq!(service.morph_influence(id, JAW_OPEN).unwrap(), 1.0);
    assert_eq!(service.morph_influence(id, MOUTH_OPEN).unwrap(), 1.0);

    service.stop_talking(id).unwrap();
    assert_eq!(service.observer_count(id, ObserverKind::AnalyzerFrame), 0);
    for name in [JAW_OPEN, MOUTH_OPEN, TEETH_MOUTH_OPEN] {
        assert_eq!(service.morph_influence(id, name).unwrap(), 0.0);
    }
    assert_eq!(service.session_kind(id).unwrap(), Some(SessionKind::Idle));
}

#[test]
fn silent_audio_keeps_mouth_closed() {
    let (mut service, id) = service(5, 2);
    let audio = PcmAudio::new(vec![0.0; 16_000], 16_000);
    service.start_talking(id, Some(Box::new(audio))).unwrap();
    for _ in 0..5 {
        service.tick(FRAME);
    }
    assert_eq!(service.morph_influence(id, JAW_OPEN).unwrap(), 0.0);
}

#[test]
fn one_shot_is_case_insensitive_and_returns_to_idle() {
    let (mut service, id) = service(6, 3);
    service.start_idle(id).unwrap();

    let err = service
        .play_one_shot(id, "dance", OneShotOptions::default())
        .unwrap_err();
    assert_eq!(err, AnimationError::ClipNotFound("dance".to_string()));
    assert_eq!(service.session_kind(id).unwrap(), Some(SessionKind::Idle));

    let mut done = service
        .play_one_shot(id, "WAVE", OneShotOptions::default())
        .unwrap();
    assert_eq!(service.session_kind(id).unwrap(), Some(SessionKind::OneShot));
    assert_eq!(service.observer_count(id, ObserverKind::ClipEnd), 1);

    for _ in 0..6 {
        service.tick(FRAME);
    }
    assert_eq!(service.session_kind(id).unwrap(), Some(SessionKind::Idle));
    // the wave ended before its ramp finished and idle took over the blend
    assert_eq!(done.try_outcome(), Some(BlendOutcome::Superseded));
}

#[test]
fn one_shot_without_return_leaves_rest_pose() {
    let (mut service, id) = service(7, 2);
    let options = OneShotOptions {
        return_to_idle: false,
        ..Default::default()
    };
    service.play_one_shot(id, "wave", options).unwrap();
    for _ in 0..6 {
        service.tick(FRAME);
    }
    assert_eq!(service.session_kind(id).unwrap(), None);
    assert_eq!(service.character(id).unwrap().current_clip(), None);
}

#[test]
fn morph_target_interpolates_linearly() {
    let (mut service, id) = service(8, 2);
    service
        .set_morph_target(id, "Smile", 1.0, Duration::from_millis(400))
        .unwrap();
    service.tick(FRAME);
    assert!((service.morph_influence(id, "smile").unwrap() - 0.25).abs() < 1e-4);
    service.tick(FRAME);
    assert!((service.morph_influence(id, "smile").unwrap() - 0.5).abs() < 1e-4);
    for _ in 0..3 {
        service.tick(FRAME);
    }
    assert_eq!(service.morph_influence(id, "smile").unwrap(), 1.0);

    service
        .set_morph_target(id, "smile", 3.0, Duration::ZERO)
        .unwrap();
    assert_eq!(service.morph_influence(id, "smile").unwrap(), 1.0);

    let err = service
        .set_morph_target(id, "frown", 0.5, Duration::ZERO)
        .unwrap_err();
    assert!(matches!(err, AnimationError::MorphTargetNotFound(_)));
}

#[test]
fn replacing_the_character_invalidates_old_handles() {
    let (mut service, old) = service(9, 3);
    service.start_idle(old).unwrap();

    let new = service
        .load_character(&ModelRef::new(MODEL), &clips(2))
        .unwrap();
    assert_ne!(old, new);
    assert_eq!(service.active_character(), Some(new));
    assert_eq!(service.start_idle(old), Err(AnimationError::StaleCharacter));
    assert!(matches!(service.character(old), Err(AnimationError::StaleCharacter)));
    assert_eq!(service.observer_count(old, ObserverKind::ClipEnd), 0);
    // only the new character's meshes remain
    assert_eq!(service.scene().live_mesh_count(), 2);
}

#[test]
fn dispose_is_idempotent() {
    let (mut service, id) = service(10, 3);
    service.start_idle(id).unwrap();
    service.dispose();
    service.dispose();

    assert_eq!(service.active_character(), None);
    assert_eq!(service.scene().live_mesh_count(), 0);
    assert!(service.scene().playing_clips().is_empty());
    assert_eq!(service.stop(id), Err(AnimationError::StaleCharacter));
    // late ticks are harmless
    service.tick(FRAME);
}

#[test]
fn stop_ends_any_session() {
    let (mut service, id) = service(11, 3);
    service.start_idle(id).unwrap();
    service.stop(id).unwrap();
    assert_eq!(service.session_kind(id).unwrap(), None);
    assert_eq!(service.observer_count(id, ObserverKind::ClipEnd), 0);
    assert!(service.scene().playing_clips().is_empty());
}
