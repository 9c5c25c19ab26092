//! End-to-end playback through the public manager API, driven by the
//! synthetic backend.

use std::sync::Arc;
use std::time::{Duration, Instant};
use vivista_core::resample::SampleFormat;
use vivista_core::synthetic::{FaultPlan, SyntheticAudio, SyntheticBackend, SyntheticMedia};
use vivista_core::{
    AudioChannelMode, BufferState, ContextId, MasterClock, PlaybackManager, PlayerConfig,
    PlayerState,
};

fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn unpaced() -> PlayerConfig {
    PlayerConfig {
        pace_video: false,
        ..PlayerConfig::default()
    }
}

fn manager_with(media: SyntheticMedia, config: PlayerConfig) -> PlaybackManager {
    init_test_logging();
    let backend = SyntheticBackend::new().with_media("clip.mp4", media);
    PlaybackManager::new(Arc::new(backend), config)
}

#[derive(Default)]
struct Drained {
    video_pts: Vec<f64>,
    audio_pts: Vec<f64>,
    audio_channels: Vec<u16>,
    audio_rates: Vec<u32>,
}

/// Pull and free frames like a host would until the read loop has hit the
/// end and nothing more arrives.
fn drain(manager: &PlaybackManager, id: ContextId) -> Drained {
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut drained = Drained::default();
    let mut idle = 0;
    loop {
        let mut progressed = false;
        if let Some(frame) = manager.get_video_frame(id) {
            drained.video_pts.push(frame.pts);
            manager.free_video_frame(id);
            progressed = true;
        }
        if let Some(frame) = manager.get_audio_frame(id) {
            drained.audio_pts.push(frame.pts);
            drained.audio_channels.push(frame.channels);
            drained.audio_rates.push(frame.sample_rate);
            assert_eq!(frame.samples.len(), frame.nb_samples * frame.channels as usize);
            manager.free_audio_frame(id);
            progressed = true;
        }
        if progressed {
            idle = 0;
            continue;
        }
        if manager.is_eof(id) {
            idle += 1;
            if idle > 100 {
                return drained;
            }
        }
        assert!(Instant::now() < deadline, "playback did not finish");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn first_frame_pts(manager: &PlaybackManager, id: ContextId) -> f64 {
    let mut pts = None;
    wait_until(|| {
        pts = manager.get_video_frame(id).map(|frame| frame.pts);
        pts.is_some()
    });
    pts.unwrap_or_default()
}

fn assert_non_decreasing(values: &[f64]) {
    for pair in values.windows(2) {
        assert!(pair[1] >= pair[0], "{} after {}", pair[1], pair[0]);
    }
}

#[test]
fn test_clean_playback_reaches_eof() {
    let manager = manager_with(SyntheticMedia::new(10.0), unpaced());
    let id = manager.init_decoder("clip.mp4").unwrap();
    manager.start(id).unwrap();

    let drained = drain(&manager, id);
    assert!((299..=301).contains(&drained.video_pts.len()));
    assert_non_decreasing(&drained.video_pts);
    assert_non_decreasing(&drained.audio_pts);
    assert_eq!(drained.audio_pts.len(), 431);
    assert!(drained.audio_channels.iter().all(|c| *c == 2));
    assert!(drained.audio_rates.iter().all(|r| *r == 44_100));

    assert!(manager.is_eof(id));
    assert_eq!(manager.get_player_state(id), Some(PlayerState::PlayEof));
    let info = manager.get_video_info(id).unwrap();
    assert!(info.last_presented_time.unwrap() > 9.9);
    assert_eq!(info.total_duration, 10.0);
    assert!(manager.is_video_buffer_empty(id));

    manager.stop(id).unwrap();
    assert_eq!(manager.get_player_state(id), Some(PlayerState::Stop));
}

#[test]
fn test_seek_past_end_clamps() {
    let manager = manager_with(SyntheticMedia::new(10.0), unpaced());
    let id = manager.init_decoder("clip.mp4").unwrap();
    manager.start(id).unwrap();

    manager.seek(id, 9999.0).unwrap();
    wait_until(|| manager.is_seek_over(id));
    assert_ne!(manager.get_player_state(id), Some(PlayerState::Seek));

    let drained = drain(&manager, id);
    // Last keyframe before the end.
    assert_eq!(drained.video_pts.first().copied(), Some(9.0));
    assert_eq!(drained.video_pts.len(), 30);
    assert!(manager.is_eof(id));
}

#[test]
fn test_seek_after_eof_restarts_playback() {
    let manager = manager_with(SyntheticMedia::new(2.0).with_audio(None), unpaced());
    let id = manager.init_decoder("clip.mp4").unwrap();
    manager.start(id).unwrap();
    assert_eq!(drain(&manager, id).video_pts.len(), 60);

    manager.seek(id, 1.0).unwrap();
    wait_until(|| manager.is_seek_over(id));
    assert!(!manager.is_eof(id) || manager.get_player_state(id) == Some(PlayerState::PlayEof));

    let drained = drain(&manager, id);
    assert_eq!(drained.video_pts.first().copied(), Some(1.0));
    assert_eq!(drained.video_pts.len(), 30);
}

#[test]
fn test_seek_lands_on_keyframe_or_exact_frame() {
    let manager = manager_with(SyntheticMedia::new(10.0).with_audio(None), unpaced());
    let id = manager.init_decoder("clip.mp4").unwrap();
    manager.seek(id, 4.5).unwrap();
    manager.start(id).unwrap();
    assert_eq!(first_frame_pts(&manager, id), 4.0);
    assert!(manager.is_content_ready(id));

    let any = PlayerConfig {
        seek_to_any: true,
        ..unpaced()
    };
    let manager = manager_with(SyntheticMedia::new(10.0).with_audio(None), any);
    let id = manager.init_decoder("clip.mp4").unwrap();
    manager.seek(id, 4.5).unwrap();
    manager.start(id).unwrap();
    assert_eq!(first_frame_pts(&manager, id), 4.5);
}

#[test]
fn test_failed_seek_keeps_position() {
    let faults = FaultPlan {
        fail_seek: true,
        ..FaultPlan::default()
    };
    let media = SyntheticMedia::new(10.0).with_audio(None).with_faults(faults);
    let manager = manager_with(media, unpaced());
    let id = manager.init_decoder("clip.mp4").unwrap();
    manager.start(id).unwrap();

    let mut seen = Vec::new();
    for _ in 0..10 {
        seen.push(first_frame_pts(&manager, id));
        manager.free_video_frame(id);
    }
    assert_non_decreasing(&seen);
    let last = seen[9];

    manager.seek(id, 5.0).unwrap();
    wait_until(|| manager.is_seek_over(id));
    assert!(matches!(
        manager.get_player_state(id),
        Some(PlayerState::Playing | PlayerState::PlayEof)
    ));
    // Another seek is accepted; the player is not left in SEEK.
    manager.seek(id, 6.0).unwrap();
    wait_until(|| manager.is_seek_over(id));

    let drained = drain(&manager, id);
    let next = drained.video_pts.first().copied().unwrap();
    assert!(next > last && next < 1.0, "{} after {}", next, last);
    assert!((289..=291).contains(&drained.video_pts.len()));
    assert_non_decreasing(&drained.video_pts);
    assert_eq!(manager.get_player_state(id), Some(PlayerState::PlayEof));
}

#[test]
fn test_disable_audio_during_playback() {
    let manager = manager_with(SyntheticMedia::new(5.0), unpaced());
    let id = manager.init_decoder("clip.mp4").unwrap();
    manager.start(id).unwrap();

    wait_until(|| manager.get_audio_frame(id).is_some());
    manager.free_audio_frame(id);
    let before = first_frame_pts(&manager, id);
    manager.free_video_frame(id);
    assert_eq!(manager.get_master_clock(id), Some(MasterClock::Audio));

    manager.enable_audio(id, false).unwrap();
    assert_eq!(manager.get_master_clock(id), Some(MasterClock::External));
    assert!(manager.get_audio_frame(id).is_none());
    let audio = manager.get_audio_info(id).unwrap();
    assert!(!audio.is_enabled);
    assert_eq!(audio.buffer_state, BufferState::Empty);

    let drained = drain(&manager, id);
    assert!(drained.audio_pts.is_empty());
    assert!(drained.video_pts.first().copied().unwrap() > before);
    assert!(drained.video_pts.last().copied().unwrap() > 4.9);
    assert_non_decreasing(&drained.video_pts);
    assert_eq!(manager.get_audio_info(id).unwrap().buffer_state, BufferState::Empty);
}

#[test]
fn test_reenable_video_during_playback() {
    let manager = manager_with(SyntheticMedia::new(10.0), unpaced());
    let id = manager.init_decoder("clip.mp4").unwrap();
    manager.start(id).unwrap();
    let before = first_frame_pts(&manager, id);
    manager.free_video_frame(id);

    manager.enable_video(id, false).unwrap();
    assert!(manager.get_video_frame(id).is_none());
    assert!(manager.is_video_buffer_empty(id));
    assert!(!manager.get_video_info(id).unwrap().is_enabled);
    assert_eq!(manager.get_master_clock(id), Some(MasterClock::Audio));

    manager.enable_video(id, true).unwrap();
    assert!(manager.get_video_info(id).unwrap().is_enabled);

    // Keep audio flowing so the read loop moves on and feeds video again.
    let mut after = None;
    wait_until(|| {
        if manager.get_audio_frame(id).is_some() {
            manager.free_audio_frame(id);
        }
        after = manager.get_video_frame(id).map(|frame| frame.pts);
        after.is_some()
    });
    assert!(after.unwrap() > before);
    manager.free_video_frame(id);

    let drained = drain(&manager, id);
    assert_non_decreasing(&drained.video_pts);
    assert!(drained.video_pts.last().copied().unwrap() > 9.9);
}

#[test]
fn test_disabled_audio_stream() {
    let manager = manager_with(SyntheticMedia::new(3.0), unpaced());
    let id = manager.init_decoder("clip.mp4").unwrap();
    manager.enable_audio(id, false).unwrap();
    manager.start(id).unwrap();

    let drained = drain(&manager, id);
    assert!(drained.audio_pts.is_empty());
    assert_eq!(drained.video_pts.len(), 90);

    let audio = manager.get_audio_info(id).unwrap();
    assert!(audio.is_present);
    assert!(!audio.is_enabled);
    assert_eq!(audio.last_presented_time, None);
}

#[test]
fn test_pause_holds_presentation() {
    let manager = manager_with(SyntheticMedia::new(5.0).with_audio(None), unpaced());
    let id = manager.init_decoder("clip.mp4").unwrap();
    manager.start(id).unwrap();
    wait_until(|| manager.get_video_frame(id).is_some());
    manager.free_video_frame(id);

    manager.pause(id).unwrap();
    assert_eq!(manager.get_player_state(id), Some(PlayerState::Pause));
    std::thread::sleep(Duration::from_millis(20));
    assert!(manager.get_video_frame(id).is_none());

    manager.resume(id).unwrap();
    wait_until(|| manager.get_video_frame(id).is_some());
}

#[test]
fn test_paced_playback_follows_frame_timer() {
    let manager = manager_with(SyntheticMedia::new(2.0).with_audio(None), PlayerConfig::default());
    let id = manager.init_decoder("clip.mp4").unwrap();
    manager.start(id).unwrap();

    let started = Instant::now();
    let mut presented = 0;
    while presented < 10 {
        if manager.get_video_frame(id).is_some() {
            manager.free_video_frame(id);
            presented += 1;
        }
        std::thread::sleep(Duration::from_millis(1));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
    // Ten frames at 30 fps cannot go out in much less than 9 intervals.
    assert!(started.elapsed() >= Duration::from_millis(250));
}

#[test]
fn test_recoverable_faults_do_not_stop_playback() {
    let faults = FaultPlan {
        transient_every: Some(7),
        corrupt_video_every: Some(10),
        ..FaultPlan::default()
    };
    let manager = manager_with(SyntheticMedia::new(5.0).with_faults(faults), unpaced());
    let id = manager.init_decoder("clip.mp4").unwrap();
    manager.start(id).unwrap();

    let drained = drain(&manager, id);
    assert_eq!(drained.video_pts.len(), 135);
    assert_non_decreasing(&drained.video_pts);
    assert_eq!(manager.get_player_state(id), Some(PlayerState::PlayEof));
}

#[test]
fn test_hard_read_error_ends_playback() {
    let faults = FaultPlan {
        hard_error_after: Some(40),
        ..FaultPlan::default()
    };
    let manager = manager_with(SyntheticMedia::new(10.0).with_faults(faults), unpaced());
    let id = manager.init_decoder("clip.mp4").unwrap();
    manager.start(id).unwrap();

    let drained = drain(&manager, id);
    assert!(drained.video_pts.len() + drained.audio_pts.len() <= 40);
    assert!(manager.is_eof(id));
}

#[test]
fn test_source_layout_and_output_rate() {
    let audio = SyntheticAudio {
        channels: 6,
        format: SampleFormat::F32Planar,
        ..SyntheticAudio::default()
    };
    let config = PlayerConfig {
        audio_channels: AudioChannelMode::Source,
        audio_sample_rate: Some(48_000),
        ..unpaced()
    };
    let media = SyntheticMedia::new(1.0).with_video(None).with_audio(Some(audio));
    let manager = manager_with(media, config);
    let id = manager.init_decoder("clip.mp4").unwrap();
    manager.start(id).unwrap();

    let drained = drain(&manager, id);
    assert!(!drained.audio_pts.is_empty());
    assert!(drained.audio_channels.iter().all(|c| *c == 6));
    assert!(drained.audio_rates.iter().all(|r| *r == 48_000));

    let info = manager.get_audio_info(id).unwrap();
    assert_eq!((info.channels, info.sample_rate), (6, 48_000));
    assert!(!manager.get_video_info(id).unwrap().is_present);
    // No video to wait for.
    assert!(manager.is_content_ready(id));
}

#[test]
fn test_failed_open_reports_init_fail() {
    let faults = FaultPlan {
        fail_open: true,
        ..FaultPlan::default()
    };
    let manager = manager_with(SyntheticMedia::new(1.0).with_faults(faults), unpaced());
    let id = manager.init_decoder("clip.mp4").unwrap();
    wait_until(|| manager.get_player_state(id) != Some(PlayerState::Uninitialized));
    assert_eq!(manager.get_player_state(id), Some(PlayerState::InitFail));
    assert!(manager.start(id).is_err());
    assert!(manager.destroy(id));
    assert!(manager.contexts().is_empty());
}
