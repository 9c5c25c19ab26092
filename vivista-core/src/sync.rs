//! Audio/Video Synchronization
//!
//! Audio is the master clock by default. Video frames are scheduled by a
//! frame timer whose per-frame delay is stretched or shrunk depending on
//! how far the frame is from the master clock.

use crate::clock::{wall_time, Clock, NOSYNC_THRESHOLD};
use crate::config::SyncMode;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Smallest A/V difference that gets corrected.
pub const MIN_SYNC_THRESHOLD: f64 = 0.04;
/// A frame timer further behind than this is resynchronized to now.
pub const MAX_SYNC_THRESHOLD: f64 = 0.1;
/// Frames longer than this are extended by the drift instead of doubled.
pub const FRAMEDUP_THRESHOLD: f64 = 0.1;
pub const MIN_REFRESH_DELAY: f64 = 0.010;
pub const INITIAL_FRAME_DELAY: f64 = 40e-3;

pub const EXTERNAL_CLOCK_MIN_FRAMES: usize = 2;
pub const EXTERNAL_CLOCK_MAX_FRAMES: usize = 10;
pub const EXTERNAL_CLOCK_SPEED_MIN: f64 = 0.900;
pub const EXTERNAL_CLOCK_SPEED_MAX: f64 = 1.010;
pub const EXTERNAL_CLOCK_SPEED_STEP: f64 = 0.001;

/// Delay before the next frame, given the nominal gap between frames and
/// how far the current frame is ahead of the master clock.
///
/// `av_delay` is `None` when there is nothing to sync against.
pub fn compute_target_delay(pts_delay: f64, av_delay: Option<f64>) -> f64 {
    let Some(diff) = av_delay else {
        return pts_delay;
    };
    let sync_threshold = pts_delay.max(MIN_SYNC_THRESHOLD);
    if diff.is_nan() || diff.abs() >= NOSYNC_THRESHOLD {
        return pts_delay;
    }
    if diff <= -sync_threshold {
        // Behind: show the next frame immediately.
        0.0
    } else if diff >= sync_threshold {
        if pts_delay > FRAMEDUP_THRESHOLD {
            pts_delay + diff
        } else {
            2.0 * pts_delay
        }
    } else {
        pts_delay
    }
}

// ============================================================================
// Frame Timer
// ============================================================================

/// Outcome of scheduling one presented frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    /// Corrected delay added to the frame timer.
    pub delay: f64,
    /// Seconds until the next frame is due, at least `MIN_REFRESH_DELAY`.
    pub wait: f64,
    /// Wall time at which the next frame is due.
    pub due: f64,
}

#[derive(Debug, Clone)]
pub struct FrameTimer {
    frame_timer: Option<f64>,
    last_pts: Option<f64>,
    last_delay: f64,
    next_due: f64,
    paused_at: Option<f64>,
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self {
            frame_timer: None,
            last_pts: None,
            last_delay: INITIAL_FRAME_DELAY,
            next_due: 0.0,
            paused_at: None,
        }
    }
}

impl FrameTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the frame at `pts` as presented at `now`.
    pub fn schedule(&mut self, pts: f64, av_delay: Option<f64>, now: f64) -> Schedule {
        let mut pts_delay = match self.last_pts {
            Some(last) => pts - last,
            None => self.last_delay,
        };
        if pts_delay <= 0.0 || pts_delay >= 1.0 {
            pts_delay = self.last_delay;
        }
        self.last_delay = pts_delay;
        self.last_pts = Some(pts);

        let delay = compute_target_delay(pts_delay, av_delay);

        let mut base = self.frame_timer.unwrap_or(now);
        if now - base > MAX_SYNC_THRESHOLD {
            base = now;
        }
        let timer = base + delay;
        self.frame_timer = Some(timer);

        let wait = (timer - now).max(MIN_REFRESH_DELAY);
        self.next_due = now + wait;
        Schedule {
            delay,
            wait,
            due: self.next_due,
        }
    }

    pub fn is_due(&self, now: f64) -> bool {
        now >= self.next_due
    }

    pub fn next_due(&self) -> f64 {
        self.next_due
    }

    pub fn last_delay(&self) -> f64 {
        self.last_delay
    }

    pub fn pause(&mut self, now: f64) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    /// Shift the schedule by the time spent paused.
    pub fn resume(&mut self, now: f64) {
        if let Some(at) = self.paused_at.take() {
            let paused_for = (now - at).max(0.0);
            if let Some(timer) = self.frame_timer.as_mut() {
                *timer += paused_for;
            }
            if self.next_due > 0.0 {
                self.next_due += paused_for;
            }
        }
    }

    /// Start over, e.g. for the first frame after a seek.
    pub fn reset(&mut self) {
        let paused_at = self.paused_at;
        *self = Self::default();
        self.paused_at = paused_at;
    }
}

// ============================================================================
// Sync Controller
// ============================================================================

/// Which clock is actually driving, after falling back for missing streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterClock {
    Audio,
    Video,
    External,
}

/// A/V sync controller
pub struct SyncController {
    audio: Arc<Clock>,
    video: Arc<Clock>,
    external: Arc<Clock>,
    mode: SyncMode,
    has_audio: AtomicBool,
    has_video: AtomicBool,
    timer: Mutex<FrameTimer>,
    frames_presented: AtomicU64,
    frames_late: AtomicU64,
}

impl SyncController {
    pub fn new(mode: SyncMode, audio: Arc<Clock>, video: Arc<Clock>) -> Self {
        Self {
            audio,
            video,
            external: Arc::new(Clock::new(None)),
            mode,
            has_audio: AtomicBool::new(false),
            has_video: AtomicBool::new(false),
            timer: Mutex::new(FrameTimer::new()),
            frames_presented: AtomicU64::new(0),
            frames_late: AtomicU64::new(0),
        }
    }

    pub fn audio_clock(&self) -> &Arc<Clock> {
        &self.audio
    }
    pub fn video_clock(&self) -> &Arc<Clock> {
        &self.video
    }
    pub fn external_clock(&self) -> &Arc<Clock> {
        &self.external
    }

    /// Tell the controller which streams are currently playing.
    pub fn set_streams(&self, has_audio: bool, has_video: bool) {
        self.has_audio.store(has_audio, Ordering::SeqCst);
        self.has_video.store(has_video, Ordering::SeqCst);
    }

    pub fn master(&self) -> MasterClock {
        match self.mode {
            SyncMode::VideoMaster => {
                if self.has_video.load(Ordering::SeqCst) {
                    MasterClock::Video
                } else {
                    MasterClock::Audio
                }
            }
            SyncMode::AudioMaster => {
                if self.has_audio.load(Ordering::SeqCst) {
                    MasterClock::Audio
                } else {
                    MasterClock::External
                }
            }
            SyncMode::External => MasterClock::External,
        }
    }

    pub fn master_clock(&self) -> Option<f64> {
        match self.master() {
            MasterClock::Audio => self.audio.get(),
            MasterClock::Video => self.video.get(),
            MasterClock::External => self.external.get(),
        }
    }

    /// How far a frame at `pts` is ahead of the master. `None` when video
    /// is the master or the master has no valid reading.
    pub fn av_delay(&self, pts: f64) -> Option<f64> {
        if self.master() == MasterClock::Video {
            return None;
        }
        self.master_clock().map(|master| pts - master)
    }

    /// Gate for the host render thread.
    pub fn is_frame_due(&self, now: f64) -> bool {
        self.timer.lock().is_due(now)
    }

    /// Schedule the frame about to be shown and advance the video clock.
    pub fn present_video(&self, pts: f64, serial: u64, now: f64) -> Schedule {
        let av_delay = self.av_delay(pts);
        let schedule = self.timer.lock().schedule(pts, av_delay, now);
        self.video.set_at(pts, serial, now);
        self.external.sync_to_slave(&self.video);

        self.frames_presented.fetch_add(1, Ordering::Relaxed);
        if schedule.delay == 0.0 {
            self.frames_late.fetch_add(1, Ordering::Relaxed);
        }
        schedule
    }

    /// Record the audio block just handed to the mixer.
    pub fn present_audio(&self, pts: f64, serial: u64) {
        self.audio.set(pts, serial);
        self.external.sync_to_slave(&self.audio);
    }

    pub fn reset_timer(&self) {
        self.timer.lock().reset();
    }

    pub fn set_paused(&self, paused: bool) {
        let now = wall_time();
        self.audio.set_paused(paused);
        self.video.set_paused(paused);
        self.external.set_paused(paused);
        let mut timer = self.timer.lock();
        if paused {
            timer.pause(now);
        } else {
            timer.resume(now);
        }
    }

    /// Nudge the external clock's speed from packet-queue fill so a live
    /// source neither starves nor overflows. Counts are `None` for streams
    /// not playing.
    pub fn adjust_external_speed(&self, video_packets: Option<usize>, audio_packets: Option<usize>) {
        let starving = video_packets.is_some_and(|n| n <= EXTERNAL_CLOCK_MIN_FRAMES)
            || audio_packets.is_some_and(|n| n <= EXTERNAL_CLOCK_MIN_FRAMES);
        let saturated = video_packets.map_or(true, |n| n > EXTERNAL_CLOCK_MAX_FRAMES)
            && audio_packets.map_or(true, |n| n > EXTERNAL_CLOCK_MAX_FRAMES);

        let speed = self.external.speed();
        let next = if starving {
            (speed - EXTERNAL_CLOCK_SPEED_STEP).max(EXTERNAL_CLOCK_SPEED_MIN)
        } else if saturated {
            (speed + EXTERNAL_CLOCK_SPEED_STEP).min(EXTERNAL_CLOCK_SPEED_MAX)
        } else if speed != 1.0 {
            let toward_one = EXTERNAL_CLOCK_SPEED_STEP * (1.0 - speed) / (1.0 - speed).abs();
            let stepped = speed + toward_one;
            // Do not overshoot 1.0.
            if (stepped - 1.0).signum() != (speed - 1.0).signum() {
                1.0
            } else {
                stepped
            }
        } else {
            return;
        };
        if next != speed {
            self.external.set_speed(next);
        }
    }

    /// (presented, presented late)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.frames_presented.load(Ordering::Relaxed),
            self.frames_late.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(mode: SyncMode) -> SyncController {
        SyncController::new(mode, Arc::new(Clock::new(None)), Arc::new(Clock::new(None)))
    }

    #[test]
    fn test_target_delay_cases() {
        let d = 1.0 / 30.0;
        assert_eq!(compute_target_delay(d, None), d);
        assert_eq!(compute_target_delay(d, Some(0.0)), d);
        // Behind master.
        assert_eq!(compute_target_delay(d, Some(-0.2)), 0.0);
        // Ahead, short frame: doubled.
        assert_eq!(compute_target_delay(d, Some(0.2)), 2.0 * d);
        // Ahead, long frame: extended by the drift.
        assert!((compute_target_delay(0.2, Some(0.3)) - 0.5).abs() < 1e-12);
        // Beyond the no-sync window.
        assert_eq!(compute_target_delay(d, Some(12.0)), d);
        assert_eq!(compute_target_delay(d, Some(-12.0)), d);
    }

    #[test]
    fn test_target_delay_bounded_over_sweep() {
        for &pts_delay in &[0.01, 1.0 / 60.0, 1.0 / 30.0, 0.04, 0.1, 0.15, 0.5] {
            let mut diff = -11.0;
            while diff <= 11.0 {
                let delay = compute_target_delay(pts_delay, Some(diff));
                assert!(delay >= 0.0);
                assert!(delay <= 2.0 * pts_delay + diff.abs().min(NOSYNC_THRESHOLD));
                diff += 0.01;
            }
        }
    }

    #[test]
    fn test_timer_uses_last_good_delay() {
        let mut timer = FrameTimer::new();
        let first = timer.schedule(0.0, None, 100.0);
        assert!((first.delay - INITIAL_FRAME_DELAY).abs() < 1e-12);

        let second = timer.schedule(0.5, None, 100.04);
        assert!((second.delay - 0.5).abs() < 1e-12);

        // Backwards pts falls back to the remembered delay.
        let third = timer.schedule(0.2, None, 100.54);
        assert!((third.delay - 0.5).abs() < 1e-12);
        // Two seconds jump is also rejected.
        let fourth = timer.schedule(2.2, None, 101.04);
        assert!((fourth.delay - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_timer_wait_floor_and_catch_up() {
        let mut timer = FrameTimer::new();
        timer.schedule(0.0, None, 10.0);
        // Host presents far too late: timer snaps to now and the next frame
        // still gets a full interval.
        let late = timer.schedule(1.0 / 30.0, None, 15.0);
        assert!((late.wait - 1.0 / 30.0).abs() < 1e-9);
        assert!((late.due - (15.0 + 1.0 / 30.0)).abs() < 1e-9);
        assert!(!timer.is_due(15.02));
        assert!(timer.is_due(15.04));

        // Frames following a catch-up keep their spacing.
        let next = timer.schedule(2.0 / 30.0, None, 15.04);
        assert!((next.due - (15.0 + 2.0 / 30.0)).abs() < 1e-9);

        // Presented right on time: the wait is floored.
        let mut timer = FrameTimer::new();
        timer.schedule(0.0, None, 10.0);
        let tight = timer.schedule(0.001, None, 10.035);
        assert!((tight.wait - MIN_REFRESH_DELAY).abs() < 1e-12);
    }

    #[test]
    fn test_timer_pause_shifts_schedule() {
        let mut timer = FrameTimer::new();
        let s = timer.schedule(0.0, None, 10.0);
        timer.pause(10.01);
        timer.resume(12.01);
        assert!((timer.next_due() - (s.due + 2.0)).abs() < 1e-9);
    }

    #[test]
    fn test_master_fallback() {
        let sync = controller(SyncMode::AudioMaster);
        sync.set_streams(false, true);
        assert_eq!(sync.master(), MasterClock::External);
        sync.set_streams(true, true);
        assert_eq!(sync.master(), MasterClock::Audio);

        let sync = controller(SyncMode::VideoMaster);
        sync.set_streams(true, false);
        assert_eq!(sync.master(), MasterClock::Audio);
        sync.set_streams(true, true);
        assert_eq!(sync.master(), MasterClock::Video);
        assert_eq!(sync.av_delay(1.0), None);
    }

    #[test]
    fn test_video_ahead_of_audio_is_held_back() {
        let sync = controller(SyncMode::AudioMaster);
        sync.set_streams(true, true);
        sync.audio_clock().set(0.5, 0);

        let now = wall_time();
        let first = sync.present_video(1.0, 0, now);
        // Short frame: doubled.
        assert!((first.delay - 2.0 * INITIAL_FRAME_DELAY).abs() < 1e-12);

        // Long frame (0.2 > FRAMEDUP): extended by the 0.7 s drift.
        let second = sync.present_video(1.2, 0, now);
        assert!((second.delay - 0.9).abs() < 0.01);
    }

    #[test]
    fn test_external_speed_adjustment() {
        let sync = controller(SyncMode::External);
        sync.external_clock().set(0.0, 0);

        sync.adjust_external_speed(Some(1), Some(20));
        assert!((sync.external_clock().speed() - 0.999).abs() < 1e-12);

        for _ in 0..500 {
            sync.adjust_external_speed(Some(0), None);
        }
        assert!((sync.external_clock().speed() - EXTERNAL_CLOCK_SPEED_MIN).abs() < 1e-9);

        for _ in 0..500 {
            sync.adjust_external_speed(Some(50), Some(50));
        }
        assert!((sync.external_clock().speed() - EXTERNAL_CLOCK_SPEED_MAX).abs() < 1e-9);

        for _ in 0..50 {
            sync.adjust_external_speed(Some(5), Some(5));
        }
        assert_eq!(sync.external_clock().speed(), 1.0);
    }
}
