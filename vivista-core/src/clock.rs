//! Presentation clocks.
//!
//! A clock stores the last pts it was set to together with the wall time
//! of that update, so reading it extrapolates forward at `speed`. A clock
//! bound to a packet queue reads as `None` once that queue has been flushed
//! past the serial the clock was last set with.

use crate::media::Serial;
use crate::packet_queue::SerialHandle;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::time::Instant;

/// Clocks further apart than this are not corrected, they are reset.
pub const NOSYNC_THRESHOLD: f64 = 10.0;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic seconds since the first call in this process.
pub fn wall_time() -> f64 {
    EPOCH.elapsed().as_secs_f64()
}

#[derive(Debug, Clone, Copy)]
struct ClockState {
    pts: Option<f64>,
    pts_drift: f64,
    last_updated: f64,
    speed: f64,
    serial: Option<Serial>,
    paused: bool,
}

#[derive(Debug)]
pub struct Clock {
    state: Mutex<ClockState>,
    /// `None` for a free-running clock (the external clock).
    queue_serial: Option<SerialHandle>,
}

impl Clock {
    pub fn new(queue_serial: Option<SerialHandle>) -> Self {
        Self {
            state: Mutex::new(ClockState {
                pts: None,
                pts_drift: 0.0,
                last_updated: wall_time(),
                speed: 1.0,
                serial: None,
                paused: false,
            }),
            queue_serial,
        }
    }

    pub fn get(&self) -> Option<f64> {
        self.get_at(wall_time())
    }

    pub fn get_at(&self, now: f64) -> Option<f64> {
        let state = *self.state.lock();
        if let Some(queue_serial) = &self.queue_serial {
            if state.serial != Some(queue_serial.get()) {
                return None;
            }
        }
        let pts = state.pts?;
        if state.paused {
            return Some(pts);
        }
        Some(state.pts_drift + now - (now - state.last_updated) * (1.0 - state.speed))
    }

    pub fn set_at(&self, pts: f64, serial: Serial, now: f64) {
        let mut state = self.state.lock();
        Self::store(&mut state, pts, serial, now);
    }

    fn store(state: &mut ClockState, pts: f64, serial: Serial, now: f64) {
        state.pts = Some(pts);
        state.last_updated = now;
        state.pts_drift = pts - now;
        state.serial = Some(serial);
    }

    pub fn set(&self, pts: f64, serial: Serial) {
        self.set_at(pts, serial, wall_time());
    }

    /// Change the rate without a jump in the current reading.
    pub fn set_speed(&self, speed: f64) {
        let now = wall_time();
        if let (Some(current), Some(serial)) = (self.get_at(now), self.serial()) {
            self.set_at(current, serial, now);
        }
        self.state.lock().speed = speed;
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().speed
    }

    pub fn serial(&self) -> Option<Serial> {
        self.state.lock().serial
    }

    /// Freeze or resume. Paused clocks hold their value; resuming continues
    /// from it rather than jumping by the paused interval.
    pub fn set_paused(&self, paused: bool) {
        let now = wall_time();
        let current = self.get_at(now);
        let mut state = self.state.lock();
        if state.paused == paused {
            return;
        }
        if let (Some(pts), Some(serial)) = (current, state.serial) {
            Self::store(&mut state, pts, serial, now);
        }
        state.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Snap to `slave` when this clock is unset or too far off.
    pub fn sync_to_slave(&self, slave: &Clock) {
        let now = wall_time();
        let (Some(slave_pts), Some(slave_serial)) = (slave.get_at(now), slave.serial()) else {
            return;
        };
        let needs_sync = match self.get_at(now) {
            None => true,
            Some(own) => (own - slave_pts).abs() > NOSYNC_THRESHOLD,
        };
        if needs_sync {
            self.set_at(slave_pts, slave_serial, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_queue::BoundedPacketQueue;

    #[test]
    fn test_unset_clock_reads_none() {
        let clock = Clock::new(None);
        assert_eq!(clock.get(), None);
    }

    #[test]
    fn test_extrapolates_from_last_set() {
        let clock = Clock::new(None);
        clock.set_at(5.0, 0, 100.0);
        let read = clock.get_at(100.5).unwrap();
        assert!((read - 5.5).abs() < 1e-9);
    }

    #[test]
    fn test_speed_scales_progress() {
        let clock = Clock::new(None);
        clock.set_at(0.0, 0, 10.0);
        clock.state.lock().speed = 0.5;
        let read = clock.get_at(12.0).unwrap();
        assert!((read - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_stale_serial_invalidates() {
        let queue = BoundedPacketQueue::new("audio", 1024);
        let clock = Clock::new(Some(queue.serial_handle()));
        clock.set(1.0, queue.serial());
        assert!(clock.get().is_some());

        queue.flush();
        assert_eq!(clock.get(), None);

        clock.set(3.0, queue.serial());
        assert!(clock.get().unwrap() >= 3.0);
    }

    #[test]
    fn test_pause_holds_value() {
        let clock = Clock::new(None);
        clock.set(2.0, 0);
        clock.set_paused(true);
        let frozen = clock.get().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(clock.get().unwrap(), frozen);

        clock.set_paused(false);
        let resumed = clock.get().unwrap();
        assert!(resumed - frozen < 0.015);
    }

    #[test]
    fn test_sync_to_slave() {
        let master = Clock::new(None);
        let slave = Clock::new(None);
        slave.set(20.0, 3);

        master.sync_to_slave(&slave);
        assert!((master.get().unwrap() - 20.0).abs() < 0.05);
        assert_eq!(master.serial(), Some(3));

        // Close enough: left alone.
        master.set(21.0, 3);
        master.sync_to_slave(&slave);
        assert!(master.get().unwrap() >= 21.0);
    }
}
