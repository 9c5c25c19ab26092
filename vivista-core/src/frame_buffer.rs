//! # Frame Buffer - Decoded Frames Awaiting Presentation
//!
//! Count-capped FIFO between a stream decoder and the host:
//! - Producer blocks while the buffer is FULL
//! - Frames older than the producing queue's serial are never delivered
//! - Abort wakes both sides for shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐    ┌─────────────┐    ┌──────────────┐
//! │ Decoder  │───►│ FrameBuffer │───►│ Host render/ │
//! │ Thread   │    │ (cap N)     │    │ audio thread │
//! └──────────┘    └─────────────┘    └──────────────┘
//!                       ▲
//!                 serial of the packet queue
//! ```

use crate::cancel::Abortable;
use crate::media::{BufferState, Timestamped};
use crate::packet_queue::SerialHandle;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(test)]
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// The queue was flushed while the frame was waiting; dropped.
    Stale,
    Aborted,
}

/// Buffer statistics
#[derive(Debug, Clone)]
pub struct BufferStats {
    pub len: usize,
    pub capacity: usize,
    pub pushed: u64,
    pub popped: u64,
    pub stale_dropped: u64,
}

struct Inner<T> {
    frames: VecDeque<T>,
    aborted: bool,
}

pub struct FrameBuffer<T> {
    name: &'static str,
    inner: Mutex<Inner<T>>,
    /// Signalled when a frame arrives.
    ready_cond: Condvar,
    /// Signalled when room frees up.
    space_cond: Condvar,
    capacity: usize,
    queue_serial: SerialHandle,
    pushed: AtomicU64,
    popped: AtomicU64,
    stale_dropped: AtomicU64,
}

impl<T: Timestamped + Clone + Send> FrameBuffer<T> {
    pub fn new(name: &'static str, capacity: usize, queue_serial: SerialHandle) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                aborted: false,
            }),
            ready_cond: Condvar::new(),
            space_cond: Condvar::new(),
            capacity,
            queue_serial,
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            stale_dropped: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Producer API (Decoder Thread)
    // ========================================================================

    /// Append a frame, waiting while full. Serial and abort are re-checked
    /// on every wake.
    pub fn push_blocking(&self, frame: T) -> PushOutcome {
        let mut inner = self.inner.lock();
        loop {
            if inner.aborted {
                return PushOutcome::Aborted;
            }
            if frame.serial() != self.queue_serial.get() {
                self.stale_dropped.fetch_add(1, Ordering::Relaxed);
                return PushOutcome::Stale;
            }
            if inner.frames.len() < self.capacity {
                break;
            }
            self.space_cond.wait(&mut inner);
        }

        inner.frames.push_back(frame);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.ready_cond.notify_one();
        PushOutcome::Pushed
    }

    // ========================================================================
    // Consumer API (Host Thread)
    // ========================================================================

    /// Copy of the oldest frame. Cheap: frame payloads are shared.
    pub fn front_cloned(&self) -> Option<T> {
        self.inner.lock().frames.front().cloned()
    }

    pub fn pop_front(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let frame = inner.frames.pop_front()?;
        self.popped.fetch_add(1, Ordering::Relaxed);
        self.space_cond.notify_one();
        Some(frame)
    }

    /// Pop the oldest frame only if `matches` accepts it.
    pub fn pop_front_if(&self, matches: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut inner = self.inner.lock();
        if !inner.frames.front().is_some_and(matches) {
            return None;
        }
        let frame = inner.frames.pop_front()?;
        self.popped.fetch_add(1, Ordering::Relaxed);
        self.space_cond.notify_one();
        Some(frame)
    }

    /// Pop with blocking when empty.
    #[cfg(test)]
    pub(crate) fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();

        while inner.frames.is_empty() {
            if inner.aborted {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            self.ready_cond.wait_for(&mut inner, remaining);
        }

        let frame = inner.frames.pop_front()?;
        self.popped.fetch_add(1, Ordering::Relaxed);
        self.space_cond.notify_one();
        Some(frame)
    }

    /// Discard leading frames from an older serial. Returns how many went.
    pub fn drop_stale_front(&self) -> usize {
        let current = self.queue_serial.get();
        let mut inner = self.inner.lock();
        let mut dropped = 0;
        while inner
            .frames
            .front()
            .is_some_and(|frame| frame.serial() != current)
        {
            inner.frames.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            self.stale_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            self.space_cond.notify_all();
        }
        dropped
    }

    /// Discard every frame from an older serial and wake a producer
    /// waiting on a full buffer.
    pub fn purge_stale(&self) -> usize {
        let current = self.queue_serial.get();
        let mut inner = self.inner.lock();
        let before = inner.frames.len();
        inner.frames.retain(|frame| frame.serial() == current);
        let dropped = before - inner.frames.len();
        self.stale_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        self.space_cond.notify_all();
        if dropped > 0 {
            tracing::debug!(buffer = self.name, dropped, "purged stale frames");
        }
        dropped
    }

    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.frames.len();
        inner.frames.clear();
        self.stale_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        self.space_cond.notify_all();
        tracing::debug!(buffer = self.name, dropped, "frame buffer flushed");
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> BufferState {
        BufferState::from_fill(self.len(), self.capacity)
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            len: self.len(),
            capacity: self.capacity,
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
        }
    }
}

impl<T: Send> Abortable for FrameBuffer<T> {
    fn abort(&self) {
        let mut inner = self.inner.lock();
        inner.aborted = true;
        self.ready_cond.notify_all();
        self.space_cond.notify_all();
    }
}

/// Type-erased handle the read loop uses to drop pre-seek frames.
pub trait StalePurge: Send + Sync {
    fn purge_stale(&self) -> usize;
}

impl<T: Timestamped + Clone + Send> StalePurge for FrameBuffer<T> {
    fn purge_stale(&self) -> usize {
        FrameBuffer::purge_stale(self)
    }
}
