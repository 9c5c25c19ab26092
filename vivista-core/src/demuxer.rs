//! # Read Loop
//!
//! Pulls packets out of the container and routes them to the per-stream
//! packet queues. Owns the container reader, so seeks are carried out here:
//!
//! 1. cancelled → exit
//! 2. pending seek → seek every enabled stream, flush queues, purge frames
//! 3. at end of stream → idle until a seek or cancel
//! 4. an enabled queue over its byte cap → wait
//! 5. read one packet and route it

use crate::backend::{ContainerReader, ReadOutcome, Rational, SeekFlags, StreamKind};
use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::frame_buffer::StalePurge;
use crate::media::Packet;
use crate::packet_queue::BoundedPacketQueue;
use crate::state::{PlayerState, StateCell};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

// ============================================================================
// Seek Requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekRequest {
    /// Seconds, already clamped to the media duration.
    pub target: f64,
    /// State to enter once the seek lands.
    pub resume: PlayerState,
    /// State to go back to if it fails.
    pub restore: PlayerState,
}

/// Latest-wins mailbox between the session and the read loop.
#[derive(Debug, Default)]
pub struct SeekSlot {
    pending: Mutex<Option<SeekRequest>>,
}

impl SeekSlot {
    pub fn request(&self, request: SeekRequest) {
        *self.pending.lock() = Some(request);
    }

    /// Enter `SEEK` from `from`, then post the request. The read loop only
    /// leaves `SEEK` after taking a request, so the state must change
    /// first. Returns false, leaving the slot untouched, if the state has
    /// already moved on.
    pub fn begin(&self, state: &StateCell, from: PlayerState, request: SeekRequest) -> bool {
        if !state.transition(from, PlayerState::Seek) {
            return false;
        }
        self.request(request);
        true
    }

    pub fn take(&self) -> Option<SeekRequest> {
        self.pending.lock().take()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Where packets of one opened stream go.
pub struct Route {
    pub stream_index: usize,
    pub kind: StreamKind,
    pub time_base: Rational,
    pub queue: Arc<BoundedPacketQueue>,
    pub frames: Arc<dyn StalePurge>,
    pub enabled: Arc<AtomicBool>,
}

impl Route {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReadStats {
    pub packets: u64,
    pub discarded: u64,
    pub transient_errors: u64,
    pub seeks: u64,
    pub failed_seeks: u64,
}

pub struct ReadLoopTiming {
    pub backpressure_poll: Duration,
    pub retry_delay: Duration,
}

pub struct ReadLoop {
    reader: Box<dyn ContainerReader>,
    routes: Vec<Route>,
    state: Arc<StateCell>,
    seek: Arc<SeekSlot>,
    cancel: CancelToken,
    external_clock: Arc<Clock>,
    eof: Arc<AtomicBool>,
    seek_flags: SeekFlags,
    timing: ReadLoopTiming,
    at_eof: bool,
    stats: ReadStats,
}

impl ReadLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reader: Box<dyn ContainerReader>,
        routes: Vec<Route>,
        state: Arc<StateCell>,
        seek: Arc<SeekSlot>,
        cancel: CancelToken,
        external_clock: Arc<Clock>,
        eof: Arc<AtomicBool>,
        seek_to_any: bool,
        timing: ReadLoopTiming,
    ) -> Self {
        Self {
            reader,
            routes,
            state,
            seek,
            cancel,
            external_clock,
            eof,
            seek_flags: SeekFlags {
                backward: !seek_to_any,
                any: seek_to_any,
            },
            timing,
            at_eof: false,
            stats: ReadStats::default(),
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<ReadStats>> {
        std::thread::Builder::new()
            .name("vivista-read".to_string())
            .spawn(move || self.run())
    }

    pub fn run(mut self) -> ReadStats {
        for route in &self.routes {
            debug!(stream = route.stream_index, kind = ?route.kind, "routing stream");
        }
        info!("read loop started with {} stream(s)", self.routes.len());
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if let Some(request) = self.seek.take() {
                self.perform_seek(request);
                continue;
            }

            if self.at_eof || self.is_backed_up() {
                if self.cancel.sleep(self.timing.backpressure_poll) {
                    break;
                }
                continue;
            }

            match self.reader.read_packet() {
                Ok(ReadOutcome::Packet(packet)) => self.route(packet),
                Ok(ReadOutcome::EndOfStream) => self.mark_eof(),
                Err(e) if e.is_transient() => {
                    trace!("transient read error, retrying: {}", e);
                    self.stats.transient_errors += 1;
                    if self.cancel.sleep(self.timing.retry_delay) {
                        break;
                    }
                }
                Err(e) => {
                    warn!("read failed, treating as end of stream: {}", e);
                    self.mark_eof();
                }
            }
        }
        info!(
            packets = self.stats.packets,
            discarded = self.stats.discarded,
            "read loop stopped"
        );
        self.stats
    }

    fn is_backed_up(&self) -> bool {
        self.routes
            .iter()
            .any(|route| route.is_enabled() && route.queue.is_over_cap())
    }

    fn route(&mut self, packet: Packet) {
        let Some(route) = self
            .routes
            .iter()
            .find(|route| route.stream_index == packet.stream_index)
        else {
            self.stats.discarded += 1;
            return;
        };
        match route.queue.put_if(packet, || route.is_enabled()) {
            Ok(true) => self.stats.packets += 1,
            Ok(false) => self.stats.discarded += 1,
            Err(e) => debug!("{}", e),
        }
    }

    fn mark_eof(&mut self) {
        for route in &self.routes {
            let _ = route.queue.put_end_of_stream();
        }
        self.at_eof = true;
        self.state.transition(PlayerState::Playing, PlayerState::PlayEof);
        self.eof.store(true, Ordering::SeqCst);
        info!("end of stream after {} packets", self.stats.packets);
    }

    fn perform_seek(&mut self, request: SeekRequest) {
        self.stats.seeks += 1;
        let mut result = Ok(());
        let mut failed_kind = None;
        let mut seeked_any = false;
        for route in self.routes.iter().filter(|route| route.is_enabled()) {
            let timestamp = route.time_base.seconds_to_ticks(request.target);
            result = self
                .reader
                .seek(route.stream_index, timestamp, self.seek_flags);
            seeked_any = true;
            if result.is_err() {
                failed_kind = Some(route.kind);
                break;
            }
        }
        // Nothing enabled: still reposition so re-enabling resumes near target.
        if !seeked_any {
            if let Some(route) = self.routes.first() {
                let timestamp = route.time_base.seconds_to_ticks(request.target);
                result = self
                    .reader
                    .seek(route.stream_index, timestamp, self.seek_flags);
                failed_kind = Some(route.kind);
            }
        }

        match result {
            Ok(()) => {
                let mut serial = 0;
                for route in &self.routes {
                    serial = route.queue.flush_with_sentinel();
                    route.frames.purge_stale();
                }
                self.external_clock.set(request.target, serial);
                self.at_eof = false;
                self.eof.store(false, Ordering::SeqCst);
                self.state.transition(PlayerState::Seek, request.resume);
                info!("seeked to {:.3}s", request.target);
            }
            Err(e) => {
                self.stats.failed_seeks += 1;
                warn!(
                    kind = ?failed_kind,
                    "seek to {:.3}s failed: {}",
                    request.target,
                    e
                );
                // EOF may have been reached while the request was in flight.
                let restore = if self.at_eof && request.restore == PlayerState::Playing {
                    PlayerState::PlayEof
                } else {
                    request.restore
                };
                self.state.transition(PlayerState::Seek, restore);
            }
        }
    }
}
