//! # Stream Decoders
//!
//! One thread per opened stream. The loop is shared; what happens to a
//! decoded frame is up to the stage:
//!
//! ```text
//!   PacketQueue ──get──► StreamDecoder ──send/receive──► CodecContext
//!                              │
//!                              ▼
//!                     VideoStage / AudioStage ──push──► FrameBuffer
//! ```
//!
//! A flush marker (or a packet carrying a newer serial) resets the codec and
//! the stage. An end-of-stream marker drains the codec; the thread then
//! keeps waiting, since a seek can restart playback.

use crate::backend::{CodecContext, DecodeStatus, RawFrame, Rational, StreamParams};
use crate::config::AudioChannelMode;
use crate::convert::to_i420;
use crate::frame_buffer::{FrameBuffer, PushOutcome};
use crate::media::{AudioFrame, OutputSampleFormat, Packet, Serial, VideoFrame};
use crate::packet_queue::{BoundedPacketQueue, QueueGet};
use crate::resample::Resampler;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

/// Used when the stream declares no frame rate.
pub const DEFAULT_FRAME_DURATION: f64 = 0.04;

/// Whether the decode loop should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFlow {
    Continue,
    Stop,
}

impl From<PushOutcome> for StageFlow {
    fn from(outcome: PushOutcome) -> Self {
        match outcome {
            PushOutcome::Aborted => Self::Stop,
            PushOutcome::Pushed | PushOutcome::Stale => Self::Continue,
        }
    }
}

/// Per-kind frame handling behind a [`StreamDecoder`].
pub trait DecodeStage: Send {
    fn kind(&self) -> &'static str;
    /// A new serial begins; forget timing history.
    fn reset(&mut self);
    /// Called before `packet` is sent to the codec.
    fn on_packet(&mut self, _packet: &Packet) {}
    fn on_frame(&mut self, frame: RawFrame, serial: Serial) -> StageFlow;
}

// ============================================================================
// Timestamp Correction
// ============================================================================

/// Chooses between reordered pts and packet dts, preferring whichever has
/// gone backwards less often.
#[derive(Debug, Clone, Default)]
pub struct PtsCorrection {
    faulty_pts: u64,
    faulty_dts: u64,
    last_pts: Option<i64>,
    last_dts: Option<i64>,
}

impl PtsCorrection {
    pub fn guess(&mut self, pts: Option<i64>, dts: Option<i64>) -> Option<i64> {
        if let Some(dts) = dts {
            if self.last_dts.is_some_and(|last| dts <= last) {
                self.faulty_dts += 1;
            }
            self.last_dts = Some(dts);
        }
        if let Some(pts) = pts {
            if self.last_pts.is_some_and(|last| pts <= last) {
                self.faulty_pts += 1;
            }
            self.last_pts = Some(pts);
        }
        match pts {
            Some(pts) if self.faulty_pts <= self.faulty_dts || dts.is_none() => Some(pts),
            _ => dts,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// Decode Loop
// ============================================================================

pub struct StreamDecoder<S> {
    codec: Box<dyn CodecContext>,
    queue: Arc<BoundedPacketQueue>,
    serial: Serial,
    stage: S,
}

impl<S: DecodeStage + 'static> StreamDecoder<S> {
    pub fn new(codec: Box<dyn CodecContext>, queue: Arc<BoundedPacketQueue>, stage: S) -> Self {
        let serial = queue.serial();
        Self {
            codec,
            queue,
            serial,
            stage,
        }
    }

    pub fn spawn(self, thread_name: &str) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || self.run())
    }

    /// Runs until the packet queue or frame buffer is aborted.
    pub fn run(mut self) {
        debug!("{} decoder started ({})", self.stage.kind(), self.codec.name());
        loop {
            let flow = match self.queue.get(true) {
                QueueGet::Quit => break,
                QueueGet::Empty => StageFlow::Continue,
                QueueGet::Flush { serial } => {
                    self.restart(serial);
                    StageFlow::Continue
                }
                QueueGet::EndOfStream { serial } => {
                    if serial != self.serial {
                        self.restart(serial);
                    }
                    self.drain()
                }
                QueueGet::Packet { packet, serial } => {
                    if serial != self.serial {
                        self.restart(serial);
                    }
                    self.decode(&packet)
                }
            };
            if flow == StageFlow::Stop {
                break;
            }
        }
        debug!("{} decoder stopped", self.stage.kind());
    }

    fn restart(&mut self, serial: Serial) {
        trace!("{} decoder serial {} -> {}", self.stage.kind(), self.serial, serial);
        self.codec.flush();
        self.stage.reset();
        self.serial = serial;
    }

    fn decode(&mut self, packet: &Packet) -> StageFlow {
        self.stage.on_packet(packet);
        if let Err(e) = self.codec.send_packet(Some(packet)) {
            warn!("{} packet dropped: {}", self.stage.kind(), e);
            return StageFlow::Continue;
        }
        self.receive_all()
    }

    fn drain(&mut self) -> StageFlow {
        debug!("{} decoder draining at end of stream", self.stage.kind());
        if let Err(e) = self.codec.send_packet(None) {
            warn!("{} drain failed: {}", self.stage.kind(), e);
            return StageFlow::Continue;
        }
        self.receive_all()
    }

    fn receive_all(&mut self) -> StageFlow {
        loop {
            match self.codec.receive_frame() {
                Ok(DecodeStatus::Frame(frame)) => {
                    if self.stage.on_frame(frame, self.serial) == StageFlow::Stop {
                        return StageFlow::Stop;
                    }
                }
                Ok(DecodeStatus::NeedInput) | Ok(DecodeStatus::Drained) => {
                    return StageFlow::Continue
                }
                Err(e) => {
                    warn!("{} decode error: {}", self.stage.kind(), e);
                    return StageFlow::Continue;
                }
            }
        }
    }
}

// ============================================================================
// Video
// ============================================================================

pub struct VideoStage {
    frames: Arc<FrameBuffer<VideoFrame>>,
    time_base: Rational,
    frame_duration: f64,
    pts_correction: PtsCorrection,
    /// Predicted pts of the next frame.
    next_pts: Option<f64>,
    last_pts: Option<f64>,
}

impl VideoStage {
    pub fn new(frames: Arc<FrameBuffer<VideoFrame>>, params: &StreamParams) -> Self {
        let frame_duration = params
            .frame_rate
            .map(|rate| rate.as_f64())
            .filter(|fps| *fps > 0.0)
            .map_or(DEFAULT_FRAME_DURATION, |fps| 1.0 / fps);
        Self {
            frames,
            time_base: params.time_base,
            frame_duration,
            pts_correction: PtsCorrection::default(),
            next_pts: None,
            last_pts: None,
        }
    }
}

impl DecodeStage for VideoStage {
    fn kind(&self) -> &'static str {
        "video"
    }

    fn reset(&mut self) {
        self.pts_correction.reset();
        self.next_pts = None;
        self.last_pts = None;
    }

    fn on_frame(&mut self, frame: RawFrame, serial: Serial) -> StageFlow {
        let RawFrame::Video(raw) = frame else {
            trace!("video decoder produced a non-video frame");
            return StageFlow::Continue;
        };

        let duration = raw
            .duration
            .filter(|d| *d > 0)
            .map_or(self.frame_duration, |d| self.time_base.ticks_to_seconds(d));
        let mut pts = match self.pts_correction.guess(raw.pts, raw.pkt_dts) {
            Some(ticks) => self.time_base.ticks_to_seconds(ticks),
            None => self.next_pts.unwrap_or(0.0),
        };
        if let Some(last) = self.last_pts {
            pts = pts.max(last);
        }
        self.last_pts = Some(pts);
        self.next_pts = Some(pts + duration);

        let planes = match to_i420(&raw) {
            Ok(planes) => planes,
            Err(e) => {
                warn!("video frame at {:.3}s dropped: {}", pts, e);
                return StageFlow::Continue;
            }
        };

        self.frames
            .push_blocking(VideoFrame {
                width: planes.width,
                height: planes.height,
                y: planes.y,
                u: planes.u,
                v: planes.v,
                pts,
                duration,
                serial,
            })
            .into()
    }
}

// ============================================================================
// Audio
// ============================================================================

pub struct AudioStage {
    frames: Arc<FrameBuffer<AudioFrame>>,
    time_base: Rational,
    mode: AudioChannelMode,
    out_rate: Option<u32>,
    resampler: Option<Resampler>,
    /// Running audio clock: pts of the next produced sample.
    clock: Option<f64>,
}

impl AudioStage {
    pub fn new(
        frames: Arc<FrameBuffer<AudioFrame>>,
        params: &StreamParams,
        mode: AudioChannelMode,
        out_rate: Option<u32>,
    ) -> Self {
        Self {
            frames,
            time_base: params.time_base,
            mode,
            out_rate,
            resampler: None,
            clock: None,
        }
    }
}

impl DecodeStage for AudioStage {
    fn kind(&self) -> &'static str {
        "audio"
    }

    fn reset(&mut self) {
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        self.clock = None;
    }

    fn on_packet(&mut self, packet: &Packet) {
        if let Some(pts) = packet.pts {
            self.clock = Some(self.time_base.ticks_to_seconds(pts));
        }
    }

    fn on_frame(&mut self, frame: RawFrame, serial: Serial) -> StageFlow {
        let RawFrame::Audio(raw) = frame else {
            trace!("audio decoder produced a non-audio frame");
            return StageFlow::Continue;
        };

        if !self.resampler.as_ref().is_some_and(|r| r.matches(&raw)) {
            match Resampler::new(raw.channels, raw.format, raw.sample_rate, self.mode, self.out_rate)
            {
                Ok(resampler) => {
                    debug!(
                        "audio resampler: {}ch {:?} {}Hz -> {}ch f32 {}Hz",
                        raw.channels,
                        raw.format,
                        raw.sample_rate,
                        resampler.output_channels(),
                        resampler.output_rate()
                    );
                    self.resampler = Some(resampler);
                }
                Err(e) => {
                    warn!("audio frame dropped: {}", e);
                    return StageFlow::Continue;
                }
            }
        }
        let Some(resampler) = self.resampler.as_mut() else {
            return StageFlow::Continue;
        };

        let samples = match resampler.process(&raw) {
            Ok(samples) if !samples.is_empty() => samples,
            Ok(_) => return StageFlow::Continue,
            Err(e) => {
                warn!("audio frame dropped: {}", e);
                return StageFlow::Continue;
            }
        };
        let channels = resampler.output_channels();
        let sample_rate = resampler.output_rate();

        let pts = self
            .clock
            .or_else(|| raw.pts.map(|t| self.time_base.ticks_to_seconds(t)))
            .unwrap_or(0.0);
        self.clock = Some(pts + samples.len() as f64 / (channels as f64 * sample_rate as f64));

        let nb_samples = samples.len() / channels as usize;
        self.frames
            .push_blocking(AudioFrame {
                sample_rate,
                channels,
                sample_format: OutputSampleFormat::F32,
                samples: samples.into(),
                nb_samples,
                pts,
                serial,
            })
            .into()
    }
}

pub type VideoDecoder = StreamDecoder<VideoStage>;
pub type AudioDecoder = StreamDecoder<AudioStage>;
