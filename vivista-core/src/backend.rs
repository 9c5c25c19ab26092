//! # Codec Backend Interface
//!
//! Container parsing and bitstream decoding live outside this crate. A
//! backend supplies them through three narrow traits:
//!
//! - [`MediaBackend`]: opens containers, looks up and opens decoders
//! - [`ContainerReader`]: stream discovery, packet reads, seeking
//! - [`CodecContext`]: send/receive decoding of one stream
//!
//! Backends hand back raw frames in the codec's own layout; rescaling and
//! resampling happen in [`crate::convert`] and [`crate::resample`].

use crate::config::Transport;
use crate::convert::{ColorSpace, PixelFormat};
use crate::media::Packet;
use crate::resample::SampleFormat;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to open {path}: {reason}")]
    Open { path: String, reason: String },
    #[error("Stream info unavailable: {0}")]
    StreamInfo(String),
    #[error("Failed to open {codec} decoder: {reason}")]
    DecoderOpen { codec: String, reason: String },
    #[error("Seek to {timestamp} on stream {stream_index} failed: {reason}")]
    Seek {
        stream_index: usize,
        timestamp: i64,
        reason: String,
    },
    /// Worth retrying after a short wait (network hiccup, EAGAIN).
    #[error("Read temporarily unavailable: {0}")]
    Transient(String),
    #[error("Read failed: {0}")]
    Read(String),
    #[error("Decode failed: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// ============================================================================
// Stream Description
// ============================================================================

/// Rational number, used for time bases and frame rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }

    /// Ticks of this time base to seconds.
    pub fn ticks_to_seconds(&self, ticks: i64) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        ticks as f64 * self.num as f64 / self.den as f64
    }

    /// Seconds to the nearest tick of this time base.
    pub fn seconds_to_ticks(&self, seconds: f64) -> i64 {
        if self.num == 0 {
            return 0;
        }
        (seconds * self.den as f64 / self.num as f64).round() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Other,
}

/// Identifies a codec, e.g. `"h264"` or `"aac"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodecId(pub String);

impl std::fmt::Display for CodecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct StreamParams {
    pub index: usize,
    pub kind: StreamKind,
    pub codec: CodecId,
    pub time_base: Rational,
    /// In `time_base` ticks.
    pub duration: Option<i64>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: Option<PixelFormat>,
    pub frame_rate: Option<Rational>,
    pub channels: u16,
    pub sample_rate: u32,
    pub sample_format: Option<SampleFormat>,
}

impl StreamParams {
    pub fn duration_seconds(&self) -> Option<f64> {
        self.duration.map(|d| self.time_base.ticks_to_seconds(d))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub streams: Vec<StreamParams>,
    /// Whole-container duration in seconds, when known.
    pub duration: Option<f64>,
}

impl ContainerInfo {
    /// Preferred stream of `kind` if it exists, else the first one.
    pub fn select(&self, kind: StreamKind, preferred: Option<usize>) -> Option<&StreamParams> {
        preferred
            .and_then(|index| self.streams.iter().find(|s| s.index == index && s.kind == kind))
            .or_else(|| self.streams.iter().find(|s| s.kind == kind))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeekFlags {
    /// Land on the nearest keyframe at or before the target.
    pub backward: bool,
    /// Allow landing on a non-keyframe.
    pub any: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderHandle {
    pub codec: CodecId,
    pub name: String,
}

// ============================================================================
// Raw Frames
// ============================================================================

#[derive(Debug, Clone)]
pub struct RawVideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub color_space: ColorSpace,
    pub planes: Vec<Bytes>,
    pub strides: Vec<usize>,
    /// Reordered pts and the dts of the packet that produced the frame, in
    /// stream time base.
    pub pts: Option<i64>,
    pub pkt_dts: Option<i64>,
    pub duration: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RawAudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    /// Samples per channel.
    pub nb_samples: usize,
    /// One plane for packed formats, one per channel for planar.
    pub planes: Vec<Bytes>,
    pub pts: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum RawFrame {
    Video(RawVideoFrame),
    Audio(RawAudioFrame),
}

pub enum ReadOutcome {
    Packet(Packet),
    EndOfStream,
}

pub enum DecodeStatus {
    Frame(RawFrame),
    /// Send another packet.
    NeedInput,
    /// Fully drained after end of stream.
    Drained,
}

// ============================================================================
// Traits
// ============================================================================

pub trait ContainerReader: Send {
    fn find_stream_info(&mut self) -> Result<ContainerInfo, BackendError>;
    fn read_packet(&mut self) -> Result<ReadOutcome, BackendError>;
    fn seek(&mut self, stream_index: usize, timestamp: i64, flags: SeekFlags)
        -> Result<(), BackendError>;
}

pub trait CodecContext: Send {
    /// `None` signals end of stream.
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<(), BackendError>;
    fn receive_frame(&mut self) -> Result<DecodeStatus, BackendError>;
    /// Drop buffered input and output; ready for new data.
    fn flush(&mut self);
    fn name(&self) -> &str;
}

pub trait MediaBackend: Send + Sync {
    fn open(&self, path: &str, transport: Transport)
        -> Result<Box<dyn ContainerReader>, BackendError>;
    fn find_decoder(&self, codec: &CodecId) -> Option<DecoderHandle>;
    /// `threads` of `None` leaves threading to the backend.
    fn open_decoder(
        &self,
        decoder: &DecoderHandle,
        params: &StreamParams,
        threads: Option<u32>,
    ) -> Result<Box<dyn CodecContext>, BackendError>;
}
