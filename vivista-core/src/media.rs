//! Data flowing through the pipeline: compressed packets in, presentation
//! ready frames out, and the per-stream info the host polls.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Flush generation of a packet queue.
pub type Serial = u64;

// ============================================================================
// Packet
// ============================================================================

/// One compressed unit read from the container.
#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_index: usize,
    /// Timestamps in the stream's time base.
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: Option<i64>,
    pub keyframe: bool,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(stream_index: usize, payload: Bytes) -> Self {
        Self {
            stream_index,
            pts: None,
            dts: None,
            duration: None,
            keyframe: false,
            payload,
        }
    }

    pub fn byte_size(&self) -> usize {
        self.payload.len()
    }
}

// ============================================================================
// Frames
// ============================================================================

/// Frames carry the serial of the queue generation that produced them.
pub trait Timestamped {
    fn serial(&self) -> Serial;
    fn pts(&self) -> f64;
}

/// Planar 4:2:0 picture, planes tightly packed.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub y: Bytes,
    pub u: Bytes,
    pub v: Bytes,
    /// Seconds.
    pub pts: f64,
    pub duration: f64,
    pub serial: Serial,
}

impl VideoFrame {
    pub fn chroma_width(&self) -> u32 {
        self.width.div_ceil(2)
    }

    pub fn chroma_height(&self) -> u32 {
        self.height.div_ceil(2)
    }
}

impl Timestamped for VideoFrame {
    fn serial(&self) -> Serial {
        self.serial
    }
    fn pts(&self) -> f64 {
        self.pts
    }
}

/// Sample layout of PCM handed to the host. Always interleaved `f32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputSampleFormat {
    F32,
}

#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: OutputSampleFormat,
    /// Interleaved, `nb_samples * channels` values.
    pub samples: Arc<[f32]>,
    /// Samples per channel.
    pub nb_samples: usize,
    pub pts: f64,
    pub serial: Serial,
}

impl AudioFrame {
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.nb_samples as f64 / self.sample_rate as f64
    }
}

impl Timestamped for AudioFrame {
    fn serial(&self) -> Serial {
        self.serial
    }
    fn pts(&self) -> f64 {
        self.pts
    }
}

// ============================================================================
// Stream Info
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferState {
    Empty,
    Normal,
    Full,
}

impl BufferState {
    pub fn from_fill(len: usize, capacity: usize) -> Self {
        if len == 0 {
            Self::Empty
        } else if len >= capacity {
            Self::Full
        } else {
            Self::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub is_enabled: bool,
    pub is_present: bool,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<f64>,
    pub last_presented_time: Option<f64>,
    pub total_duration: f64,
    pub buffer_state: BufferState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub is_enabled: bool,
    pub is_present: bool,
    /// Output layout after resampling.
    pub channels: u16,
    pub sample_rate: u32,
    pub last_presented_time: Option<f64>,
    pub total_duration: f64,
    pub buffer_state: BufferState,
}
