//! # Vivista Core
//!
//! Playback engine behind the Vivista native plugin: demultiplexes a media
//! container, decodes video and audio on their own threads, converts the
//! output into I420 pictures and interleaved `f32` PCM, and paces
//! presentation against a master clock.
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ ReadLoop │──►│ PacketQueue │──►│ StreamDecoder│──►│ FrameBuffer │──► host
//! └──────────┘   └─────────────┘   └──────────────┘   └─────────────┘
//!       ▲                                                    │
//!       └──────────── PlaybackSession / SyncController ◄─────┘
//! ```

// ============================================================================
// Configuration / State
// ============================================================================
pub mod config;
pub mod state;

// ============================================================================
// Timing
// ============================================================================
pub mod clock;
pub mod sync;

// ============================================================================
// Buffering
// ============================================================================
pub mod cancel;
pub mod media;
pub mod packet_queue;
pub mod frame_buffer;

// ============================================================================
// Codec Backend / Conversion
// ============================================================================
pub mod backend;
pub mod convert;
pub mod resample;
pub mod synthetic;

// ============================================================================
// Pipeline
// ============================================================================
pub mod decoder;
pub mod demuxer;
pub mod session;
pub mod manager;

pub use config::{AudioChannelMode, ConfigError, PlayerConfig, SyncMode, Transport};
pub use manager::{ContextId, PlaybackManager};
pub use media::{AudioFrame, AudioInfo, BufferState, Packet, VideoFrame, VideoInfo};
pub use session::{PlaybackSession, PlayerError};
pub use state::PlayerState;
pub use sync::MasterClock;
