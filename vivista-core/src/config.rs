//! Player Configuration
//!
//! Everything the host can tune per session. Loaded from JSON, defaults
//! match the native plugin's compiled-in values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// 5 * 256 KiB of compressed video.
pub const DEFAULT_VIDEO_QUEUE_BYTES: usize = 5 * 256 * 1024;
/// 5 * 16 KiB of compressed audio.
pub const DEFAULT_AUDIO_QUEUE_BYTES: usize = 5 * 16 * 1024;
pub const DEFAULT_VIDEO_FRAME_CAPACITY: usize = 64;
pub const DEFAULT_AUDIO_FRAME_CAPACITY: usize = 128;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Options
// ============================================================================

/// Which clock the other streams follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    AudioMaster,
    VideoMaster,
    External,
}

/// Transport hint handed to the container backend for network sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
}

/// Output channel layout for decoded audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioChannelMode {
    /// Downmix (or upmix mono) to two channels.
    #[default]
    Stereo,
    /// Keep every source channel.
    Source,
}

// ============================================================================
// Player Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub video_frame_capacity: usize,
    pub audio_frame_capacity: usize,
    pub video_queue_bytes: usize,
    pub audio_queue_bytes: usize,
    pub sync_mode: SyncMode,
    pub transport: Transport,
    /// Allow seeking to non-key frames.
    pub seek_to_any: bool,
    pub audio_channels: AudioChannelMode,
    /// Output rate; `None` keeps the source rate.
    pub audio_sample_rate: Option<u32>,
    /// Gate `get_video_frame` on the frame timer. Hosts doing their own
    /// timing turn this off.
    pub pace_video: bool,
    /// Decoder thread count hint; `None` lets the backend decide.
    pub decoder_threads: Option<u32>,
    pub backpressure_poll_ms: u64,
    pub read_retry_delay_ms: u64,
    pub preferred_video_stream: Option<usize>,
    pub preferred_audio_stream: Option<usize>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            video_frame_capacity: DEFAULT_VIDEO_FRAME_CAPACITY,
            audio_frame_capacity: DEFAULT_AUDIO_FRAME_CAPACITY,
            video_queue_bytes: DEFAULT_VIDEO_QUEUE_BYTES,
            audio_queue_bytes: DEFAULT_AUDIO_QUEUE_BYTES,
            sync_mode: SyncMode::default(),
            transport: Transport::default(),
            seek_to_any: false,
            audio_channels: AudioChannelMode::default(),
            audio_sample_rate: None,
            pace_video: true,
            decoder_threads: None,
            backpressure_poll_ms: 10,
            read_retry_delay_ms: 10,
            preferred_video_stream: None,
            preferred_audio_stream: None,
        }
    }
}

impl PlayerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.video_frame_capacity == 0 || self.audio_frame_capacity == 0 {
            return Err(ConfigError::Invalid("frame capacity must be at least 1".into()));
        }
        if self.video_queue_bytes == 0 || self.audio_queue_bytes == 0 {
            return Err(ConfigError::Invalid("packet queue cap must be non-zero".into()));
        }
        if self.audio_sample_rate == Some(0) {
            return Err(ConfigError::Invalid("audio_sample_rate must be positive".into()));
        }
        if self.decoder_threads == Some(0) {
            return Err(ConfigError::Invalid("decoder_threads must be positive".into()));
        }
        Ok(())
    }

    pub fn backpressure_poll(&self) -> Duration {
        Duration::from_millis(self.backpressure_poll_ms.max(1))
    }

    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms.max(1))
    }
}
