//! # Playback Session
//!
//! One opened media file and the threads playing it.
//!
//! ```text
//!   open() ──► INITIALIZED ──start()──► PLAYING ◄──► SEEK
//!                                          │  ▲          │
//!                                 pause()  ▼  │ resume() ▼
//!                                        PAUSE        PLAY_EOF
//!
//!   stop() from anywhere ──► STOP
//! ```
//!
//! Opening is synchronous and fails fast: any missing stream info, decoder
//! or codec context is an error and no thread is started. `start()` spawns
//! the read loop and one decoder per opened stream. The host then pulls
//! frames with `get_*_frame` and hands them back with `free_*_frame`.

use crate::backend::{BackendError, CodecContext, ContainerReader, MediaBackend, StreamKind, StreamParams};
use crate::cancel::CancelToken;
use crate::clock::{wall_time, Clock};
use crate::config::{AudioChannelMode, ConfigError, PlayerConfig};
use crate::decoder::{AudioStage, StreamDecoder, VideoStage};
use crate::demuxer::{ReadLoop, ReadLoopTiming, ReadStats, Route, SeekRequest, SeekSlot};
use crate::frame_buffer::{BufferStats, FrameBuffer};
use crate::manager::ContextId;
use crate::media::{AudioFrame, AudioInfo, BufferState, Serial, Timestamped, VideoFrame, VideoInfo};
use crate::packet_queue::BoundedPacketQueue;
use crate::state::{PlayerState, StateCell};
use crate::sync::{MasterClock, SyncController};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("No decoder for codec {0}")]
    DecoderNotFound(String),
    #[error("No playable audio or video stream in {0}")]
    NoPlayableStream(String),
    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: PlayerState,
    },
    #[error("Failed to spawn {name} thread: {source}")]
    Thread {
        name: &'static str,
        source: std::io::Error,
    },
    #[error("Unknown context {0}")]
    UnknownContext(ContextId),
    #[error("Context {0} is still initializing")]
    Initializing(ContextId),
    #[error("Initialization failed: {0}")]
    InitFailed(String),
}

// ============================================================================
// Per-Stream Slot
// ============================================================================

/// What the host was last given from one stream.
struct Presented<T> {
    /// Handed out and not yet freed.
    front: Option<T>,
    last_time: Option<f64>,
    serial: Option<Serial>,
}

impl<T> Default for Presented<T> {
    fn default() -> Self {
        Self {
            front: None,
            last_time: None,
            serial: None,
        }
    }
}

struct StreamSlot<T> {
    params: StreamParams,
    queue: Arc<BoundedPacketQueue>,
    frames: Arc<FrameBuffer<T>>,
    enabled: Arc<AtomicBool>,
    presented: Mutex<Presented<T>>,
}

impl<T: Timestamped + Clone + Send + 'static> StreamSlot<T> {
    fn new(
        name: &'static str,
        params: StreamParams,
        queue_bytes: usize,
        frame_capacity: usize,
    ) -> Self {
        let queue = Arc::new(BoundedPacketQueue::new(name, queue_bytes));
        let frames = Arc::new(FrameBuffer::new(name, frame_capacity, queue.serial_handle()));
        Self {
            params,
            queue,
            frames,
            enabled: Arc::new(AtomicBool::new(true)),
            presented: Mutex::new(Presented::default()),
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns true if the flag changed. Disabling drops everything queued.
    fn set_enabled(&self, enabled: bool) -> bool {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was && !enabled {
            self.queue.flush_with_sentinel();
            self.frames.flush();
            self.presented.lock().front = None;
        }
        was != enabled
    }

    fn route(&self) -> Route {
        Route {
            stream_index: self.params.index,
            kind: self.params.kind,
            time_base: self.params.time_base,
            queue: self.queue.clone(),
            frames: self.frames.clone(),
            enabled: self.enabled.clone(),
        }
    }

    /// The frame still held by the host, if it belongs to the current
    /// serial. A stale one is forgotten.
    fn held_front(&self, presented: &mut Presented<T>) -> Option<T> {
        let serial = self.queue.serial();
        match &presented.front {
            Some(front) if front.serial() == serial => Some(front.clone()),
            Some(_) => {
                presented.front = None;
                None
            }
            None => None,
        }
    }

    /// Next current-serial frame, without removing it.
    fn next_frame(&self) -> Option<T> {
        self.frames.drop_stale_front();
        self.frames
            .front_cloned()
            .filter(|frame| frame.serial() == self.queue.serial())
    }

    fn mark_presented(&self, presented: &mut Presented<T>, frame: &T) {
        presented.front = Some(frame.clone());
        presented.last_time = Some(frame.pts());
        presented.serial = Some(frame.serial());
    }

    fn free(&self) {
        let Some(front) = self.presented.lock().front.take() else {
            return;
        };
        self.frames
            .pop_front_if(|head| head.serial() == front.serial() && head.pts() == front.pts());
    }

    fn buffer_state(&self) -> BufferState {
        self.frames.state()
    }
}

// ============================================================================
// Session
// ============================================================================

/// Reader and codecs opened by `open()`, moved onto threads by `start()`.
struct Pipeline {
    reader: Box<dyn ContainerReader>,
    video_codec: Option<Box<dyn CodecContext>>,
    audio_codec: Option<Box<dyn CodecContext>>,
}

pub struct PlaybackSession {
    path: String,
    config: PlayerConfig,
    state: Arc<StateCell>,
    cancel: CancelToken,
    video: Option<StreamSlot<VideoFrame>>,
    audio: Option<StreamSlot<AudioFrame>>,
    sync: SyncController,
    seek: Arc<SeekSlot>,
    eof: Arc<AtomicBool>,
    duration: f64,
    pipeline: Mutex<Option<Pipeline>>,
    decoders: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    reader: Mutex<Option<JoinHandle<ReadStats>>>,
}

impl PlaybackSession {
    /// Open `path`, discover its streams and open a decoder for the first
    /// (or preferred) video and audio stream.
    pub fn open(
        backend: &dyn MediaBackend,
        path: &str,
        config: PlayerConfig,
    ) -> Result<Self, PlayerError> {
        config.validate()?;

        let mut reader = backend.open(path, config.transport)?;
        let info = reader.find_stream_info()?;
        for stream in &info.streams {
            debug!(
                "stream #{}: {:?} {} ({}x{}, {} ch @ {} Hz)",
                stream.index,
                stream.kind,
                stream.codec,
                stream.width,
                stream.height,
                stream.channels,
                stream.sample_rate
            );
        }

        let video_params = info
            .select(StreamKind::Video, config.preferred_video_stream)
            .cloned();
        let audio_params = info
            .select(StreamKind::Audio, config.preferred_audio_stream)
            .cloned();
        if video_params.is_none() && audio_params.is_none() {
            return Err(PlayerError::NoPlayableStream(path.to_string()));
        }

        let video_codec = video_params
            .as_ref()
            .map(|params| open_codec(backend, params, config.decoder_threads))
            .transpose()?;
        let audio_codec = audio_params
            .as_ref()
            .map(|params| open_codec(backend, params, config.decoder_threads))
            .transpose()?;

        let duration = info
            .duration
            .filter(|d| d.is_finite() && *d > 0.0)
            .or_else(|| {
                info.streams
                    .iter()
                    .filter_map(StreamParams::duration_seconds)
                    .reduce(f64::max)
            })
            .unwrap_or(0.0);

        let video = video_params.map(|params| {
            StreamSlot::new(
                "video",
                params,
                config.video_queue_bytes,
                config.video_frame_capacity,
            )
        });
        let audio = audio_params.map(|params| {
            StreamSlot::new(
                "audio",
                params,
                config.audio_queue_bytes,
                config.audio_frame_capacity,
            )
        });

        let cancel = CancelToken::new();
        if let Some(slot) = &video {
            cancel.register(slot.queue.clone());
            cancel.register(slot.frames.clone());
        }
        if let Some(slot) = &audio {
            cancel.register(slot.queue.clone());
            cancel.register(slot.frames.clone());
        }

        let audio_clock = Arc::new(Clock::new(audio.as_ref().map(|s| s.queue.serial_handle())));
        let video_clock = Arc::new(Clock::new(video.as_ref().map(|s| s.queue.serial_handle())));
        let sync = SyncController::new(config.sync_mode, audio_clock, video_clock);
        sync.set_streams(audio.is_some(), video.is_some());

        info!(
            "opened {} ({:.2}s, video: {}, audio: {})",
            path,
            duration,
            video.is_some(),
            audio.is_some()
        );

        Ok(Self {
            path: path.to_string(),
            config,
            state: Arc::new(StateCell::new(PlayerState::Initialized)),
            cancel,
            video,
            audio,
            sync,
            seek: Arc::new(SeekSlot::default()),
            eof: Arc::new(AtomicBool::new(false)),
            duration,
            pipeline: Mutex::new(Some(Pipeline {
                reader,
                video_codec,
                audio_codec,
            })),
            decoders: Mutex::new(Vec::new()),
            reader: Mutex::new(None),
        })
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Spawn the decoder threads and the read loop.
    pub fn start(&self) -> Result<(), PlayerError> {
        let state = self.state.get();
        if state != PlayerState::Initialized {
            return Err(PlayerError::InvalidState {
                operation: "start",
                state,
            });
        }
        let Some(pipeline) = self.pipeline.lock().take() else {
            return Err(PlayerError::InvalidState {
                operation: "start",
                state,
            });
        };
        let Pipeline {
            reader,
            video_codec,
            audio_codec,
        } = pipeline;

        let mut routes = Vec::new();
        if let (Some(slot), Some(codec)) = (&self.video, video_codec) {
            let stage = VideoStage::new(slot.frames.clone(), &slot.params);
            let decoder = StreamDecoder::new(codec, slot.queue.clone(), stage);
            self.spawn_decoder("vivista-video", |name| decoder.spawn(name))?;
            routes.push(slot.route());
        }
        if let (Some(slot), Some(codec)) = (&self.audio, audio_codec) {
            let stage = AudioStage::new(
                slot.frames.clone(),
                &slot.params,
                self.config.audio_channels,
                self.config.audio_sample_rate,
            );
            let decoder = StreamDecoder::new(codec, slot.queue.clone(), stage);
            self.spawn_decoder("vivista-audio", |name| decoder.spawn(name))?;
            routes.push(slot.route());
        }

        // The read loop moves SEEK on, so the state must be set first.
        let next = if self.seek.is_pending() {
            PlayerState::Seek
        } else {
            PlayerState::Playing
        };
        if !self.state.transition(PlayerState::Initialized, next) {
            self.abort_threads();
            return Err(PlayerError::InvalidState {
                operation: "start",
                state: self.state.get(),
            });
        }
        self.update_streams();
        self.sync.reset_timer();

        let read_loop = ReadLoop::new(
            reader,
            routes,
            self.state.clone(),
            self.seek.clone(),
            self.cancel.clone(),
            self.sync.external_clock().clone(),
            self.eof.clone(),
            self.config.seek_to_any,
            ReadLoopTiming {
                backpressure_poll: self.config.backpressure_poll(),
                retry_delay: self.config.read_retry_delay(),
            },
        );
        match read_loop.spawn() {
            Ok(handle) => *self.reader.lock() = Some(handle),
            Err(source) => {
                self.abort_threads();
                return Err(PlayerError::Thread {
                    name: "vivista-read",
                    source,
                });
            }
        }
        info!("playback of {} started", self.path);
        Ok(())
    }

    fn spawn_decoder(
        &self,
        name: &'static str,
        spawn: impl FnOnce(&str) -> std::io::Result<JoinHandle<()>>,
    ) -> Result<(), PlayerError> {
        match spawn(name) {
            Ok(handle) => {
                self.decoders.lock().push((name, handle));
                Ok(())
            }
            Err(source) => {
                self.abort_threads();
                Err(PlayerError::Thread { name, source })
            }
        }
    }

    /// Request a seek to `seconds`, clamped to the media duration. Before
    /// `start()` the request is kept and carried out first thing.
    pub fn seek(&self, seconds: f64) -> Result<(), PlayerError> {
        let target = if seconds.is_finite() {
            seconds.clamp(0.0, self.duration.max(0.0))
        } else {
            0.0
        };
        loop {
            let state = self.state.get();
            if !state.accepts_seek() {
                return Err(PlayerError::InvalidState {
                    operation: "seek",
                    state,
                });
            }
            if state == PlayerState::Initialized {
                self.seek.request(SeekRequest {
                    target,
                    resume: PlayerState::Playing,
                    restore: PlayerState::Playing,
                });
                debug!("seek to {:.3}s queued until start", target);
                return Ok(());
            }

            let resume = if state == PlayerState::Pause {
                PlayerState::Pause
            } else {
                PlayerState::Playing
            };
            let request = SeekRequest {
                target,
                resume,
                restore: state,
            };
            if self.seek.begin(&self.state, state, request) {
                info!("seek to {:.3}s requested", target);
                return Ok(());
            }
            // Raced with the read loop (EOF); look again.
        }
    }

    /// Stop playback and join every thread. Idempotent.
    pub fn stop(&self) {
        if self.state.get() != PlayerState::Stop {
            self.state.set(PlayerState::Stop);
            info!("stopping {}", self.path);
        }
        self.abort_threads();
        self.pipeline.lock().take();
    }

    fn abort_threads(&self) {
        self.cancel.cancel();
        let decoders = std::mem::take(&mut *self.decoders.lock());
        for (name, handle) in decoders {
            if handle.join().is_err() {
                warn!("{} thread panicked", name);
            }
        }
        if let Some(handle) = self.reader.lock().take() {
            match handle.join() {
                Ok(stats) => debug!("read loop finished: {:?}", stats),
                Err(_) => warn!("vivista-read thread panicked"),
            }
        }
    }

    /// Pause from `Playing`, or from `PlayEof` while frames are still
    /// being drained.
    pub fn pause(&self) -> Result<(), PlayerError> {
        let paused = self.state.transition(PlayerState::Playing, PlayerState::Pause)
            || self.state.transition(PlayerState::PlayEof, PlayerState::Pause);
        if !paused {
            return Err(PlayerError::InvalidState {
                operation: "pause",
                state: self.state.get(),
            });
        }
        self.sync.set_paused(true);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), PlayerError> {
        let next = if self.is_eof() {
            PlayerState::PlayEof
        } else {
            PlayerState::Playing
        };
        if !self.state.transition(PlayerState::Pause, next) {
            return Err(PlayerError::InvalidState {
                operation: "resume",
                state: self.state.get(),
            });
        }
        self.sync.set_paused(false);
        Ok(())
    }

    pub fn enable_video(&self, enabled: bool) {
        if let Some(slot) = &self.video {
            if slot.set_enabled(enabled) {
                info!("video {}", if enabled { "enabled" } else { "disabled" });
                self.update_streams();
            }
        }
    }

    pub fn enable_audio(&self, enabled: bool) {
        if let Some(slot) = &self.audio {
            if slot.set_enabled(enabled) {
                info!("audio {}", if enabled { "enabled" } else { "disabled" });
                self.update_streams();
            }
        }
    }

    fn update_streams(&self) {
        self.sync.set_streams(
            self.audio.as_ref().is_some_and(StreamSlot::is_enabled),
            self.video.as_ref().is_some_and(StreamSlot::is_enabled),
        );
    }

    // ========================================================================
    // Frame Pull
    // ========================================================================

    /// The picture to show now, or `None` if nothing is due. The same frame
    /// is returned until `free_video_frame()`.
    pub fn get_video_frame(&self) -> Option<VideoFrame> {
        let slot = self.video.as_ref()?;
        let state = self.state.get();
        if !state.is_running() || state == PlayerState::Seek || !slot.is_enabled() {
            return None;
        }

        let mut presented = slot.presented.lock();
        if let Some(front) = slot.held_front(&mut presented) {
            return Some(front);
        }
        if !state.is_presenting() {
            return None;
        }

        let now = wall_time();
        if self.config.pace_video && !self.sync.is_frame_due(now) {
            return None;
        }
        let frame = slot.next_frame()?;
        if presented.serial != Some(frame.serial) {
            self.sync.reset_timer();
        }
        self.sync.present_video(frame.pts, frame.serial, now);
        if self.sync.master() == MasterClock::External {
            self.adjust_external_speed();
        }
        slot.mark_presented(&mut presented, &frame);
        Some(frame)
    }

    pub fn free_video_frame(&self) {
        if let Some(slot) = &self.video {
            slot.free();
        }
    }

    /// Next block of PCM for the mixer. The same block is returned until
    /// `free_audio_frame()`.
    pub fn get_audio_frame(&self) -> Option<AudioFrame> {
        let slot = self.audio.as_ref()?;
        let state = self.state.get();
        if !state.is_running() || state == PlayerState::Seek || !slot.is_enabled() {
            return None;
        }

        let mut presented = slot.presented.lock();
        if let Some(front) = slot.held_front(&mut presented) {
            return Some(front);
        }
        if !state.is_presenting() {
            return None;
        }

        let frame = slot.next_frame()?;
        self.sync.present_audio(frame.pts, frame.serial);
        slot.mark_presented(&mut presented, &frame);
        Some(frame)
    }

    pub fn free_audio_frame(&self) {
        if let Some(slot) = &self.audio {
            slot.free();
        }
    }

    fn adjust_external_speed(&self) {
        let count = |queue: &BoundedPacketQueue| queue.count();
        self.sync.adjust_external_speed(
            self.video
                .as_ref()
                .filter(|s| s.is_enabled())
                .map(|s| count(&s.queue)),
            self.audio
                .as_ref()
                .filter(|s| s.is_enabled())
                .map(|s| count(&s.queue)),
        );
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn state(&self) -> PlayerState {
        self.state.get()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Seconds.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// The read loop has reached the end of the container.
    pub fn is_eof(&self) -> bool {
        self.eof.load(Ordering::SeqCst)
    }

    pub fn is_seek_over(&self) -> bool {
        self.state.get() != PlayerState::Seek && !self.seek.is_pending()
    }

    /// A picture of the current serial has been presented, or there is no
    /// video to wait for.
    pub fn is_content_ready(&self) -> bool {
        match &self.video {
            Some(slot) if slot.is_enabled() => {
                let state = self.state.get();
                state.is_running()
                    && state != PlayerState::Seek
                    && slot.presented.lock().serial == Some(slot.queue.serial())
            }
            _ => true,
        }
    }

    pub fn is_video_buffer_full(&self) -> bool {
        self.video
            .as_ref()
            .is_some_and(|s| s.buffer_state() == BufferState::Full)
    }

    pub fn is_video_buffer_empty(&self) -> bool {
        self.video
            .as_ref()
            .map_or(true, |s| s.buffer_state() == BufferState::Empty)
    }

    pub fn video_info(&self) -> VideoInfo {
        match &self.video {
            Some(slot) => VideoInfo {
                is_enabled: slot.is_enabled(),
                is_present: true,
                width: slot.params.width,
                height: slot.params.height,
                frame_rate: slot
                    .params
                    .frame_rate
                    .map(|rate| rate.as_f64())
                    .filter(|fps| *fps > 0.0),
                last_presented_time: slot.presented.lock().last_time,
                total_duration: self.duration,
                buffer_state: slot.buffer_state(),
            },
            None => VideoInfo {
                is_enabled: false,
                is_present: false,
                width: 0,
                height: 0,
                frame_rate: None,
                last_presented_time: None,
                total_duration: self.duration,
                buffer_state: BufferState::Empty,
            },
        }
    }

    /// Channel count and rate are those handed to the host.
    pub fn audio_info(&self) -> AudioInfo {
        match &self.audio {
            Some(slot) => AudioInfo {
                is_enabled: slot.is_enabled(),
                is_present: true,
                channels: match self.config.audio_channels {
                    AudioChannelMode::Stereo => 2,
                    AudioChannelMode::Source => slot.params.channels,
                },
                sample_rate: self
                    .config
                    .audio_sample_rate
                    .unwrap_or(slot.params.sample_rate),
                last_presented_time: slot.presented.lock().last_time,
                total_duration: self.duration,
                buffer_state: slot.buffer_state(),
            },
            None => AudioInfo {
                is_enabled: false,
                is_present: false,
                channels: 0,
                sample_rate: 0,
                last_presented_time: None,
                total_duration: self.duration,
                buffer_state: BufferState::Empty,
            },
        }
    }

    pub fn video_buffer_stats(&self) -> Option<BufferStats> {
        self.video.as_ref().map(|s| s.frames.stats())
    }

    pub fn audio_buffer_stats(&self) -> Option<BufferStats> {
        self.audio.as_ref().map(|s| s.frames.stats())
    }

    /// The clock currently driving presentation, after fallbacks for
    /// missing or disabled streams.
    pub fn master_clock(&self) -> MasterClock {
        self.sync.master()
    }

    /// (presented, presented late) video frames.
    pub fn presentation_stats(&self) -> (u64, u64) {
        self.sync.stats()
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_codec(
    backend: &dyn MediaBackend,
    params: &StreamParams,
    threads: Option<u32>,
) -> Result<Box<dyn CodecContext>, PlayerError> {
    let handle = backend
        .find_decoder(&params.codec)
        .ok_or_else(|| PlayerError::DecoderNotFound(params.codec.to_string()))?;
    let codec = backend.open_decoder(&handle, params, threads)?;
    debug!("opened {} decoder for stream #{}", codec.name(), params.index);
    Ok(codec)
}
