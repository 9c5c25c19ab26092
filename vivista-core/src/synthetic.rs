//! Synthetic Media Backend
//!
//! Deterministic in-memory container and codecs. Used by the test suite and
//! for bringing up a host integration without real media:
//! - video: constant frame rate, keyframe every `gop` frames, a one-frame
//!   decoder delay like a real reordering codec
//! - audio: fixed-size packets of a sine tone in any sample format
//! - faults: open / stream info / decoder lookup / seek failures, transient
//!   and hard read errors, undecodable packets

use crate::backend::{
    BackendError, CodecContext, CodecId, ContainerInfo, ContainerReader, DecodeStatus,
    DecoderHandle, MediaBackend, RawAudioFrame, RawFrame, RawVideoFrame, Rational, ReadOutcome,
    SeekFlags, StreamKind, StreamParams,
};
use crate::config::Transport;
use crate::convert::{ColorSpace, PixelFormat};
use crate::media::Packet;
use crate::resample::SampleFormat;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

pub const VIDEO_CODEC: &str = "synthetic-video";
pub const AUDIO_CODEC: &str = "synthetic-audio";
pub const VIDEO_TIME_BASE: Rational = Rational::new(1, 90_000);

// ============================================================================
// Media Description
// ============================================================================

#[derive(Debug, Clone)]
pub struct SyntheticVideo {
    pub width: u32,
    pub height: u32,
    /// Must divide 90000.
    pub fps: u32,
    pub gop: u32,
    pub format: PixelFormat,
    /// Payload size per packet, at least 8.
    pub packet_bytes: usize,
}

impl Default for SyntheticVideo {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            fps: 30,
            gop: 30,
            format: PixelFormat::Yuv420p,
            packet_bytes: 2048,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples_per_packet: usize,
    pub format: SampleFormat,
    pub tone_hz: f32,
}

impl Default for SyntheticAudio {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            samples_per_packet: 1024,
            format: SampleFormat::S16,
            tone_hz: 440.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    pub fail_open: bool,
    pub fail_stream_info: bool,
    pub missing_video_decoder: bool,
    pub missing_audio_decoder: bool,
    pub fail_seek: bool,
    /// Every n-th read returns a transient error.
    pub transient_every: Option<u64>,
    /// Hard read error once this many packets were delivered.
    pub hard_error_after: Option<u64>,
    /// Every n-th video packet is undecodable.
    pub corrupt_video_every: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SyntheticMedia {
    /// Seconds.
    pub duration: f64,
    pub video: Option<SyntheticVideo>,
    pub audio: Option<SyntheticAudio>,
    pub faults: FaultPlan,
}

impl SyntheticMedia {
    /// Default video and audio streams.
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            video: Some(SyntheticVideo::default()),
            audio: Some(SyntheticAudio::default()),
            faults: FaultPlan::default(),
        }
    }

    pub fn with_video(mut self, video: Option<SyntheticVideo>) -> Self {
        self.video = video;
        self
    }

    pub fn with_audio(mut self, audio: Option<SyntheticAudio>) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    pub fn video_frame_count(&self) -> u64 {
        self.video
            .as_ref()
            .map_or(0, |v| (self.duration * v.fps as f64 + 1e-9).floor() as u64)
    }

    pub fn audio_packet_count(&self) -> u64 {
        self.audio.as_ref().map_or(0, |a| {
            let samples = (self.duration * a.sample_rate as f64).round() as u64;
            samples.div_ceil(a.samples_per_packet.max(1) as u64)
        })
    }

    fn video_codec(&self) -> &'static str {
        if self.faults.missing_video_decoder {
            "synthetic-video-unsupported"
        } else {
            VIDEO_CODEC
        }
    }

    fn audio_codec(&self) -> &'static str {
        if self.faults.missing_audio_decoder {
            "synthetic-audio-unsupported"
        } else {
            AUDIO_CODEC
        }
    }
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Default)]
pub struct SyntheticBackend {
    media: RwLock<HashMap<String, SyntheticMedia>>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_media(self, path: &str, media: SyntheticMedia) -> Self {
        self.register(path, media);
        self
    }

    pub fn register(&self, path: &str, media: SyntheticMedia) {
        self.media.write().insert(path.to_string(), media);
    }
}

impl MediaBackend for SyntheticBackend {
    fn open(
        &self,
        path: &str,
        transport: Transport,
    ) -> Result<Box<dyn ContainerReader>, BackendError> {
        let media = self.media.read().get(path).cloned().ok_or_else(|| BackendError::Open {
            path: path.to_string(),
            reason: "no such media".into(),
        })?;
        if media.faults.fail_open {
            return Err(BackendError::Open {
                path: path.to_string(),
                reason: "injected open failure".into(),
            });
        }
        debug!("synthetic open {} ({:?})", path, transport);
        Ok(Box::new(SyntheticReader::new(media)))
    }

    fn find_decoder(&self, codec: &CodecId) -> Option<DecoderHandle> {
        match codec.0.as_str() {
            VIDEO_CODEC | AUDIO_CODEC => Some(DecoderHandle {
                codec: codec.clone(),
                name: codec.0.clone(),
            }),
            _ => None,
        }
    }

    fn open_decoder(
        &self,
        decoder: &DecoderHandle,
        params: &StreamParams,
        threads: Option<u32>,
    ) -> Result<Box<dyn CodecContext>, BackendError> {
        trace!("opening {} with threads {:?}", decoder.name, threads);
        let invalid = |reason: &str| BackendError::DecoderOpen {
            codec: decoder.codec.to_string(),
            reason: reason.to_string(),
        };
        match params.kind {
            StreamKind::Video => {
                let format = params
                    .pixel_format
                    .ok_or_else(|| invalid("no pixel format"))?;
                Ok(Box::new(SyntheticVideoDecoder::new(
                    params.width,
                    params.height,
                    format,
                )))
            }
            StreamKind::Audio => {
                let format = params
                    .sample_format
                    .ok_or_else(|| invalid("no sample format"))?;
                if params.channels == 0 || params.sample_rate == 0 {
                    return Err(invalid("no channel layout"));
                }
                Ok(Box::new(SyntheticAudioDecoder::new(
                    params.channels,
                    params.sample_rate,
                    format,
                )))
            }
            StreamKind::Other => Err(invalid("unsupported stream kind")),
        }
    }
}

// ============================================================================
// Container
// ============================================================================

struct SyntheticReader {
    media: SyntheticMedia,
    video_index: Option<usize>,
    audio_index: Option<usize>,
    total_video: u64,
    total_audio: u64,
    next_video: u64,
    next_audio: u64,
    reads: u64,
    delivered: u64,
}

impl SyntheticReader {
    fn new(media: SyntheticMedia) -> Self {
        let video_index = media.video.as_ref().map(|_| 0);
        let audio_index = media.audio.as_ref().map(|_| video_index.map_or(0, |i| i + 1));
        Self {
            total_video: media.video_frame_count(),
            total_audio: media.audio_packet_count(),
            media,
            video_index,
            audio_index,
            next_video: 0,
            next_audio: 0,
            reads: 0,
            delivered: 0,
        }
    }

    fn video_ticks_per_frame(video: &SyntheticVideo) -> i64 {
        90_000 / video.fps.max(1) as i64
    }

    fn next_video_time(&self) -> Option<f64> {
        let video = self.media.video.as_ref()?;
        (self.next_video < self.total_video).then(|| self.next_video as f64 / video.fps as f64)
    }

    fn next_audio_time(&self) -> Option<f64> {
        let audio = self.media.audio.as_ref()?;
        (self.next_audio < self.total_audio).then(|| {
            (self.next_audio * audio.samples_per_packet as u64) as f64 / audio.sample_rate as f64
        })
    }

    fn video_packet(&mut self) -> Option<Packet> {
        let video = self.media.video.as_ref()?;
        let index = self.next_video;
        self.next_video += 1;

        let corrupt = self
            .media
            .faults
            .corrupt_video_every
            .is_some_and(|n| n > 0 && index % n == n - 1);
        let payload = if corrupt {
            Bytes::new()
        } else {
            let mut data = vec![0u8; video.packet_bytes.max(8)];
            data[..8].copy_from_slice(&index.to_le_bytes());
            Bytes::from(data)
        };

        let ticks = Self::video_ticks_per_frame(video);
        let mut packet = Packet::new(self.video_index?, payload);
        packet.pts = Some(index as i64 * ticks);
        packet.dts = packet.pts;
        packet.duration = Some(ticks);
        packet.keyframe = index % video.gop.max(1) as u64 == 0;
        Some(packet)
    }

    fn audio_packet(&mut self) -> Option<Packet> {
        let audio = self.media.audio.as_ref()?;
        let index = self.next_audio;
        self.next_audio += 1;

        let n = audio.samples_per_packet;
        let first_sample = index * n as u64;
        let channels = audio.channels as usize;
        let sample = |k: u64| {
            let t = k as f32 / audio.sample_rate as f32;
            0.25 * (2.0 * std::f32::consts::PI * audio.tone_hz * t).sin()
        };

        let mut data = Vec::with_capacity(n * channels * audio.format.bytes_per_sample());
        if audio.format.is_planar() {
            for _ in 0..channels {
                for i in 0..n as u64 {
                    audio.format.write(sample(first_sample + i), &mut data);
                }
            }
        } else {
            for i in 0..n as u64 {
                let value = sample(first_sample + i);
                for _ in 0..channels {
                    audio.format.write(value, &mut data);
                }
            }
        }

        let mut packet = Packet::new(self.audio_index?, Bytes::from(data));
        packet.pts = Some(first_sample as i64);
        packet.dts = packet.pts;
        packet.duration = Some(n as i64);
        packet.keyframe = true;
        Some(packet)
    }

    fn time_base(&self, stream_index: usize) -> Option<Rational> {
        if Some(stream_index) == self.video_index {
            Some(VIDEO_TIME_BASE)
        } else if Some(stream_index) == self.audio_index {
            self.media
                .audio
                .as_ref()
                .map(|a| Rational::new(1, a.sample_rate as i64))
        } else {
            None
        }
    }
}

impl ContainerReader for SyntheticReader {
    fn find_stream_info(&mut self) -> Result<ContainerInfo, BackendError> {
        if self.media.faults.fail_stream_info {
            return Err(BackendError::StreamInfo("injected probe failure".into()));
        }
        let mut streams = Vec::new();
        if let (Some(video), Some(index)) = (&self.media.video, self.video_index) {
            streams.push(StreamParams {
                index,
                kind: StreamKind::Video,
                codec: CodecId(self.media.video_codec().into()),
                time_base: VIDEO_TIME_BASE,
                duration: Some(self.total_video as i64 * Self::video_ticks_per_frame(video)),
                width: video.width,
                height: video.height,
                pixel_format: Some(video.format),
                frame_rate: Some(Rational::new(video.fps as i64, 1)),
                channels: 0,
                sample_rate: 0,
                sample_format: None,
            });
        }
        if let (Some(audio), Some(index)) = (&self.media.audio, self.audio_index) {
            streams.push(StreamParams {
                index,
                kind: StreamKind::Audio,
                codec: CodecId(self.media.audio_codec().into()),
                time_base: Rational::new(1, audio.sample_rate as i64),
                duration: Some((self.media.duration * audio.sample_rate as f64).round() as i64),
                width: 0,
                height: 0,
                pixel_format: None,
                frame_rate: None,
                channels: audio.channels,
                sample_rate: audio.sample_rate,
                sample_format: Some(audio.format),
            });
        }
        Ok(ContainerInfo {
            streams,
            duration: Some(self.media.duration),
        })
    }

    fn read_packet(&mut self) -> Result<ReadOutcome, BackendError> {
        self.reads += 1;
        if let Some(n) = self.media.faults.transient_every {
            if n > 0 && self.reads % n == 0 {
                return Err(BackendError::Transient("injected".into()));
            }
        }
        if let Some(limit) = self.media.faults.hard_error_after {
            if self.delivered >= limit {
                return Err(BackendError::Read("injected hard error".into()));
            }
        }

        let packet = match (self.next_video_time(), self.next_audio_time()) {
            (Some(v), Some(a)) if v <= a => self.video_packet(),
            (Some(_), None) => self.video_packet(),
            (_, Some(_)) => self.audio_packet(),
            (None, None) => None,
        };
        Ok(match packet {
            Some(packet) => {
                self.delivered += 1;
                ReadOutcome::Packet(packet)
            }
            None => ReadOutcome::EndOfStream,
        })
    }

    fn seek(
        &mut self,
        stream_index: usize,
        timestamp: i64,
        flags: SeekFlags,
    ) -> Result<(), BackendError> {
        let fail = |reason: &str| BackendError::Seek {
            stream_index,
            timestamp,
            reason: reason.to_string(),
        };
        if self.media.faults.fail_seek {
            return Err(fail("injected seek failure"));
        }
        let time_base = self.time_base(stream_index).ok_or_else(|| fail("no such stream"))?;
        let seconds = time_base.ticks_to_seconds(timestamp).max(0.0);

        let mut start = seconds;
        if let Some(video) = &self.media.video {
            let mut frame = (seconds * video.fps as f64 + 1e-9).floor() as u64;
            frame = frame.min(self.total_video.saturating_sub(1));
            if !flags.any {
                let gop = video.gop.max(1) as u64;
                frame = frame / gop * gop;
            }
            self.next_video = frame;
            start = frame as f64 / video.fps as f64;
        }
        if let Some(audio) = &self.media.audio {
            // First packet starting at or after the video position.
            let packet = (start * audio.sample_rate as f64 / audio.samples_per_packet as f64 - 1e-9)
                .ceil()
                .max(0.0) as u64;
            self.next_audio = packet.min(self.total_audio);
        }
        trace!(
            "synthetic seek to {:.3}s -> video #{} audio #{}",
            seconds,
            self.next_video,
            self.next_audio
        );
        Ok(())
    }
}

// ============================================================================
// Codecs
// ============================================================================

struct SyntheticVideoDecoder {
    width: u32,
    height: u32,
    format: PixelFormat,
    /// Held back one packet, like a codec with reordering delay.
    pending: Option<Packet>,
    ready: VecDeque<RawFrame>,
    draining: bool,
}

impl SyntheticVideoDecoder {
    fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            pending: None,
            ready: VecDeque::new(),
            draining: false,
        }
    }

    fn picture(&self, packet: &Packet) -> RawFrame {
        let mut index = [0u8; 8];
        index.copy_from_slice(&packet.payload[..8]);
        let luma = (u64::from_le_bytes(index) % 200 + 16) as u8;

        let strides = self.format.strides(self.width);
        let heights = self.format.plane_heights(self.height);
        let rgb = matches!(
            self.format,
            PixelFormat::Rgb24 | PixelFormat::Rgba32 | PixelFormat::Bgra32
        );
        let planes = strides
            .iter()
            .zip(&heights)
            .enumerate()
            .map(|(plane, (stride, rows))| {
                let fill = if plane == 0 || rgb { luma } else { 128 };
                Bytes::from(vec![fill; stride * rows])
            })
            .collect();

        RawFrame::Video(RawVideoFrame {
            width: self.width,
            height: self.height,
            format: self.format,
            color_space: ColorSpace::Bt601,
            planes,
            strides,
            pts: packet.pts,
            pkt_dts: packet.dts,
            duration: packet.duration,
        })
    }
}

impl CodecContext for SyntheticVideoDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<(), BackendError> {
        let Some(packet) = packet else {
            self.draining = true;
            if let Some(last) = self.pending.take() {
                let frame = self.picture(&last);
                self.ready.push_back(frame);
            }
            return Ok(());
        };
        if self.draining {
            return Err(BackendError::Decode("packet after end of stream".into()));
        }
        if packet.payload.len() < 8 {
            return Err(BackendError::Decode(format!(
                "truncated video packet ({} bytes)",
                packet.payload.len()
            )));
        }
        if let Some(previous) = self.pending.replace(packet.clone()) {
            let frame = self.picture(&previous);
            self.ready.push_back(frame);
        }
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<DecodeStatus, BackendError> {
        Ok(match self.ready.pop_front() {
            Some(frame) => DecodeStatus::Frame(frame),
            None if self.draining => DecodeStatus::Drained,
            None => DecodeStatus::NeedInput,
        })
    }

    fn flush(&mut self) {
        self.pending = None;
        self.ready.clear();
        self.draining = false;
    }

    fn name(&self) -> &str {
        VIDEO_CODEC
    }
}

struct SyntheticAudioDecoder {
    channels: u16,
    sample_rate: u32,
    format: SampleFormat,
    ready: VecDeque<RawFrame>,
    draining: bool,
}

impl SyntheticAudioDecoder {
    fn new(channels: u16, sample_rate: u32, format: SampleFormat) -> Self {
        Self {
            channels,
            sample_rate,
            format,
            ready: VecDeque::new(),
            draining: false,
        }
    }
}

impl CodecContext for SyntheticAudioDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<(), BackendError> {
        let Some(packet) = packet else {
            self.draining = true;
            return Ok(());
        };
        if self.draining {
            return Err(BackendError::Decode("packet after end of stream".into()));
        }
        let bps = self.format.bytes_per_sample();
        let channels = self.channels as usize;
        let nb_samples = packet.payload.len() / (bps * channels);
        if nb_samples == 0 {
            return Err(BackendError::Decode("empty audio packet".into()));
        }
        let planes = if self.format.is_planar() {
            let plane_len = nb_samples * bps;
            (0..channels)
                .map(|c| packet.payload.slice(c * plane_len..(c + 1) * plane_len))
                .collect()
        } else {
            vec![packet.payload.clone()]
        };
        self.ready.push_back(RawFrame::Audio(RawAudioFrame {
            sample_rate: self.sample_rate,
            channels: self.channels,
            format: self.format,
            nb_samples,
            planes,
            pts: packet.pts,
        }));
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<DecodeStatus, BackendError> {
        Ok(match self.ready.pop_front() {
            Some(frame) => DecodeStatus::Frame(frame),
            None if self.draining => DecodeStatus::Drained,
            None => DecodeStatus::NeedInput,
        })
    }

    fn flush(&mut self) {
        self.ready.clear();
        self.draining = false;
    }

    fn name(&self) -> &str {
        AUDIO_CODEC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(reader: &mut dyn ContainerReader) -> Vec<Packet> {
        let mut packets = Vec::new();
        loop {
            match reader.read_packet() {
                Ok(ReadOutcome::Packet(p)) => packets.push(p),
                Ok(ReadOutcome::EndOfStream) => return packets,
                Err(e) if e.is_transient() => continue,
                Err(e) => panic!("{e}"),
            }
        }
    }

    #[test]
    fn test_counts_and_interleaving() {
        let backend = SyntheticBackend::new().with_media("clip", SyntheticMedia::new(2.0));
        let mut reader = backend.open("clip", Transport::Udp).unwrap();
        let info = reader.find_stream_info().unwrap();
        assert_eq!(info.streams.len(), 2);
        assert_eq!(info.duration, Some(2.0));

        let packets = read_all(reader.as_mut());
        let video = packets.iter().filter(|p| p.stream_index == 0).count();
        let audio = packets.iter().filter(|p| p.stream_index == 1).count();
        assert_eq!(video, 60);
        assert_eq!(audio, 87); // ceil(88200 / 1024)

        // Interleaved by presentation time.
        let mut last = -1.0;
        for p in &packets {
            let tb = info.streams[p.stream_index].time_base;
            let t = tb.ticks_to_seconds(p.pts.unwrap());
            assert!(t >= last - 1.0 / 30.0);
            last = t;
        }
    }

    #[test]
    fn test_seek_lands_on_keyframe() {
        let media = SyntheticMedia::new(10.0);
        let backend = SyntheticBackend::new().with_media("clip", media);
        let mut reader = backend.open("clip", Transport::Tcp).unwrap();

        reader
            .seek(0, VIDEO_TIME_BASE.seconds_to_ticks(4.5), SeekFlags { backward: true, any: false })
            .unwrap();
        let first = match reader.read_packet().unwrap() {
            ReadOutcome::Packet(p) => p,
            ReadOutcome::EndOfStream => panic!("unexpected end"),
        };
        assert_eq!(first.stream_index, 0);
        assert!(first.keyframe);
        assert_eq!(first.pts, Some(4 * 90_000));

        reader
            .seek(0, VIDEO_TIME_BASE.seconds_to_ticks(4.5), SeekFlags { backward: false, any: true })
            .unwrap();
        let ReadOutcome::Packet(p) = reader.read_packet().unwrap() else {
            panic!("unexpected end");
        };
        assert_eq!(p.pts, Some(135 * 3000));

        // Past the end: last keyframe.
        reader
            .seek(0, VIDEO_TIME_BASE.seconds_to_ticks(99.0), SeekFlags { backward: true, any: false })
            .unwrap();
        let ReadOutcome::Packet(p) = reader.read_packet().unwrap() else {
            panic!("unexpected end");
        };
        assert_eq!(p.pts, Some(9 * 90_000));
    }

    #[test]
    fn test_video_decoder_delay_and_drain() {
        let backend = SyntheticBackend::new().with_media("clip", SyntheticMedia::new(1.0));
        let mut reader = backend.open("clip", Transport::Udp).unwrap();
        let info = reader.find_stream_info().unwrap();
        let video = &info.streams[0];
        let handle = backend.find_decoder(&video.codec).unwrap();
        let mut codec = backend.open_decoder(&handle, video, None).unwrap();

        let packets: Vec<_> = read_all(reader.as_mut())
            .into_iter()
            .filter(|p| p.stream_index == 0)
            .collect();
        codec.send_packet(Some(&packets[0])).unwrap();
        assert!(matches!(codec.receive_frame().unwrap(), DecodeStatus::NeedInput));
        codec.send_packet(Some(&packets[1])).unwrap();
        match codec.receive_frame().unwrap() {
            DecodeStatus::Frame(RawFrame::Video(frame)) => {
                assert_eq!(frame.pts, Some(0));
                assert_eq!(frame.planes[0][0], 16);
                assert_eq!(frame.planes.len(), 3);
            }
            _ => panic!("expected a frame"),
        }
        codec.send_packet(None).unwrap();
        assert!(matches!(codec.receive_frame().unwrap(), DecodeStatus::Frame(_)));
        assert!(matches!(codec.receive_frame().unwrap(), DecodeStatus::Drained));
        assert!(codec.send_packet(Some(&packets[2])).is_err());

        codec.flush();
        codec.send_packet(Some(&packets[2])).unwrap();
    }

    #[test]
    fn test_faults() {
        let faults = FaultPlan {
            missing_audio_decoder: true,
            transient_every: Some(2),
            hard_error_after: Some(3),
            ..FaultPlan::default()
        };
        let backend =
            SyntheticBackend::new().with_media("clip", SyntheticMedia::new(1.0).with_faults(faults));
        let mut reader = backend.open("clip", Transport::Udp).unwrap();
        let info = reader.find_stream_info().unwrap();
        assert!(backend.find_decoder(&info.streams[1].codec).is_none());

        let mut transient = 0;
        let mut delivered = 0;
        loop {
            match reader.read_packet() {
                Ok(ReadOutcome::Packet(_)) => delivered += 1,
                Err(e) if e.is_transient() => transient += 1,
                Err(_) => break,
                Ok(ReadOutcome::EndOfStream) => panic!("hard error expected first"),
            }
        }
        assert_eq!(delivered, 3);
        assert!(transient >= 2);

        assert!(backend.open("missing", Transport::Udp).is_err());
    }
}
