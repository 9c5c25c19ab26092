//! # Audio Resampling
//!
//! Turns whatever PCM the codec produced into interleaved `f32`:
//! - sample format: integer and float, packed and planar
//! - channel layout: stereo downmix (or source layout kept as is)
//! - rate: streaming linear interpolation, bypassed when rates match
//!
//! Channel order is assumed to follow the usual container convention
//! (FL, FR, FC, LFE, then surround pairs).

use crate::backend::RawAudioFrame;
use crate::config::AudioChannelMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CENTER_GAIN: f32 = std::f32::consts::FRAC_1_SQRT_2;
const SURROUND_GAIN: f32 = std::f32::consts::FRAC_1_SQRT_2;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("audio frame has no channels")]
    NoChannels,
    #[error("invalid sample rate {0}")]
    InvalidRate(u32),
    #[error("{format:?} needs {needed} planes, frame has {got}")]
    MissingPlane {
        format: SampleFormat,
        needed: usize,
        got: usize,
    },
    #[error("plane {plane} holds {got} bytes, expected {expected}")]
    ShortPlane {
        plane: usize,
        expected: usize,
        got: usize,
    },
}

// ============================================================================
// Sample Formats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
    F64,
    U8Planar,
    S16Planar,
    S32Planar,
    F32Planar,
    F64Planar,
}

impl SampleFormat {
    pub fn is_planar(&self) -> bool {
        matches!(
            self,
            Self::U8Planar | Self::S16Planar | Self::S32Planar | Self::F32Planar | Self::F64Planar
        )
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::U8 | Self::U8Planar => 1,
            Self::S16 | Self::S16Planar => 2,
            Self::S32 | Self::S32Planar | Self::F32 | Self::F32Planar => 4,
            Self::F64 | Self::F64Planar => 8,
        }
    }

    fn read(&self, bytes: &[u8]) -> f32 {
        match self {
            Self::U8 | Self::U8Planar => (bytes[0] as f32 - 128.0) / 128.0,
            Self::S16 | Self::S16Planar => {
                i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32_768.0
            }
            Self::S32 | Self::S32Planar => {
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32
                    / 2_147_483_648.0
            }
            Self::F32 | Self::F32Planar => {
                f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            }
            Self::F64 | Self::F64Planar => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                f64::from_le_bytes(raw) as f32
            }
        }
    }

    /// Encode one sample (little endian), used to build test and synthetic
    /// payloads.
    pub fn write(&self, value: f32, out: &mut Vec<u8>) {
        let value = value.clamp(-1.0, 1.0);
        match self {
            Self::U8 | Self::U8Planar => out.push((value * 127.0 + 128.0).round() as u8),
            Self::S16 | Self::S16Planar => {
                out.extend_from_slice(&((value * 32_767.0).round() as i16).to_le_bytes())
            }
            Self::S32 | Self::S32Planar => out
                .extend_from_slice(&((value as f64 * 2_147_483_647.0).round() as i32).to_le_bytes()),
            Self::F32 | Self::F32Planar => out.extend_from_slice(&value.to_le_bytes()),
            Self::F64 | Self::F64Planar => out.extend_from_slice(&(value as f64).to_le_bytes()),
        }
    }
}

/// Decode a raw frame into interleaved `f32` in its own channel layout.
pub fn deinterleave_to_f32(frame: &RawAudioFrame) -> Result<Vec<f32>, ResampleError> {
    let channels = frame.channels as usize;
    if channels == 0 {
        return Err(ResampleError::NoChannels);
    }
    let format = frame.format;
    let bps = format.bytes_per_sample();
    let n = frame.nb_samples;
    let mut out = Vec::with_capacity(n * channels);

    if format.is_planar() {
        if frame.planes.len() < channels {
            return Err(ResampleError::MissingPlane {
                format,
                needed: channels,
                got: frame.planes.len(),
            });
        }
        for (plane, data) in frame.planes.iter().take(channels).enumerate() {
            if data.len() < n * bps {
                return Err(ResampleError::ShortPlane {
                    plane,
                    expected: n * bps,
                    got: data.len(),
                });
            }
        }
        for i in 0..n {
            for plane in frame.planes.iter().take(channels) {
                out.push(format.read(&plane[i * bps..]));
            }
        }
    } else {
        let Some(data) = frame.planes.first() else {
            return Err(ResampleError::MissingPlane {
                format,
                needed: 1,
                got: 0,
            });
        };
        let expected = n * channels * bps;
        if data.len() < expected {
            return Err(ResampleError::ShortPlane {
                plane: 0,
                expected,
                got: data.len(),
            });
        }
        out.extend(data[..expected].chunks_exact(bps).map(|s| format.read(s)));
    }
    Ok(out)
}

/// Mix interleaved `channels`-wide PCM down (or up) to stereo.
pub fn downmix_stereo(input: &[f32], channels: usize) -> Vec<f32> {
    if channels == 2 {
        return input.to_vec();
    }
    let mut out = Vec::with_capacity(input.len() / channels.max(1) * 2);
    for frame in input.chunks_exact(channels) {
        let (l, r) = match channels {
            1 => (frame[0], frame[0]),
            _ => {
                let mut l = frame[0];
                let mut r = frame[1];
                let mut left_turn = true;
                for (ch, &sample) in frame.iter().enumerate().skip(2) {
                    match ch {
                        2 => {
                            l += sample * CENTER_GAIN;
                            r += sample * CENTER_GAIN;
                        }
                        3 if channels >= 6 => {} // LFE
                        _ => {
                            if left_turn {
                                l += sample * SURROUND_GAIN;
                            } else {
                                r += sample * SURROUND_GAIN;
                            }
                            left_turn = !left_turn;
                        }
                    }
                }
                (l, r)
            }
        };
        out.push(l.clamp(-1.0, 1.0));
        out.push(r.clamp(-1.0, 1.0));
    }
    out
}

/// Output samples per channel for `input` samples, rounded up.
pub fn expected_output_samples(input: usize, in_rate: u32, out_rate: u32) -> usize {
    if in_rate == out_rate || in_rate == 0 {
        return input;
    }
    (input as u64 * out_rate as u64).div_ceil(in_rate as u64) as usize
}

// ============================================================================
// Linear Rate Conversion
// ============================================================================

/// Streaming linear interpolator. Keeps the last input frame and the
/// fractional read position across calls so block boundaries are seamless.
#[derive(Debug, Clone)]
struct LinearRate {
    channels: usize,
    /// Input frames advanced per output frame.
    step: f64,
    pos: f64,
    carry: Option<Vec<f32>>,
}

impl LinearRate {
    fn new(channels: usize, in_rate: u32, out_rate: u32) -> Self {
        Self {
            channels,
            step: in_rate as f64 / out_rate as f64,
            pos: 0.0,
            carry: None,
        }
    }

    fn reset(&mut self) {
        self.pos = 0.0;
        self.carry = None;
    }

    fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let ch = self.channels;
        let mut ext = Vec::with_capacity(input.len() + ch);
        if let Some(carry) = &self.carry {
            ext.extend_from_slice(carry);
        }
        ext.extend_from_slice(input);
        let frames = ext.len() / ch;
        if frames < 2 {
            self.carry = (frames == 1).then_some(ext);
            return Vec::new();
        }

        let mut out = Vec::new();
        let last = (frames - 1) as f64;
        while self.pos < last {
            let i = self.pos.floor() as usize;
            let frac = (self.pos - i as f64) as f32;
            for c in 0..ch {
                let a = ext[i * ch + c];
                let b = ext[(i + 1) * ch + c];
                out.push(a + (b - a) * frac);
            }
            self.pos += self.step;
        }
        self.pos -= last;
        self.carry = Some(ext[(frames - 1) * ch..].to_vec());
        out
    }
}

// ============================================================================
// Resampler
// ============================================================================

pub struct Resampler {
    in_channels: u16,
    in_format: SampleFormat,
    in_rate: u32,
    out_channels: u16,
    out_rate: u32,
    mode: AudioChannelMode,
    rate: Option<LinearRate>,
}

impl Resampler {
    pub fn new(
        in_channels: u16,
        in_format: SampleFormat,
        in_rate: u32,
        mode: AudioChannelMode,
        out_rate: Option<u32>,
    ) -> Result<Self, ResampleError> {
        if in_channels == 0 {
            return Err(ResampleError::NoChannels);
        }
        if in_rate == 0 {
            return Err(ResampleError::InvalidRate(in_rate));
        }
        let out_rate = out_rate.unwrap_or(in_rate);
        if out_rate == 0 {
            return Err(ResampleError::InvalidRate(out_rate));
        }
        let out_channels = match mode {
            AudioChannelMode::Stereo => 2,
            AudioChannelMode::Source => in_channels,
        };
        let rate = (out_rate != in_rate)
            .then(|| LinearRate::new(out_channels as usize, in_rate, out_rate));
        Ok(Self {
            in_channels,
            in_format,
            in_rate,
            out_channels,
            out_rate,
            mode,
            rate,
        })
    }

    /// Built for `frame`'s layout, format and rate.
    pub fn matches(&self, frame: &RawAudioFrame) -> bool {
        frame.channels == self.in_channels
            && frame.format == self.in_format
            && frame.sample_rate == self.in_rate
    }

    pub fn output_channels(&self) -> u16 {
        self.out_channels
    }

    pub fn output_rate(&self) -> u32 {
        self.out_rate
    }

    /// Convert one frame. Output is interleaved `output_channels()` wide.
    pub fn process(&mut self, frame: &RawAudioFrame) -> Result<Vec<f32>, ResampleError> {
        let pcm = deinterleave_to_f32(frame)?;
        let mixed = match self.mode {
            AudioChannelMode::Stereo => downmix_stereo(&pcm, self.in_channels as usize),
            AudioChannelMode::Source => pcm,
        };
        Ok(match self.rate.as_mut() {
            Some(rate) => rate.process(&mixed),
            None => mixed,
        })
    }

    /// Forget interpolation history, e.g. after a seek.
    pub fn reset(&mut self) {
        if let Some(rate) = self.rate.as_mut() {
            rate.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn packed(format: SampleFormat, channels: u16, rate: u32, samples: &[f32]) -> RawAudioFrame {
        let mut data = Vec::new();
        for &s in samples {
            format.write(s, &mut data);
        }
        RawAudioFrame {
            sample_rate: rate,
            channels,
            format,
            nb_samples: samples.len() / channels as usize,
            planes: vec![Bytes::from(data)],
            pts: None,
        }
    }

    #[test]
    fn test_s16_to_f32() {
        let frame = packed(SampleFormat::S16, 2, 48_000, &[0.5, -0.5, 0.0, 1.0]);
        let out = deinterleave_to_f32(&frame).unwrap();
        assert!((out[0] - 0.5).abs() < 1e-3);
        assert!((out[1] + 0.5).abs() < 1e-3);
        assert!((out[3] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_planar_interleaves() {
        let mut left = Vec::new();
        let mut right = Vec::new();
        for i in 0..3 {
            SampleFormat::F32Planar.write(i as f32 * 0.1, &mut left);
            SampleFormat::F32Planar.write(-(i as f32) * 0.1, &mut right);
        }
        let frame = RawAudioFrame {
            sample_rate: 44_100,
            channels: 2,
            format: SampleFormat::F32Planar,
            nb_samples: 3,
            planes: vec![Bytes::from(left), Bytes::from(right)],
            pts: None,
        };
        let out = deinterleave_to_f32(&frame).unwrap();
        assert_eq!(out.len(), 6);
        assert!((out[2] - 0.1).abs() < 1e-6);
        assert!((out[3] + 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let mut frame = packed(SampleFormat::S16, 2, 48_000, &[0.0; 4]);
        frame.nb_samples = 10;
        assert!(matches!(
            deinterleave_to_f32(&frame),
            Err(ResampleError::ShortPlane { .. })
        ));
    }

    #[test]
    fn test_downmix() {
        assert_eq!(downmix_stereo(&[0.25, 0.5], 1), vec![0.25, 0.25, 0.5, 0.5]);

        // 5.1: FL FR FC LFE SL SR
        let out = downmix_stereo(&[0.1, 0.2, 0.3, 0.9, 0.4, 0.5], 6);
        let expected_l = 0.1 + 0.3 * CENTER_GAIN + 0.4 * SURROUND_GAIN;
        let expected_r = 0.2 + 0.3 * CENTER_GAIN + 0.5 * SURROUND_GAIN;
        assert!((out[0] - expected_l).abs() < 1e-6);
        assert!((out[1] - expected_r).abs() < 1e-6);

        // Clipped.
        let out = downmix_stereo(&[1.0, 1.0, 1.0], 3);
        assert_eq!(out, vec![1.0, 1.0]);
    }

    #[test]
    fn test_same_rate_bypass() {
        let mut resampler =
            Resampler::new(2, SampleFormat::F32, 44_100, AudioChannelMode::Stereo, None).unwrap();
        let frame = packed(SampleFormat::F32, 2, 44_100, &[0.1; 2048]);
        let out = resampler.process(&frame).unwrap();
        assert_eq!(out.len(), 2048);
        assert_eq!(resampler.output_rate(), 44_100);
    }

    #[test]
    fn test_source_layout_kept() {
        let mut resampler =
            Resampler::new(6, SampleFormat::S16, 48_000, AudioChannelMode::Source, None).unwrap();
        let frame = packed(SampleFormat::S16, 6, 48_000, &[0.0; 6 * 100]);
        assert_eq!(resampler.output_channels(), 6);
        assert_eq!(resampler.process(&frame).unwrap().len(), 600);
    }

    #[test]
    fn test_rate_conversion_sample_counts() {
        let mut resampler = Resampler::new(
            1,
            SampleFormat::S16,
            44_100,
            AudioChannelMode::Stereo,
            Some(48_000),
        )
        .unwrap();

        let blocks = 50;
        let per_block = 1024;
        let mut produced = 0;
        for _ in 0..blocks {
            let frame = packed(SampleFormat::S16, 1, 44_100, &vec![0.25; per_block]);
            let out = resampler.process(&frame).unwrap();
            assert_eq!(out.len() % 2, 0);
            let n = out.len() / 2;
            assert!(n <= expected_output_samples(per_block, 44_100, 48_000) + 1);
            produced += n;
        }
        let expected = expected_output_samples(blocks * per_block, 44_100, 48_000);
        assert!(produced.abs_diff(expected) <= 2, "{produced} vs {expected}");
    }

    #[test]
    fn test_interpolation_is_continuous_across_blocks() {
        let mut rate = LinearRate::new(1, 2, 4);
        let a = rate.process(&[0.0, 1.0]);
        let b = rate.process(&[2.0, 3.0]);
        assert_eq!(a, vec![0.0, 0.5]);
        assert_eq!(b, vec![1.0, 1.5, 2.0, 2.5]);
    }

    #[test]
    fn test_expected_output_samples_rounds_up() {
        assert_eq!(expected_output_samples(1024, 44_100, 48_000), 1115);
        assert_eq!(expected_output_samples(1024, 48_000, 48_000), 1024);
        assert_eq!(expected_output_samples(1, 48_000, 44_100), 1);
    }
}
