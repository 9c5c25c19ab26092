// PIXEL CONVERT - Decoder output to I420
//
// Decoders hand back whatever layout the codec produced. The host renderer
// uploads three 8-bit planes (Y, U, V) with chroma subsampled 2x2, so every
// picture is rescaled to that here. Odd dimensions round the chroma up.

use crate::backend::RawVideoFrame;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("{format:?} needs {needed} planes, frame has {got}")]
    MissingPlane {
        format: PixelFormat,
        needed: usize,
        got: usize,
    },
    #[error("plane {plane} too short: row {row} ends at {end}, plane is {len} bytes")]
    ShortPlane {
        plane: usize,
        row: usize,
        end: usize,
        len: usize,
    },
    #[error("empty picture {width}x{height}")]
    EmptyPicture { width: u32, height: u32 },
}

// ============================================================================
// Pixel Formats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Yuv420p, // Y, U (quarter size), V (quarter size)
    Yuv422p, // Y, U (half width), V (half width)
    Yuv444p, // Y, U, V all full size
    Nv12,    // Y, interleaved UV (quarter size)
    Rgb24,
    Rgba32,
    Bgra32,
    Gray8,
}

impl PixelFormat {
    pub fn plane_count(&self) -> usize {
        match self {
            Self::Yuv420p | Self::Yuv422p | Self::Yuv444p => 3,
            Self::Nv12 => 2,
            Self::Rgb24 | Self::Rgba32 | Self::Bgra32 | Self::Gray8 => 1,
        }
    }

    /// Tightly packed stride of each plane.
    pub fn strides(&self, width: u32) -> Vec<usize> {
        let w = width as usize;
        let cw = w.div_ceil(2);
        match self {
            Self::Yuv420p | Self::Yuv422p => vec![w, cw, cw],
            Self::Yuv444p => vec![w, w, w],
            Self::Nv12 => vec![w, cw * 2],
            Self::Rgb24 => vec![w * 3],
            Self::Rgba32 | Self::Bgra32 => vec![w * 4],
            Self::Gray8 => vec![w],
        }
    }

    /// Rows in each plane.
    pub fn plane_heights(&self, height: u32) -> Vec<usize> {
        let h = height as usize;
        let ch = h.div_ceil(2);
        match self {
            Self::Yuv420p => vec![h, ch, ch],
            Self::Yuv422p | Self::Yuv444p => vec![h, h, h],
            Self::Nv12 => vec![h, ch],
            Self::Rgb24 | Self::Rgba32 | Self::Bgra32 | Self::Gray8 => vec![h],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorSpace {
    #[default]
    Bt601, // SD
    Bt709, // HD
}

impl ColorSpace {
    /// Returns (Kr, Kb) where Kg = 1 - Kr - Kb
    pub fn coefficients(&self) -> (f32, f32) {
        match self {
            Self::Bt601 => (0.299, 0.114),
            Self::Bt709 => (0.2126, 0.0722),
        }
    }

    /// Full-range RGB to (Y, Cb, Cr), chroma centred on 128.
    pub fn rgb_to_yuv(&self, r: u8, g: u8, b: u8) -> (f32, f32, f32) {
        let (kr, kb) = self.coefficients();
        let kg = 1.0 - kr - kb;
        let (r, g, b) = (r as f32, g as f32, b as f32);
        let y = kr * r + kg * g + kb * b;
        let cb = (b - y) / (2.0 * (1.0 - kb)) + 128.0;
        let cr = (r - y) / (2.0 * (1.0 - kr)) + 128.0;
        (y, cb, cr)
    }
}

// ============================================================================
// I420 Output
// ============================================================================

#[derive(Debug, Clone)]
pub struct I420Planes {
    pub width: u32,
    pub height: u32,
    pub y: Bytes,
    pub u: Bytes,
    pub v: Bytes,
}

impl I420Planes {
    pub fn chroma_size(width: u32, height: u32) -> (usize, usize) {
        (width.div_ceil(2) as usize, height.div_ceil(2) as usize)
    }
}

struct PlaneReader<'a> {
    frame: &'a RawVideoFrame,
}

impl<'a> PlaneReader<'a> {
    fn row(&self, plane: usize, row: usize, len: usize) -> Result<&'a [u8], ConvertError> {
        let data = &self.frame.planes[plane];
        let start = row * self.frame.strides[plane];
        let end = start + len;
        data.get(start..end).ok_or(ConvertError::ShortPlane {
            plane,
            row,
            end,
            len: data.len(),
        })
    }
}

/// Rescale any supported layout to tightly packed I420.
pub fn to_i420(frame: &RawVideoFrame) -> Result<I420Planes, ConvertError> {
    let (width, height) = (frame.width, frame.height);
    if width == 0 || height == 0 {
        return Err(ConvertError::EmptyPicture { width, height });
    }
    let needed = frame.format.plane_count();
    let got = frame.planes.len().min(frame.strides.len());
    if got < needed {
        return Err(ConvertError::MissingPlane {
            format: frame.format,
            needed,
            got,
        });
    }

    let w = width as usize;
    let h = height as usize;
    let (cw, ch) = I420Planes::chroma_size(width, height);
    let reader = PlaneReader { frame };

    let mut y = Vec::with_capacity(w * h);
    let mut u = Vec::with_capacity(cw * ch);
    let mut v = Vec::with_capacity(cw * ch);

    match frame.format {
        PixelFormat::Yuv420p => {
            copy_plane(&reader, 0, w, h, &mut y)?;
            copy_plane(&reader, 1, cw, ch, &mut u)?;
            copy_plane(&reader, 2, cw, ch, &mut v)?;
        }
        PixelFormat::Yuv422p => {
            copy_plane(&reader, 0, w, h, &mut y)?;
            halve_rows(&reader, 1, cw, h, &mut u)?;
            halve_rows(&reader, 2, cw, h, &mut v)?;
        }
        PixelFormat::Yuv444p => {
            copy_plane(&reader, 0, w, h, &mut y)?;
            halve_both(&reader, 1, w, h, &mut u)?;
            halve_both(&reader, 2, w, h, &mut v)?;
        }
        PixelFormat::Nv12 => {
            copy_plane(&reader, 0, w, h, &mut y)?;
            for row in 0..ch {
                let uv = reader.row(1, row, cw * 2)?;
                for pair in uv.chunks_exact(2) {
                    u.push(pair[0]);
                    v.push(pair[1]);
                }
            }
        }
        PixelFormat::Gray8 => {
            copy_plane(&reader, 0, w, h, &mut y)?;
            u.resize(cw * ch, 128);
            v.resize(cw * ch, 128);
        }
        PixelFormat::Rgb24 => rgb_to_i420(&reader, frame, 3, [0, 1, 2], &mut y, &mut u, &mut v)?,
        PixelFormat::Rgba32 => rgb_to_i420(&reader, frame, 4, [0, 1, 2], &mut y, &mut u, &mut v)?,
        PixelFormat::Bgra32 => rgb_to_i420(&reader, frame, 4, [2, 1, 0], &mut y, &mut u, &mut v)?,
    }

    Ok(I420Planes {
        width,
        height,
        y: Bytes::from(y),
        u: Bytes::from(u),
        v: Bytes::from(v),
    })
}

fn copy_plane(
    reader: &PlaneReader<'_>,
    plane: usize,
    width: usize,
    rows: usize,
    out: &mut Vec<u8>,
) -> Result<(), ConvertError> {
    for row in 0..rows {
        out.extend_from_slice(reader.row(plane, row, width)?);
    }
    Ok(())
}

/// Average vertical pairs (4:2:2 chroma to 4:2:0).
fn halve_rows(
    reader: &PlaneReader<'_>,
    plane: usize,
    width: usize,
    src_rows: usize,
    out: &mut Vec<u8>,
) -> Result<(), ConvertError> {
    for row in (0..src_rows).step_by(2) {
        let top = reader.row(plane, row, width)?;
        let bottom = reader.row(plane, (row + 1).min(src_rows - 1), width)?;
        out.extend(
            top.iter()
                .zip(bottom)
                .map(|(&a, &b)| ((a as u16 + b as u16 + 1) / 2) as u8),
        );
    }
    Ok(())
}

/// Average 2x2 blocks (4:4:4 chroma to 4:2:0).
fn halve_both(
    reader: &PlaneReader<'_>,
    plane: usize,
    src_width: usize,
    src_rows: usize,
    out: &mut Vec<u8>,
) -> Result<(), ConvertError> {
    for row in (0..src_rows).step_by(2) {
        let top = reader.row(plane, row, src_width)?;
        let bottom = reader.row(plane, (row + 1).min(src_rows - 1), src_width)?;
        for x in (0..src_width).step_by(2) {
            let x1 = (x + 1).min(src_width - 1);
            let sum = top[x] as u16 + top[x1] as u16 + bottom[x] as u16 + bottom[x1] as u16;
            out.push(((sum + 2) / 4) as u8);
        }
    }
    Ok(())
}

fn rgb_to_i420(
    reader: &PlaneReader<'_>,
    frame: &RawVideoFrame,
    bpp: usize,
    order: [usize; 3],
    y: &mut Vec<u8>,
    u: &mut Vec<u8>,
    v: &mut Vec<u8>,
) -> Result<(), ConvertError> {
    let w = frame.width as usize;
    let h = frame.height as usize;
    let color = frame.color_space;
    let pixel = |line: &[u8], x: usize| {
        let p = &line[x * bpp..];
        color.rgb_to_yuv(p[order[0]], p[order[1]], p[order[2]])
    };

    for row in 0..h {
        let line = reader.row(0, row, w * bpp)?;
        for x in 0..w {
            y.push(clamp_u8(pixel(line, x).0));
        }
    }

    for row in (0..h).step_by(2) {
        let top = reader.row(0, row, w * bpp)?;
        let bottom = reader.row(0, (row + 1).min(h - 1), w * bpp)?;
        for x in (0..w).step_by(2) {
            let x1 = (x + 1).min(w - 1);
            let (mut cb, mut cr) = (0.0, 0.0);
            for (line, col) in [(top, x), (top, x1), (bottom, x), (bottom, x1)] {
                let (_, b, r) = pixel(line, col);
                cb += b;
                cr += r;
            }
            u.push(clamp_u8(cb / 4.0));
            v.push(clamp_u8(cr / 4.0));
        }
    }
    Ok(())
}

fn clamp_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
