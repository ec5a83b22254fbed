//! Immutable frame buffers and their conversion to planar I420.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::decoder::DecodedBuffer;
use crate::traits::{FourCC, RawBuffer};

/// Error type for frame construction and conversion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The source buffer carried no bytes.
    #[error("frame payload is empty")]
    EmptyPayload,

    /// Width or height is zero.
    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
    },

    /// The payload is shorter than one image of the declared format.
    #[error("{format} frame of {width}x{height} needs {expected} bytes, got {actual}")]
    Truncated {
        /// Declared pixel format.
        format: FourCC,
        /// Declared width.
        width: u32,
        /// Declared height.
        height: u32,
        /// Bytes required.
        expected: usize,
        /// Bytes present.
        actual: usize,
    },

    /// The frame holds a format with no I420 conversion.
    #[error("no I420 conversion from {0}")]
    UnsupportedConversion(FourCC),
}

/// One captured image tagged with its dimensions and pixel format.
///
/// Frame buffers own their payload: building one from a device buffer copies
/// the mapped bytes, building one from a decoder output takes the decoder's
/// allocation.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    format: FourCC,
    data: Bytes,
    timestamp: Duration,
    sequence: u32,
}

impl FrameBuffer {
    /// Build a frame by copying a dequeued device buffer.
    pub fn from_raw(
        width: u32,
        height: u32,
        raw: &RawBuffer<'_>,
        format: FourCC,
    ) -> Result<Self, FrameError> {
        Self::build(
            width,
            height,
            format,
            Bytes::copy_from_slice(raw.data),
            raw.timestamp,
            raw.sequence,
        )
    }

    /// Build a frame around a decoder's output.
    pub fn from_decoded(
        width: u32,
        height: u32,
        decoded: DecodedBuffer,
        format: FourCC,
    ) -> Result<Self, FrameError> {
        Self::build(
            width,
            height,
            format,
            decoded.data,
            decoded.timestamp,
            decoded.sequence,
        )
    }

    fn build(
        width: u32,
        height: u32,
        format: FourCC,
        data: Bytes,
        timestamp: Duration,
        sequence: u32,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::InvalidDimensions { width, height });
        }
        if data.is_empty() {
            return Err(FrameError::EmptyPayload);
        }
        if let Some(expected) = format.frame_size(width, height) {
            if data.len() < expected {
                return Err(FrameError::Truncated {
                    format,
                    width,
                    height,
                    expected,
                    actual: data.len(),
                });
            }
        }

        Ok(Self {
            width,
            height,
            format,
            data,
            timestamp,
            sequence,
        })
    }

    /// Frame width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Pixel format of the payload.
    #[must_use]
    pub const fn format(&self) -> FourCC {
        self.format
    }

    /// Pixel payload.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Driver capture timestamp of the source buffer.
    #[must_use]
    pub const fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Driver sequence number of the source buffer.
    #[must_use]
    pub const fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Convert to planar I420.
    pub fn to_i420(&self) -> Result<I420Buffer, FrameError> {
        let (width, height) = (self.width, self.height);
        match self.format {
            FourCC::YU12 => I420Buffer::from_planar(width, height, &self.data),
            FourCC::NV12 => I420Buffer::from_nv12(width, height, &self.data),
            FourCC::YUYV => I420Buffer::from_yuyv(width, height, &self.data),
            FourCC::RGB3 => I420Buffer::from_rgb24(width, height, &self.data),
            other => Err(FrameError::UnsupportedConversion(other)),
        }
    }
}

/// Planar YUV 4:2:0 image with tightly packed planes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I420Buffer {
    width: u32,
    height: u32,
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
}

impl I420Buffer {
    /// Frame width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Luma plane.
    #[must_use]
    pub fn data_y(&self) -> &[u8] {
        &self.y
    }

    /// Blue-difference chroma plane.
    #[must_use]
    pub fn data_u(&self) -> &[u8] {
        &self.u
    }

    /// Red-difference chroma plane.
    #[must_use]
    pub fn data_v(&self) -> &[u8] {
        &self.v
    }

    /// Bytes per luma row.
    #[must_use]
    pub const fn stride_y(&self) -> u32 {
        self.width
    }

    /// Bytes per chroma row.
    #[must_use]
    pub const fn stride_uv(&self) -> u32 {
        self.width.div_ceil(2)
    }

    /// Concatenate the three planes into one `YU12` payload.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        let mut packed = self.y;
        packed.extend_from_slice(&self.u);
        packed.extend_from_slice(&self.v);
        packed
    }

    /// Y, U and V samples at a pixel, or `None` outside the frame.
    #[must_use]
    pub fn pixel_at(&self, x: u32, y: u32) -> Option<(u8, u8, u8)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let luma = (y * self.width + x) as usize;
        let chroma = ((y / 2) * self.stride_uv() + x / 2) as usize;
        Some((
            *self.y.get(luma)?,
            *self.u.get(chroma)?,
            *self.v.get(chroma)?,
        ))
    }

    /// Get RGB values for a pixel at the specified coordinates.
    #[must_use]
    pub fn rgb_at(&self, x: u32, y: u32) -> Option<(u8, u8, u8)> {
        let (y_val, u, v) = self.pixel_at(x, y)?;
        Some(yuv_to_rgb(y_val, u, v))
    }

    fn from_planar(width: u32, height: u32, data: &[u8]) -> Result<Self, FrameError> {
        let (luma, chroma) = plane_sizes(width, height);
        let y = take(data, 0, luma, FourCC::YU12, width, height)?;
        let u = take(data, luma, chroma, FourCC::YU12, width, height)?;
        let v = take(data, luma + chroma, chroma, FourCC::YU12, width, height)?;
        Ok(Self {
            width,
            height,
            y: y.to_vec(),
            u: u.to_vec(),
            v: v.to_vec(),
        })
    }

    fn from_nv12(width: u32, height: u32, data: &[u8]) -> Result<Self, FrameError> {
        let (luma, chroma) = plane_sizes(width, height);
        let y = take(data, 0, luma, FourCC::NV12, width, height)?;
        let uv = take(data, luma, chroma * 2, FourCC::NV12, width, height)?;
        let (u, v) = uv
            .chunks_exact(2)
            .filter_map(|pair| match *pair {
                [u, v] => Some((u, v)),
                _ => None,
            })
            .unzip();
        Ok(Self {
            width,
            height,
            y: y.to_vec(),
            u,
            v,
        })
    }

    fn from_yuyv(width: u32, height: u32, data: &[u8]) -> Result<Self, FrameError> {
        let (luma, chroma) = plane_sizes(width, height);
        let row_bytes = width.div_ceil(2) as usize * 4;
        let rows = take(data, 0, row_bytes * height as usize, FourCC::YUYV, width, height)?;
        let rows: Vec<&[u8]> = rows.chunks_exact(row_bytes).collect();

        let mut y = Vec::with_capacity(luma);
        for row in &rows {
            let lumas = row.chunks_exact(4).flat_map(|pair| match *pair {
                [y0, _, y1, _] => [y0, y1],
                _ => [0, 0],
            });
            y.extend(lumas.take(width as usize));
        }

        // Average the chroma of each vertical row pair.
        let mut u = Vec::with_capacity(chroma);
        let mut v = Vec::with_capacity(chroma);
        for pair in rows.chunks(2) {
            let [top, rest @ ..] = pair else { continue };
            let bottom = rest.first().unwrap_or(top);
            for (a, b) in top.chunks_exact(4).zip(bottom.chunks_exact(4)) {
                if let ([_, u0, _, v0], [_, u1, _, v1]) = (a, b) {
                    u.push(average(*u0, *u1));
                    v.push(average(*v0, *v1));
                }
            }
        }

        Ok(Self {
            width,
            height,
            y,
            u,
            v,
        })
    }

    /// Convert packed 24-bit RGB into I420 (full-range BT.601).
    pub fn from_rgb24(width: u32, height: u32, rgb: &[u8]) -> Result<Self, FrameError> {
        let (luma, _) = plane_sizes(width, height);
        let rgb = take(rgb, 0, luma * 3, FourCC::RGB3, width, height)?;
        let pixels: Vec<(f32, f32, f32)> = rgb
            .chunks_exact(3)
            .map(|px| match *px {
                [r, g, b] => (f32::from(r), f32::from(g), f32::from(b)),
                _ => (0.0, 0.0, 0.0),
            })
            .collect();

        let y = pixels
            .iter()
            .map(|&(r, g, b)| clamp(0.114f32.mul_add(b, 0.587f32.mul_add(g, 0.299 * r))))
            .collect();

        let (w, h) = (width as usize, height as usize);
        let mut u = Vec::new();
        let mut v = Vec::new();
        for block_y in (0..h).step_by(2) {
            for block_x in (0..w).step_by(2) {
                let mut sum = (0.0f32, 0.0f32, 0.0f32);
                let mut count = 0.0f32;
                for py in block_y..(block_y + 2).min(h) {
                    for px in block_x..(block_x + 2).min(w) {
                        if let Some(&(r, g, b)) = pixels.get(py * w + px) {
                            sum = (sum.0 + r, sum.1 + g, sum.2 + b);
                            count += 1.0;
                        }
                    }
                }
                let (r, g, b) = (sum.0 / count, sum.1 / count, sum.2 / count);
                u.push(clamp(
                    0.5f32.mul_add(b, (-0.331_264f32).mul_add(g, (-0.168_736f32).mul_add(r, 128.0))),
                ));
                v.push(clamp(
                    (-0.081_312f32).mul_add(b, (-0.418_688f32).mul_add(g, 0.5f32.mul_add(r, 128.0))),
                ));
            }
        }

        Ok(Self {
            width,
            height,
            y,
            u,
            v,
        })
    }
}

fn plane_sizes(width: u32, height: u32) -> (usize, usize) {
    let luma = width as usize * height as usize;
    let chroma = width.div_ceil(2) as usize * height.div_ceil(2) as usize;
    (luma, chroma)
}

fn take(
    data: &[u8],
    offset: usize,
    len: usize,
    format: FourCC,
    width: u32,
    height: u32,
) -> Result<&[u8], FrameError> {
    data.get(offset..offset + len).ok_or(FrameError::Truncated {
        format,
        width,
        height,
        expected: offset + len,
        actual: data.len(),
    })
}

#[allow(clippy::cast_possible_truncation)]
const fn average(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16 + 1) / 2) as u8
}

fn clamp(val: f32) -> u8 {
    if val < 0.0 {
        0
    } else if val > 255.0 {
        255
    } else {
        #[allow(clippy::cast_possible_truncation)]
        #[allow(clippy::cast_sign_loss)]
        {
            val.round() as u8
        }
    }
}

/// Convert YUV values to RGB.
///
/// Uses the ITU-R BT.601 conversion formula.
#[must_use]
#[allow(clippy::many_single_char_names)]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    (clamp(r), clamp(g), clamp(b))
}
