//! Frames and the per-image trailer written by the transfer driver.
//!
//! Every image slot in a region is laid out as
//!
//! ```text
//! | pixels (image_bytes) | image number: u64 LE | timestamp µs: u64 LE |
//! ```
//!
//! Image numbers start at 1; a slot whose trailer is all zeroes was not
//! filled. A zero timestamp means the camera did not stamp the image, in which
//! case the host receive time is used.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use crate::error::{AcqError, AcqResult};
use crate::settings::ImageDescriptor;

/// Trailer length in bytes.
pub const TRAILER_LEN: usize = 16;

/// Acquisition timestamp of a frame.
pub type FrameTimestamp = DateTime<Utc>;

/// Trailer following each image slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameTrailer {
    /// Hardware image number (1-based).
    pub image_number: u64,
    /// Microseconds since the Unix epoch, 0 when not stamped.
    pub timestamp_us: u64,
}

impl FrameTrailer {
    /// Write the trailer into the last bytes of `out`.
    pub fn encode(&self, out: &mut [u8]) -> AcqResult<()> {
        if out.len() < TRAILER_LEN {
            return Err(AcqError::Trailer(format!(
                "need {} bytes for trailer, got {}",
                TRAILER_LEN,
                out.len()
            )));
        }
        out[..8].copy_from_slice(&self.image_number.to_le_bytes());
        out[8..TRAILER_LEN].copy_from_slice(&self.timestamp_us.to_le_bytes());
        Ok(())
    }

    /// Read the trailer from the last bytes of `raw`.
    pub fn decode(raw: &[u8]) -> AcqResult<Self> {
        if raw.len() < TRAILER_LEN {
            return Err(AcqError::Trailer(format!(
                "trailer truncated: {} of {} bytes",
                raw.len(),
                TRAILER_LEN
            )));
        }
        let mut number = [0u8; 8];
        let mut stamp = [0u8; 8];
        number.copy_from_slice(&raw[..8]);
        stamp.copy_from_slice(&raw[8..TRAILER_LEN]);
        Ok(Self {
            image_number: u64::from_le_bytes(number),
            timestamp_us: u64::from_le_bytes(stamp),
        })
    }

    /// Whether the slot this trailer closes was never written.
    pub fn is_empty(&self) -> bool {
        self.image_number == 0 && self.timestamp_us == 0
    }

    /// The trailer timestamp, or `received` when the camera did not stamp the image.
    pub fn timestamp_or(&self, received: FrameTimestamp) -> FrameTimestamp {
        if self.timestamp_us == 0 {
            return received;
        }
        i64::try_from(self.timestamp_us)
            .ok()
            .and_then(|us| Utc.timestamp_micros(us).single())
            .unwrap_or(received)
    }

    /// Trailer stamped with `at`.
    pub fn stamped(image_number: u64, at: FrameTimestamp) -> Self {
        Self {
            image_number,
            timestamp_us: u64::try_from(at.timestamp_micros()).unwrap_or(0),
        }
    }
}

/// One acquired image.
///
/// Pixel data is stored little endian; 8-bit images use one byte per pixel,
/// deeper images two.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bits per pixel (e.g., 8, 12, 16)
    pub bit_depth: u8,
    /// Hardware image number from the trailer
    pub image_number: u64,
    /// Raw pixel data
    pub data: Bytes,
}

impl Frame {
    /// Create a new frame from 16-bit pixel data.
    pub fn from_u16(width: u32, height: u32, image_number: u64, pixels: &[u16]) -> Self {
        let mut data = Vec::with_capacity(pixels.len() * 2);
        for pixel in pixels {
            data.extend_from_slice(&pixel.to_le_bytes());
        }
        Self {
            width,
            height,
            bit_depth: 16,
            image_number,
            data: Bytes::from(data),
        }
    }

    /// Payload size in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Get pixel value at (x, y).
    pub fn get(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize) * (self.width as usize) + x as usize;
        if self.bit_depth <= 8 {
            self.data.get(idx).map(|&v| u32::from(v))
        } else {
            let start = idx * 2;
            let lo = *self.data.get(start)?;
            let hi = *self.data.get(start + 1)?;
            Some(u32::from(u16::from_le_bytes([lo, hi])))
        }
    }
}

/// Split drained region content into frames.
///
/// Unfilled slots are skipped. Pixel payloads share the region's
/// allocation.
pub fn split_region(
    content: &Bytes,
    descriptor: &ImageDescriptor,
    images: usize,
    received: FrameTimestamp,
) -> AcqResult<Vec<(Frame, FrameTimestamp)>> {
    let slot = descriptor.slot_bytes();
    let needed = descriptor.region_bytes(images);
    if content.len() < needed {
        return Err(AcqError::Trailer(format!(
            "region holds {} bytes, {} images of {}x{} need {}",
            content.len(),
            images,
            descriptor.width,
            descriptor.height,
            needed
        )));
    }

    let image_bytes = descriptor.image_bytes();
    let mut frames = Vec::with_capacity(images);
    for index in 0..images {
        let base = index * slot;
        let trailer = FrameTrailer::decode(&content[base + image_bytes..base + slot])?;
        if trailer.is_empty() {
            continue;
        }
        let frame = Frame {
            width: descriptor.width,
            height: descriptor.height,
            bit_depth: descriptor.bit_depth,
            image_number: trailer.image_number,
            data: content.slice(base..base + image_bytes),
        };
        frames.push((frame, trailer.timestamp_or(received)));
    }
    Ok(frames)
}
