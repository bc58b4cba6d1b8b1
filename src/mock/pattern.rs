//! Test pattern generation for mock camera frames.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::settings::ImageDescriptor;

/// Noise amplitude relative to full scale.
const NOISE_FRACTION: f64 = 0.02;

/// Generates a deterministic test pattern.
///
/// The pattern is a diagonal gradient with a vertical bar that moves one
/// column per frame, plus seeded noise so consecutive frames differ.
/// Values are scaled to `bit_depth`.
pub fn generate_test_pattern(width: u32, height: u32, bit_depth: u8, frame_num: u64) -> Vec<u16> {
    let w = width as usize;
    let h = height as usize;
    let max = ((1u32 << bit_depth.clamp(1, 16)) - 1) as f64;
    let noise = (max * NOISE_FRACTION).max(1.0);
    let bar = if w == 0 { 0 } else { (frame_num as usize) % w };
    let mut rng = StdRng::seed_from_u64(frame_num);

    let mut buffer = vec![0u16; w * h];
    for y in 0..h {
        for x in 0..w {
            let base = if x == bar {
                max
            } else {
                (x + y) as f64 * max * 0.75 / (w + h).max(1) as f64
            };
            let value = (base + rng.gen_range(0.0..noise)).min(max);
            buffer[y * w + x] = value as u16;
        }
    }
    buffer
}

/// Write one image of the pattern into `out` using the descriptor's pixel width.
pub fn write_pattern(out: &mut [u8], descriptor: &ImageDescriptor, frame_num: u64) {
    let pixels = generate_test_pattern(
        descriptor.width,
        descriptor.height,
        descriptor.bit_depth,
        frame_num,
    );
    if descriptor.bytes_per_pixel() == 1 {
        for (dst, px) in out.iter_mut().zip(&pixels) {
            *dst = *px as u8;
        }
    } else {
        for (dst, px) in out.chunks_exact_mut(2).zip(&pixels) {
            dst.copy_from_slice(&px.to_le_bytes());
        }
    }
}
