//! Test pattern generation for simulated frames.

use crate::native::PixelFormat;

/// LCG with glibc constants, so patterns are reproducible across platforms.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// Diagonal gradient with a little per-frame noise, packed for `format`.
///
/// The top-left sample is always 0 and the bottom-right sample is always the
/// format's maximum, so full-scale conversions can be checked on any frame.
pub fn generate_test_pattern(
    format: PixelFormat,
    width: u32,
    height: u32,
    frame_num: u64,
) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let channels = format.channels();
    let max = u64::from(format.max_value());
    let span = (w + h).saturating_sub(2).max(1) as u64;
    let frame_seed = frame_num.wrapping_mul(2654435761);

    let mut buffer = Vec::with_capacity(format.buffer_len(width, height));
    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) as u64;
            let base = (x + y) as u64 * max / span;
            let corner = idx == 0 || idx + 1 == (w * h) as u64;
            // Two LSBs of noise, kept away from the pinned corners
            let noise = if corner { 0 } else { prng(frame_seed ^ idx) & 0x3 };
            let value = base.saturating_sub(noise).min(max) as u16;
            for _ in 0..channels {
                match format.bytes_per_sample() {
                    1 => buffer.push(value as u8),
                    _ => buffer.extend_from_slice(&value.to_le_bytes()),
                }
            }
        }
    }
    buffer
}

/// Frame filled with one raw value.
pub fn uniform(format: PixelFormat, width: u32, height: u32, value: u16) -> Vec<u8> {
    let samples = width as usize * height as usize * format.channels();
    match format.bytes_per_sample() {
        1 => vec![value.min(255) as u8; samples],
        _ => value
            .to_le_bytes()
            .iter()
            .copied()
            .cycle()
            .take(samples * 2)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_pins_corners() {
        let data = generate_test_pattern(PixelFormat::Mono12, 8, 4, 3);
        assert_eq!(data.len(), 8 * 4 * 2);
        let first = u16::from_le_bytes([data[0], data[1]]);
        let last = u16::from_le_bytes([data[62], data[63]]);
        assert_eq!(first, 0);
        assert_eq!(last, 4095);
    }

    #[test]
    fn pattern_is_reproducible() {
        let a = generate_test_pattern(PixelFormat::Mono8, 16, 16, 7);
        let b = generate_test_pattern(PixelFormat::Mono8, 16, 16, 7);
        assert_eq!(a, b);
    }

    #[test]
    fn uniform_packs_little_endian() {
        let data = uniform(PixelFormat::Mono16, 2, 1, 0x0102);
        assert_eq!(data, vec![0x02, 0x01, 0x02, 0x01]);
    }
}
