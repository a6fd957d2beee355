//! Packed 1-bit pixel data.
//!
//! Frames are packed back to back without padding between them, least
//! significant bit first, so a frame may start in the middle of a byte. The
//! whole buffer is padded to an even length.

/// Packs row-major masks of equal length into one buffer.
pub(crate) fn pack_frames(frames: &[Vec<bool>]) -> Vec<u8> {
    let total_bits: usize = frames.iter().map(Vec::len).sum();
    let mut bytes = vec![0u8; packed_len(total_bits)];
    for (bit, set) in frames.iter().flatten().enumerate() {
        if *set {
            bytes[bit / 8] |= 1 << (bit % 8);
        }
    }
    bytes
}

/// Even byte length holding `bits` bits.
pub(crate) fn packed_len(bits: usize) -> usize {
    let len = bits.div_ceil(8);
    len + len % 2
}

/// Bytes needed to read `frames` frames of `pixels_per_frame` pixels, without
/// the trailing pad byte.
pub(crate) fn required_len(frames: usize, pixels_per_frame: usize) -> usize {
    (frames * pixels_per_frame).div_ceil(8)
}

/// Row-major indices of the set pixels of one frame.
pub(crate) fn set_pixels(bytes: &[u8], frame: usize, pixels_per_frame: usize) -> Vec<usize> {
    let start = frame * pixels_per_frame;
    (0..pixels_per_frame)
        .filter(|pixel| {
            let bit = start + pixel;
            bytes
                .get(bit / 8)
                .is_some_and(|byte| byte & (1 << (bit % 8)) != 0)
        })
        .collect()
}

/// Row-major indices of the non-zero pixels of one 8-bit frame, as used by
/// fractional segmentations.
pub(crate) fn set_pixels_8bit(bytes: &[u8], frame: usize, pixels_per_frame: usize) -> Vec<usize> {
    let start = frame * pixels_per_frame;
    bytes
        .get(start..start + pixels_per_frame)
        .map(|frame_bytes| {
            frame_bytes
                .iter()
                .enumerate()
                .filter(|(_, value)| **value != 0)
                .map(|(pixel, _)| pixel)
                .collect()
        })
        .unwrap_or_default()
}
