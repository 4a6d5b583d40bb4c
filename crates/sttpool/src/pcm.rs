//! Raw PCM conversion.

/// Largest positive i16, used as the normalization divisor.
pub const PCM_SCALE: f32 = i16::MAX as f32;

/// Bytes per sample of signed 16-bit PCM.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Decode little-endian i16 pairs into normalized floats, appending to `out`.
///
/// A trailing odd byte is ignored; callers reject odd-length chunks before this.
pub fn decode_s16le_into(bytes: &[u8], out: &mut Vec<f32>) {
    out.extend(
        bytes
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / PCM_SCALE),
    );
}

/// Number of whole milliseconds of audio in `bytes` at `sample_rate`.
pub fn duration_ms(bytes: usize, sample_rate: u32) -> u64 {
    let samples = (bytes / BYTES_PER_SAMPLE) as u64;
    samples * 1000 / u64::from(sample_rate.max(1))
}
