//! # μ-law Sample Codec
//!
//! Converts single samples between 8-bit μ-law (G.711, the telephone encoding)
//! and 16-bit linear PCM.
//!
//! ## Byte Layout (after inverting all bits):
//! - **bit 7**: sign (set means negative)
//! - **bits 6-4**: exponent (segment number)
//! - **bits 3-0**: mantissa (position inside the segment)
//!
//! Both directions are total: every byte decodes and every `i16` encodes.
//! The round trip is lossy (quantization) but deterministic.
//! Re-encoding a decoded byte gives the same byte, except 0x7F (negative
//! zero), which comes back as 0xFF.

/// Offset added to the magnitude before segment search.
pub const BIAS: i32 = 0x84;

/// Largest magnitude the encoder accepts; larger inputs are clipped.
pub const CLIP: i32 = 32635;

/// Decode one μ-law byte into a linear sample.
///
/// The output magnitude never exceeds 32124, so the result always fits.
pub fn decode_sample(byte: u8) -> i16 {
    let inverted = !byte;
    let negative = inverted & 0x80 != 0;
    let exponent = (inverted >> 4) & 0x07;
    let mantissa = i32::from(inverted & 0x0F);

    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;

    if negative {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encode one linear sample as a μ-law byte.
pub fn encode_sample(sample: i16) -> u8 {
    let clipped = i32::from(sample).clamp(-CLIP, CLIP);
    let sign: u8 = if clipped < 0 { 0x80 } else { 0x00 };
    let value = clipped.abs() + BIAS;

    // Descending scan, first segment whose lower bound the value reaches wins.
    let exponent = (1..=7u8)
        .rev()
        .find(|&exp| value >= (0x80 << exp))
        .unwrap_or(0);
    let mantissa = ((value >> (exponent + 3)) & 0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}

/// Decode a whole μ-law frame, one sample per byte.
pub fn decode_frame(frame: &[u8]) -> Vec<i16> {
    frame.iter().map(|&byte| decode_sample(byte)).collect()
}

/// Encode a whole frame of linear samples, one byte per sample.
pub fn encode_frame(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&sample| encode_sample(sample)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponent_of(byte: u8) -> u8 {
        (!byte >> 4) & 0x07
    }

    #[test]
    fn test_silence() {
        assert_eq!(decode_sample(0xFF), 0);
        // 0x7F is "negative zero"
        assert_eq!(decode_sample(0x7F), 0);
        assert_eq!(encode_sample(0), 0xFF);
    }

    #[test]
    fn test_known_values() {
        assert_eq!(encode_sample(1000), 0xCE);
        assert_eq!(decode_sample(0xCE), 988);
        assert_eq!(encode_sample(-1000), 0x4E);
        assert_eq!(decode_sample(0x4E), -988);
        assert_eq!(encode_sample(8), 0xFE);
        assert_eq!(decode_sample(0xFE), 8);
    }

    #[test]
    fn test_extremes_are_clipped() {
        assert_eq!(encode_sample(i16::MAX), 0x80);
        assert_eq!(encode_sample(i16::MIN), 0x00);
        assert_eq!(decode_sample(0x80), 32124);
        assert_eq!(decode_sample(0x00), -32124);
    }

    #[test]
    fn test_byte_round_trip() {
        for byte in 0..=255u8 {
            let back = encode_sample(decode_sample(byte));
            if byte == 0x7F {
                assert_eq!(back, 0xFF);
            } else {
                assert_eq!(back, byte, "byte {:#04x} did not survive", byte);
            }
        }
    }

    #[test]
    fn test_quantization_error_is_bounded() {
        for sample in i16::MIN..=i16::MAX {
            let byte = encode_sample(sample);
            let step = 1i32 << (exponent_of(byte) + 3);
            let error = (i32::from(decode_sample(byte)) - i32::from(sample)).abs();
            assert!(
                error <= step,
                "sample {} decoded with error {} (step {})",
                sample,
                error,
                step
            );
        }
    }

    #[test]
    fn test_decode_encode_is_idempotent() {
        for sample in i16::MIN..=i16::MAX {
            let once = decode_sample(encode_sample(sample));
            let twice = decode_sample(encode_sample(once));
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_frame_helpers_preserve_length() {
        let frame = vec![0xFFu8; 160];
        let samples = decode_frame(&frame);
        assert_eq!(samples.len(), 160);
        assert!(samples.iter().all(|&s| s == 0));
        assert_eq!(encode_frame(&samples), frame);
    }
}
