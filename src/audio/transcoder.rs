//! # Transcoder
//!
//! Composes the sample codec and the rate converters into the two pipelines a
//! relay needs.
//!
//! ## Pipelines:
//! - **Inbound** (telephone → model): μ-law 8 kHz → linear 8 kHz → linear 16 kHz
//! - **Outbound** (model → telephone): linear 24 kHz → linear 8 kHz → μ-law 8 kHz
//!
//! Each call converts exactly one frame and either returns the whole converted
//! frame or an error; a frame is never partially applied. Callers drop failed
//! frames and carry on.

use byteorder::{ByteOrder, LittleEndian};

use crate::audio::{codec, resample, MODEL_OUTPUT_RATE};
use crate::error::TranscodeError;

/// Stateless converter between telephone and model audio formats.
#[derive(Debug, Clone, Copy, Default)]
pub struct Transcoder;

impl Transcoder {
    pub fn new() -> Self {
        Self
    }

    /// Telephone μ-law frame → 16 kHz little-endian PCM bytes.
    ///
    /// ## Sizes:
    /// `n` μ-law bytes become `2n` samples, i.e. `4n` bytes of PCM.
    /// A 20 ms telephone frame (160 bytes) becomes 640 bytes.
    pub fn inbound(&self, frame: &[u8]) -> Result<Vec<u8>, TranscodeError> {
        let linear_8k = codec::decode_frame(frame);
        let linear_16k = resample::upsample_2x(&linear_8k);
        Ok(samples_to_pcm(&linear_16k))
    }

    /// Model PCM frame at `rate` Hz → telephone μ-law bytes.
    ///
    /// ## Validation:
    /// - `rate` must be 24 kHz, the only model output rate the relay decimates
    /// - the byte length must be even (whole 16-bit samples)
    pub fn outbound(&self, pcm: &[u8], rate: u32) -> Result<Vec<u8>, TranscodeError> {
        if rate != MODEL_OUTPUT_RATE {
            return Err(TranscodeError::UnsupportedRate {
                expected: MODEL_OUTPUT_RATE,
                actual: rate,
            });
        }

        let linear_24k = pcm_to_samples(pcm)?;
        let linear_8k = resample::decimate_3(&linear_24k);
        Ok(codec::encode_frame(&linear_8k))
    }
}

/// Parse little-endian 16-bit PCM bytes into samples.
pub fn pcm_to_samples(pcm: &[u8]) -> Result<Vec<i16>, TranscodeError> {
    if pcm.len() % 2 != 0 {
        return Err(TranscodeError::OddLength(pcm.len()));
    }

    let mut samples = vec![0i16; pcm.len() / 2];
    LittleEndian::read_i16_into(pcm, &mut samples);
    Ok(samples)
}

/// Serialize samples as little-endian 16-bit PCM bytes.
pub fn samples_to_pcm(samples: &[i16]) -> Vec<u8> {
    let mut pcm = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut pcm);
    pcm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_telephone_frame_size() {
        let transcoder = Transcoder::new();
        let frame = vec![0xFFu8; 160];

        let pcm = transcoder.inbound(&frame).unwrap();

        // 160 samples duplicated to 320 samples, 2 bytes each
        assert_eq!(pcm.len(), 640);
        assert_eq!(pcm_to_samples(&pcm).unwrap().len(), 320);
        assert!(pcm.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_inbound_duplicates_decoded_samples() {
        let transcoder = Transcoder::new();
        let pcm = transcoder.inbound(&[0xCE, 0x4E]).unwrap();
        let samples = pcm_to_samples(&pcm).unwrap();

        assert_eq!(samples, vec![988, 988, -988, -988]);
    }

    #[test]
    fn test_outbound_model_frame_size() {
        let transcoder = Transcoder::new();
        // 600 samples at 24 kHz
        let pcm = samples_to_pcm(&vec![1000i16; 600]);
        assert_eq!(pcm.len(), 1200);

        let mulaw = transcoder.outbound(&pcm, MODEL_OUTPUT_RATE).unwrap();

        assert_eq!(mulaw.len(), 200);
        assert!(mulaw.iter().all(|&b| b == 0xCE));
    }

    #[test]
    fn test_outbound_keeps_every_third_sample() {
        let transcoder = Transcoder::new();
        let pcm = samples_to_pcm(&[1000, 0, 0, -1000, 0, 0, 8]);

        let mulaw = transcoder.outbound(&pcm, MODEL_OUTPUT_RATE).unwrap();

        assert_eq!(mulaw, vec![0xCE, 0x4E]);
    }

    #[test]
    fn test_outbound_rejects_odd_length() {
        let transcoder = Transcoder::new();
        assert_eq!(
            transcoder.outbound(&[0u8; 5], MODEL_OUTPUT_RATE),
            Err(TranscodeError::OddLength(5))
        );
    }

    #[test]
    fn test_outbound_rejects_other_rates() {
        let transcoder = Transcoder::new();
        assert_eq!(
            transcoder.outbound(&[0u8; 12], 16_000),
            Err(TranscodeError::UnsupportedRate {
                expected: 24_000,
                actual: 16_000
            })
        );
    }

    #[test]
    fn test_empty_frames() {
        let transcoder = Transcoder::new();
        assert!(transcoder.inbound(&[]).unwrap().is_empty());
        assert!(transcoder.outbound(&[], MODEL_OUTPUT_RATE).unwrap().is_empty());
    }
}
