//! # Audio Transcoding Module
//!
//! Converts audio between the telephone leg and the model leg of a call.
//!
//! ## Formats:
//! - **Telephone**: 8-bit μ-law, 8 kHz, mono, one byte per sample
//! - **Model input**: 16-bit little-endian linear PCM, 16 kHz, mono
//! - **Model output**: 16-bit little-endian linear PCM, 24 kHz, mono
//!
//! ## Key Components:
//! - **codec**: μ-law ⇄ linear sample conversion
//! - **resample**: the two fixed rate conversions (8k→16k, 24k→8k)
//! - **transcoder**: the inbound and outbound pipelines built from the two

pub mod codec;
pub mod resample;
pub mod transcoder;

pub use transcoder::Transcoder;

/// Rate the model expects for input audio (Hz).
pub const MODEL_INPUT_RATE: u32 = 16_000;

/// Rate the model produces output audio at (Hz).
pub const MODEL_OUTPUT_RATE: u32 = 24_000;
