//! # Fixed-Ratio Rate Conversion
//!
//! Only the two conversions the relay needs are supported:
//! - **8 kHz → 16 kHz**: nearest-neighbour duplication
//! - **24 kHz → 8 kHz**: decimation by 3
//!
//! Neither direction filters. Decimation without an anti-aliasing filter
//! trades some quality for zero added latency.

/// Upsample by 2: every input sample is emitted twice in a row.
///
/// Output length is exactly `2 * samples.len()`.
pub fn upsample_2x(samples: &[i16]) -> Vec<i16> {
    let mut output = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        output.push(sample);
        output.push(sample);
    }
    output
}

/// Downsample by 3: keeps `samples[3 * i]` and drops the rest.
///
/// Output length is `samples.len() / 3`; a trailing group shorter than three
/// samples is discarded.
pub fn decimate_3(samples: &[i16]) -> Vec<i16> {
    samples.chunks_exact(3).map(|group| group[0]).collect()
}
