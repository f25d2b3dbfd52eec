//! PCM16 sample conversion and base64 framing for the wire.

use crate::error::{Result, VoiceError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Divisor used for negative samples and for every decoded sample.
pub const PCM16_NEGATIVE_SCALE: f32 = 32_768.0;
/// Multiplier for positive samples so 1.0 maps to `i16::MAX`.
pub const PCM16_POSITIVE_SCALE: f32 = 32_767.0;

/// Quantize one normalized sample to PCM16.
///
/// Input is clamped to \[-1, 1\]. Negative samples scale by 32768 and positive
/// ones by 32767, so neither end can overflow. Positive samples round up: the
/// decoder divides by 32768, and this keeps every round trip within one step.
pub fn f32_to_pcm16(sample: f32) -> i16 {
    let s = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    if s < 0.0 {
        (s * PCM16_NEGATIVE_SCALE).round() as i16
    } else {
        (s * PCM16_POSITIVE_SCALE).ceil() as i16
    }
}

/// Convert one PCM16 sample to \[-1, 1).
pub fn pcm16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / PCM16_NEGATIVE_SCALE
}

/// Quantize a block of normalized samples.
pub fn encode_samples(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| f32_to_pcm16(s)).collect()
}

/// Convert a block of PCM16 samples to normalized floats.
pub fn decode_samples(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| pcm16_to_f32(s)).collect()
}

/// Serialize PCM16 samples as little-endian bytes.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Parse little-endian PCM16 bytes.
///
/// # Errors
///
/// Returns [`VoiceError::Decode`] if the byte count is odd.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Decode(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Base64-encode PCM16 samples for `input_audio_buffer.append`.
pub fn encode_base64(samples: &[i16]) -> String {
    BASE64.encode(pcm16_to_bytes(samples))
}

/// Decode a base64 PCM16 delta into normalized floats.
///
/// # Errors
///
/// Returns [`VoiceError::Decode`] for invalid base64, an odd byte count, or
/// an empty payload.
pub fn decode_base64(payload: &str) -> Result<Vec<f32>> {
    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|e| VoiceError::Decode(format!("invalid base64: {e}")))?;
    if bytes.is_empty() {
        return Err(VoiceError::Decode("empty audio payload".into()));
    }
    let pcm = bytes_to_pcm16(&bytes)?;
    Ok(decode_samples(&pcm))
}
