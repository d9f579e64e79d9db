//! PCM16 conversions between the audio devices and the wire.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CallError;

/// Clamp to [-1, 1] and scale to i16, truncating toward zero.
#[inline]
pub fn float_to_pcm16(x: f32) -> i16 {
    (x.clamp(-1.0, 1.0) * 32767.0) as i16
}

/// Little-endian PCM16 bytes for one block of float samples.
pub fn encode_pcm16(samples: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for &s in samples {
        buf.put_i16_le(float_to_pcm16(s));
    }
    buf.freeze()
}

/// Decode base64 PCM16 LE into normalized floats. A dangling odd byte is
/// ignored.
pub fn decode_pcm16_base64(data: &str) -> Result<Vec<f32>, CallError> {
    let bytes = STANDARD.decode(data)?;
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect())
}

/// Speaking indicator driven by captured blocks.
///
/// The level is the mean absolute amplitude scaled to 0..=255.
#[derive(Debug, Clone)]
pub struct VoiceActivity {
    threshold: u8,
    speaking: bool,
}

impl VoiceActivity {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold,
            speaking: false,
        }
    }

    pub fn level(samples: &[f32]) -> u8 {
        if samples.is_empty() {
            return 0;
        }
        let mean = samples.iter().map(|s| s.abs().min(1.0)).sum::<f32>() / samples.len() as f32;
        (mean * 255.0).round() as u8
    }

    /// Feed one block level. Returns `true` when the speaking flag flipped.
    pub fn update(&mut self, level: u8) -> bool {
        let speaking = level > self.threshold;
        let changed = speaking != self.speaking;
        self.speaking = speaking;
        changed
    }

    pub fn reset(&mut self) {
        self.speaking = false;
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }
}
