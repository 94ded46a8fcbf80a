//! Real-time processing unit: float frames in, PCM16 chunks plus RMS level out
//!
//! Runs inside the device callback. Each input frame is clamped, converted to
//! signed 16-bit and written into a fixed ring; when the ring wraps, one
//! [`AudioChunk`] is emitted carrying the ring contents and the RMS of exactly
//! the samples that filled it.

use crate::CHUNK_SAMPLES;

/// Fixed-size block of mono PCM16 samples with its RMS loudness
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<i16>,
    /// RMS of the clamped float samples, in [0, 1]
    pub level: f32,
}

impl AudioChunk {
    /// Little-endian byte view, as sent on the wire
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Convert one float sample to PCM16.
///
/// Negative values scale by 32768 and positive by 32767 so that both ends of
/// the two's-complement range are reachable.
#[inline]
pub fn float_to_pcm16(sample: f32) -> i16 {
    let s = sanitize(sample);
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

#[inline]
fn sanitize(sample: f32) -> f32 {
    if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    }
}

/// Ring-buffer processor
pub struct AudioProcessingUnit {
    ring: Box<[i16]>,
    index: usize,
    sum_squares: f64,
    chunks_emitted: u64,
}

impl AudioProcessingUnit {
    /// Processor emitting [`CHUNK_SAMPLES`]-sample chunks
    pub fn new() -> Self {
        Self::with_chunk_len(CHUNK_SAMPLES)
    }

    pub fn with_chunk_len(samples: usize) -> Self {
        Self {
            ring: vec![0i16; samples.max(1)].into_boxed_slice(),
            index: 0,
            sum_squares: 0.0,
            chunks_emitted: 0,
        }
    }

    /// Process one input frame.
    ///
    /// `channels` holds one slice per input channel; only the first is used.
    /// With no channel present nothing happens.
    pub fn process<F>(&mut self, channels: &[&[f32]], mut emit: F)
    where
        F: FnMut(AudioChunk),
    {
        let Some(input) = channels.first() else {
            return;
        };

        for &raw in input.iter() {
            let s = sanitize(raw);
            self.ring[self.index] = float_to_pcm16(s);
            self.sum_squares += f64::from(s) * f64::from(s);
            self.index += 1;

            if self.index == self.ring.len() {
                let rms = (self.sum_squares / self.ring.len() as f64).sqrt() as f32;

                if self.chunks_emitted < 3 {
                    tracing::debug!(
                        "processing unit chunk #{}, rms {:.4}",
                        self.chunks_emitted,
                        rms
                    );
                }

                emit(AudioChunk {
                    samples: self.ring.to_vec(),
                    level: rms.min(1.0),
                });

                self.chunks_emitted += 1;
                self.index = 0;
                self.sum_squares = 0.0;
            }
        }
    }

    /// Samples written into the current, not yet emitted, window
    pub fn pending(&self) -> usize {
        self.index
    }
}

impl Default for AudioProcessingUnit {
    fn default() -> Self {
        Self::new()
    }
}
