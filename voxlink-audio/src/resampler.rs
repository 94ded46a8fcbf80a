//! Audio resampling with rubato
//!
//! Converts mono audio between the device rate and the session rate. Input of
//! any length is accepted; samples are buffered until a full rubato chunk is
//! available.

use rubato::{
    Resampler as RubatoResampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};

use crate::error::{AudioError, Result};

/// Streaming mono resampler
pub struct Resampler {
    source_rate: u32,
    target_rate: u32,
    resampler: Option<SincFixedIn<f32>>,
    pending: Vec<f32>,
}

impl Resampler {
    /// Create new resampler
    ///
    /// # Arguments
    ///
    /// * `source_rate` - Source sample rate (e.g., 48000)
    /// * `target_rate` - Target sample rate (typically 16000)
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self> {
        if source_rate == 0 || target_rate == 0 {
            return Err(AudioError::invalid_config("Sample rate cannot be zero"));
        }

        let resampler = if source_rate != target_rate {
            Some(Self::create_resampler(source_rate, target_rate)?)
        } else {
            None
        };

        Ok(Self {
            source_rate,
            target_rate,
            resampler,
            pending: Vec::new(),
        })
    }

    fn create_resampler(source_rate: u32, target_rate: u32) -> Result<SincFixedIn<f32>> {
        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };

        // 10ms at the source rate keeps capture latency low
        let chunk_size = (source_rate as usize / 100).max(1);

        SincFixedIn::<f32>::new(
            target_rate as f64 / source_rate as f64,
            2.0,
            params,
            chunk_size,
            1,
        )
        .map_err(|e| AudioError::ResampleError(format!("Failed to create resampler: {:?}", e)))
    }

    /// Resample a block of mono samples.
    ///
    /// May return fewer samples than expected (or none) while input is
    /// buffered towards the next full chunk.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(input.to_vec());
        };

        self.pending.extend_from_slice(input);

        let mut output = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }

            let block: Vec<f32> = self.pending.drain(..needed).collect();
            let planar = resampler
                .process(&[block][..], None)
                .map_err(|e| AudioError::ResampleError(format!("Resampling failed: {:?}", e)))?;

            if let Some(channel) = planar.first() {
                output.extend_from_slice(channel);
            }
        }

        Ok(output)
    }

    /// Resample everything buffered so far, padding the last chunk
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };

        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let block = std::mem::take(&mut self.pending);
        let planar = resampler
            .process_partial(Some(&[block][..]), None)
            .map_err(|e| AudioError::ResampleError(format!("Resampling failed: {:?}", e)))?;

        Ok(planar.into_iter().next().unwrap_or_default())
    }

    /// Resample a complete clip in one go
    pub fn process_all(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let mut output = self.process(input)?;
        output.extend(self.flush()?);
        Ok(output)
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_resampling_needed() {
        let mut resampler = Resampler::new(16000, 16000).unwrap();
        assert!(resampler.is_passthrough());
        let input = vec![0.5, 0.3, 0.1, -0.2];
        let output = resampler.process(&input).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_resampling_48k_to_16k() {
        let mut resampler = Resampler::new(48000, 16000).unwrap();

        // 100ms of a 440Hz tone at 48kHz
        let input: Vec<f32> = (0..4800)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 48000.0).sin() * 0.5)
            .collect();

        let output = resampler.process(&input).unwrap();

        // Expected: 4800 / 3 = 1600 samples
        assert!(
            output.len() > 1500 && output.len() < 1700,
            "Output length {} not in expected range (expected ~1600)",
            output.len()
        );
    }

    #[test]
    fn test_small_blocks_are_buffered() {
        let mut resampler = Resampler::new(48000, 16000).unwrap();

        // 128-sample callbacks are smaller than one 480-sample chunk
        let first = resampler.process(&[0.0; 128]).unwrap();
        assert!(first.is_empty());

        let mut total = 0;
        for _ in 0..40 {
            total += resampler.process(&[0.0; 128]).unwrap().len();
        }
        assert!(total > 0);
    }

    #[test]
    fn test_invalid_config() {
        assert!(Resampler::new(0, 16000).is_err());
        assert!(Resampler::new(48000, 0).is_err());
    }
}
