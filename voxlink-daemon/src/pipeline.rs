//! Microphone → call pipeline integration
//!
//! The capture device thread posts chunks and levels into an unbounded tokio
//! channel; the daemon loop drains it and feeds the call. Nothing on the
//! device side ever waits on the control task.

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info};
use voxlink_audio::{AudioCapture, AudioChunk, RecorderState};

use crate::config::DaemonConfig;

/// Output of the capture device, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum MicEvent {
    Level(f32),
    Chunk(AudioChunk),
}

pub struct MicPipeline {
    audio: AudioCapture,
    tx: mpsc::UnboundedSender<MicEvent>,
}

impl MicPipeline {
    /// Returns the pipeline and the receiver the daemon loop drains
    pub fn new(config: &DaemonConfig) -> (Self, mpsc::UnboundedReceiver<MicEvent>) {
        let mut audio = AudioCapture::new(config.audio_config());
        audio.set_with_recording(config.debug_recording);

        audio.recorder().set_on_state_change(|state| {
            debug!("Recorder is {}", state);
        });

        let (tx, rx) = mpsc::unbounded_channel();
        (Self { audio, tx }, rx)
    }

    pub fn is_open(&self) -> bool {
        self.audio.is_open()
    }

    /// Acquire the input device and start posting events
    pub fn open(&mut self) -> Result<()> {
        if self.audio.is_open() {
            return Ok(());
        }

        let meter_tx = self.tx.clone();
        self.audio.set_on_meter(move |level| {
            let _ = meter_tx.send(MicEvent::Level(level));
        });

        let chunk_tx = self.tx.clone();
        self.audio
            .open(move |chunk| {
                let _ = chunk_tx.send(MicEvent::Chunk(chunk));
            })
            .context("Failed to open microphone")?;

        info!(
            "Microphone open ({})",
            self.audio.device_name().unwrap_or("default device")
        );
        Ok(())
    }

    /// Release the device. Events already queued are still delivered and
    /// must be ignored by the caller once this returns.
    pub fn close(&mut self) {
        if self.audio.is_open() {
            self.audio.close();
            self.audio.clear_on_meter();
            info!("Microphone closed");
        }
    }

    /// Takes effect the next time the microphone opens
    pub fn set_recording(&mut self, enabled: bool) {
        self.audio.set_with_recording(enabled);
    }

    pub fn recording(&self) -> bool {
        self.audio.with_recording()
    }

    pub fn recorder_state(&self) -> RecorderState {
        self.audio.recorder().state()
    }

    /// Render the retained window through the default output device
    pub fn playback(&self) -> Result<f32> {
        let recorder = self.audio.recorder();
        recorder.playback().context("Playback failed")?;
        Ok(recorder.retained_duration())
    }

    pub fn stop_playback(&self) {
        self.audio.recorder().cancel_playback();
    }
}

impl Drop for MicPipeline {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_pipeline_is_closed() {
        let config = DaemonConfig {
            debug_recording: true,
            ..DaemonConfig::default()
        };
        let (mut mic, mut rx) = MicPipeline::new(&config);

        assert!(!mic.is_open());
        assert!(mic.recording());
        assert_eq!(mic.recorder_state(), RecorderState::Idle);

        mic.set_recording(false);
        assert!(!mic.recording());

        mic.close();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_playback_needs_a_recording() {
        let (mic, _rx) = MicPipeline::new(&DaemonConfig::default());
        assert!(mic.playback().is_err());
        assert_eq!(mic.recorder_state(), RecorderState::Idle);
    }
}
