//! voxlink audio capture
//!
//! Bridges a physical input device to framed PCM16 chunks and a live loudness
//! signal for a conversational voice agent.
//!
//! ## Architecture
//!
//! ```text
//! Input device (cpal, real-time callback)
//!   │  first channel only, resampled to the session rate (rubato)
//!   ├─> AudioProcessingUnit  f32 -> PCM16 ring, windowed RMS
//!   │     │
//!   │     └─> ChunkSender ──(ringbuf SPSC)──> ChunkReceiver
//!   │                                           │  device thread
//!   │                                           ├─> AudioRecorder (optional, last 10s)
//!   │                                           ├─> meter callback (level)
//!   │                                           └─> audio data callback (AudioChunk)
//!   │
//!   └─> AudioPlayer  PCM16 from the agent -> output device
//! ```
//!
//! The real-time callback never blocks on the control side: it only pushes
//! completed chunks into the hand-off and wakes the device thread.

pub mod capture;
pub mod error;
pub mod handoff;
pub mod player;
pub mod processor;
pub mod recorder;
pub mod resampler;

pub use capture::{AudioCapture, DeviceInfo, MeterCallback};
pub use error::{AudioError, Result};
pub use handoff::{chunk_handoff, ChunkReceiver, ChunkSender};
pub use player::AudioPlayer;
pub use processor::{float_to_pcm16, AudioChunk, AudioProcessingUnit};
pub use recorder::{AudioRecorder, RecorderState};
pub use resampler::Resampler;

/// Session sample rate (16kHz mono is what the agent expects)
pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// Samples per processing frame
pub const BLOCK_SIZE: usize = 128;

/// Frames accumulated into one outbound chunk
pub const BLOCKS_PER_CHUNK: usize = 4;

/// Samples per emitted chunk
pub const CHUNK_SAMPLES: usize = BLOCK_SIZE * BLOCKS_PER_CHUNK;

/// Audio configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Session sample rate (default: 16000 Hz)
    pub sample_rate: u32,
    /// Device index (None = default device)
    pub device_index: Option<usize>,
    /// Chunks the SPSC hand-off can hold before the callback starts dropping
    pub handoff_capacity: usize,
    /// Length of the debug recording window in seconds (default: 10.0)
    pub recording_seconds: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: TARGET_SAMPLE_RATE,
            device_index: None,
            handoff_capacity: 64,
            recording_seconds: 10.0,
        }
    }
}
