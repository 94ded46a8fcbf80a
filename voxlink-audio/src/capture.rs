//! Audio capture with cpal
//!
//! Owns the input device on a dedicated device thread. The cpal callback
//! downmixes to the first channel, resamples to the session rate, runs the
//! [`AudioProcessingUnit`] and posts completed chunks into the SPSC hand-off.
//! The device thread drains the hand-off and invokes the recorder, the meter
//! callback and the audio data callback, in that order.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{AudioError, Result};
use crate::handoff::{chunk_handoff, ChunkSender};
use crate::processor::{AudioChunk, AudioProcessingUnit};
use crate::recorder::AudioRecorder;
use crate::resampler::Resampler;
use crate::{AudioConfig, BLOCK_SIZE};

/// Loudness observer, called once per emitted chunk
pub type MeterCallback = Box<dyn FnMut(f32) + Send>;

/// Audio device information
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub is_default: bool,
    pub max_input_channels: u16,
    pub default_sample_rate: u32,
}

/// Microphone capture
pub struct AudioCapture {
    config: AudioConfig,
    running: Arc<AtomicBool>,
    device_thread: Option<JoinHandle<()>>,
    meter: Arc<Mutex<Option<MeterCallback>>>,
    recorder: AudioRecorder,
    with_recording: bool,
    device_name: Option<String>,
}

impl AudioCapture {
    /// Create a closed capture; no device is touched until [`open`](Self::open)
    pub fn new(config: AudioConfig) -> Self {
        let recorder = AudioRecorder::new(config.sample_rate, config.recording_seconds);
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            device_thread: None,
            meter: Arc::new(Mutex::new(None)),
            recorder,
            with_recording: false,
            device_name: None,
        }
    }

    /// List all available input devices
    pub fn list_devices() -> Result<Vec<DeviceInfo>> {
        let host = cpal::default_host();
        let mut devices = Vec::new();

        let default_name = host.default_input_device().and_then(|d| d.name().ok());

        for (index, device) in host
            .input_devices()
            .map_err(|e| AudioError::device(format!("Failed to enumerate devices: {}", e)))?
            .enumerate()
        {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Unknown Device {}", index));

            let is_default = default_name.as_deref() == Some(name.as_str());

            let (max_input_channels, default_sample_rate) = device
                .default_input_config()
                .map(|config| (config.channels(), config.sample_rate().0))
                .unwrap_or((0, 0));

            devices.push(DeviceInfo {
                index,
                name,
                is_default,
                max_input_channels,
                default_sample_rate,
            });
        }

        Ok(devices)
    }

    /// Print device list in formatted output
    pub fn print_devices() -> Result<()> {
        let devices = Self::list_devices()?;

        println!("\n{}", "=".repeat(60));
        println!("Available Input Devices:");
        println!("{}\n", "=".repeat(60));

        for device in devices {
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!("{:3}: {}{}", device.index, device.name, default_marker);
            println!(
                "     Channels: {}  Sample Rate: {} Hz\n",
                device.max_input_channels, device.default_sample_rate
            );
        }

        println!("{}", "=".repeat(60));
        Ok(())
    }

    /// Register the loudness observer, replacing the previous one.
    ///
    /// The new observer receives levels from the next delivered chunk on.
    /// Must not be called from inside a meter callback.
    pub fn set_on_meter<F>(&self, callback: F)
    where
        F: FnMut(f32) + Send + 'static,
    {
        *self.meter.lock() = Some(Box::new(callback));
    }

    pub fn clear_on_meter(&self) {
        *self.meter.lock() = None;
    }

    /// Retain the last seconds of captured audio on the next [`open`](Self::open)
    pub fn set_with_recording(&mut self, enabled: bool) {
        self.with_recording = enabled;
    }

    pub fn with_recording(&self) -> bool {
        self.with_recording
    }

    pub fn recorder(&self) -> &AudioRecorder {
        &self.recorder
    }

    pub fn is_open(&self) -> bool {
        self.device_thread.is_some()
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    /// Acquire the input device and start delivering chunks.
    ///
    /// `on_audio_data` runs on the device thread once per completed chunk.
    /// On failure nothing stays acquired and the capture remains closed.
    pub fn open<F>(&mut self, on_audio_data: F) -> Result<()>
    where
        F: FnMut(AudioChunk) + Send + 'static,
    {
        if self.is_open() {
            return Err(AudioError::AlreadyOpen);
        }

        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = sync_channel::<Result<String>>(1);

        let config = self.config.clone();
        let thread_running = Arc::clone(&running);
        let meter = Arc::clone(&self.meter);
        let recorder = self.recorder.clone();

        let handle = thread::Builder::new()
            .name("voxlink-mic".to_string())
            .spawn(move || {
                run_device_thread(config, thread_running, meter, recorder, on_audio_data, ready_tx)
            })
            .map_err(|e| AudioError::Internal(format!("Failed to spawn device thread: {}", e)))?;

        let device_name = match ready_rx.recv() {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(AudioError::Internal(
                    "Device thread exited during open".into(),
                ));
            }
        };

        info!("Microphone open: {}", device_name);

        self.running = running;
        self.device_thread = Some(handle);
        self.device_name = Some(device_name);

        if self.with_recording {
            if let Err(e) = self.recorder.start() {
                warn!("Debug recording not started: {}", e);
            }
        }

        Ok(())
    }

    /// Release the device. No callbacks fire after this returns. Idempotent.
    pub fn close(&mut self) {
        let Some(handle) = self.device_thread.take() else {
            return;
        };

        self.running.store(false, Ordering::Release);

        // Closing from inside a callback cannot join the device thread itself
        if handle.thread().id() == thread::current().id() {
            debug!("Microphone closed from its own callback");
        } else {
            handle.thread().unpark();
            if handle.join().is_err() {
                error!("Device thread panicked");
            }
        }

        self.recorder.finish();
        self.device_name = None;
        info!("Microphone closed");
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_device_thread<F>(
    config: AudioConfig,
    running: Arc<AtomicBool>,
    meter: Arc<Mutex<Option<MeterCallback>>>,
    recorder: AudioRecorder,
    mut on_audio_data: F,
    ready: SyncSender<Result<String>>,
) where
    F: FnMut(AudioChunk),
{
    let (mut sender, mut receiver) = chunk_handoff(config.handoff_capacity);
    sender.set_waker(thread::current());

    // The stream must be created, played and dropped on this thread
    let _stream = match start_input_stream(&config, sender) {
        Ok((stream, name)) => {
            let _ = ready.send(Ok(name));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while running.load(Ordering::Acquire) {
        while let Some(chunk) = receiver.try_recv() {
            if !running.load(Ordering::Acquire) {
                break;
            }

            recorder.capture(&chunk.samples);
            if let Some(callback) = meter.lock().as_mut() {
                callback(chunk.level);
            }
            on_audio_data(chunk);
        }
        thread::park_timeout(Duration::from_millis(50));
    }

    let dropped = receiver.dropped();
    if dropped > 0 {
        warn!("Hand-off overflowed, {} chunks dropped", dropped);
    }
}

fn select_device(config: &AudioConfig) -> Result<Device> {
    let host = cpal::default_host();

    if let Some(index) = config.device_index {
        debug!("Selecting input device index: {}", index);
        let mut devices = host
            .input_devices()
            .map_err(|e| AudioError::device(format!("Failed to enumerate devices: {}", e)))?;
        devices
            .nth(index)
            .ok_or_else(|| AudioError::device(format!("Device index {} not found", index)))
    } else {
        host.default_input_device()
            .ok_or_else(|| AudioError::device("No default input device found"))
    }
}

fn start_input_stream(config: &AudioConfig, sender: ChunkSender) -> Result<(Stream, String)> {
    let device = select_device(config)?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let supported = device
        .default_input_config()
        .map_err(|e| AudioError::device(format!("Failed to get device config: {}", e)))?;

    let source_rate = supported.sample_rate().0;
    let channels = supported.channels().max(1) as usize;

    info!(
        "Input {}: {} Hz x{} -> {} Hz mono",
        device_name, source_rate, channels, config.sample_rate
    );

    let resampler = Resampler::new(source_rate, config.sample_rate)?;
    let stream_config: StreamConfig = supported.config();

    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            build_input::<f32>(&device, &stream_config, channels, resampler, sender)?
        }
        SampleFormat::I16 => {
            build_input::<i16>(&device, &stream_config, channels, resampler, sender)?
        }
        SampleFormat::U16 => {
            build_input::<u16>(&device, &stream_config, channels, resampler, sender)?
        }
        other => {
            return Err(AudioError::invalid_config(format!(
                "Unsupported input sample format: {:?}",
                other
            )))
        }
    };

    stream
        .play()
        .map_err(|e| AudioError::stream(format!("Failed to start stream: {}", e)))?;

    Ok((stream, device_name))
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    channels: usize,
    mut resampler: Resampler,
    mut sender: ChunkSender,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut unit = AudioProcessingUnit::new();
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(data.chunks(channels).map(|frame| f32::from_sample(frame[0])));

                let Ok(samples) = resampler.process(&mono) else {
                    return;
                };

                for block in samples.chunks(BLOCK_SIZE) {
                    unit.process(&[block], |chunk| {
                        sender.post(chunk);
                    });
                }
            },
            |err| error!("Audio stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::stream(format!("Failed to build stream: {}", e)))
}
