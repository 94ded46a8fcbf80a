//! Agent speech playback through the default output device
//!
//! Decoded PCM16 from the agent is resampled to the device rate and queued in
//! a lock-free ring consumed by the cpal output callback. The stream lives on
//! its own thread because cpal streams are not `Send`.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::error::{AudioError, Result};
use crate::resampler::Resampler;

/// Seconds of agent audio the queue can hold
const QUEUE_SECONDS: usize = 30;

/// Open the default output device and start a stream fed by a mono fill
/// function. `build` receives the device rate and returns the fill function,
/// which is called once per callback with a buffer of one sample per frame.
pub(crate) fn open_output_stream<B, G>(build: B) -> Result<(Stream, u32)>
where
    B: FnOnce(u32) -> Result<G>,
    G: FnMut(&mut [f32]) + Send + 'static,
{
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::device("No default output device found"))?;

    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::device(format!("Failed to get output config: {}", e)))?;

    let rate = supported.sample_rate().0;
    let channels = supported.channels().max(1) as usize;
    let config: StreamConfig = supported.config();
    let fill = build(rate)?;

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_output::<f32, G>(&device, &config, channels, fill)?,
        SampleFormat::I16 => build_output::<i16, G>(&device, &config, channels, fill)?,
        SampleFormat::U16 => build_output::<u16, G>(&device, &config, channels, fill)?,
        other => {
            return Err(AudioError::invalid_config(format!(
                "Unsupported output sample format: {:?}",
                other
            )))
        }
    };

    stream
        .play()
        .map_err(|e| AudioError::stream(format!("Failed to start output stream: {}", e)))?;

    debug!(
        "Output stream running: {} ({} Hz, {} ch)",
        device.name().unwrap_or_else(|_| "Unknown".to_string()),
        rate,
        channels
    );

    Ok((stream, rate))
}

fn build_output<T, G>(
    device: &Device,
    config: &StreamConfig,
    channels: usize,
    mut fill: G,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
    G: FnMut(&mut [f32]) + Send + 'static,
{
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |out: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = out.len() / channels;
                mono.resize(frames, 0.0);
                fill(&mut mono);

                for (frame, &sample) in out.chunks_mut(channels).zip(mono.iter()) {
                    let value = T::from_sample(sample);
                    for slot in frame.iter_mut() {
                        *slot = value;
                    }
                }
            },
            |err| error!("Audio output error: {}", err),
            None,
        )
        .map_err(|e| AudioError::stream(format!("Failed to build output stream: {}", e)))
}

/// Queue-based player for synthesized agent audio
pub struct AudioPlayer {
    producer: Mutex<HeapProd<f32>>,
    resampler: Mutex<Option<Resampler>>,
    queued: Arc<AtomicUsize>,
    suspended: Arc<AtomicBool>,
    flush: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    device_rate: u32,
}

impl AudioPlayer {
    /// Open the default output device
    pub fn open() -> Result<Self> {
        let queued = Arc::new(AtomicUsize::new(0));
        let suspended = Arc::new(AtomicBool::new(false));
        let flush = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));

        let (ready_tx, ready_rx) = sync_channel::<Result<(HeapProd<f32>, u32)>>(1);

        let thread_queued = Arc::clone(&queued);
        let thread_suspended = Arc::clone(&suspended);
        let thread_flush = Arc::clone(&flush);
        let thread_running = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("voxlink-player".to_string())
            .spawn(move || {
                let mut producer = None;
                let producer_slot = &mut producer;

                let opened = open_output_stream(move |rate| {
                    let rb = HeapRb::<f32>::new(rate as usize * QUEUE_SECONDS);
                    let (prod, mut cons) = rb.split();
                    *producer_slot = Some(prod);

                    Ok(move |out: &mut [f32]| {
                        if thread_flush.swap(false, Ordering::AcqRel) {
                            let cleared = cons.clear();
                            thread_queued.fetch_sub(cleared, Ordering::AcqRel);
                        }
                        if thread_suspended.load(Ordering::Acquire) {
                            out.fill(0.0);
                            return;
                        }
                        let popped = cons.pop_slice(out);
                        thread_queued.fetch_sub(popped, Ordering::AcqRel);
                        out[popped..].fill(0.0);
                    })
                });

                let stream = match (opened, producer.take()) {
                    (Ok((stream, rate)), Some(prod)) => {
                        let _ = ready_tx.send(Ok((prod, rate)));
                        stream
                    }
                    (Err(e), _) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                    (Ok(_), None) => {
                        let _ = ready_tx.send(Err(AudioError::Internal(
                            "Output queue was not created".into(),
                        )));
                        return;
                    }
                };

                while thread_running.load(Ordering::Acquire) {
                    thread::park();
                }
                drop(stream);
            })
            .map_err(|e| AudioError::Internal(format!("Failed to spawn player thread: {}", e)))?;

        let (producer, device_rate) = match ready_rx.recv() {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(AudioError::Internal("Player thread exited".into()));
            }
        };

        info!("Audio player ready at {} Hz", device_rate);

        Ok(Self {
            producer: Mutex::new(producer),
            resampler: Mutex::new(None),
            queued,
            suspended,
            flush,
            running,
            thread: Mutex::new(Some(handle)),
            device_rate,
        })
    }

    /// Queue PCM16 mono audio recorded at `sample_rate`
    pub fn enqueue(&self, pcm: &[i16], sample_rate: u32) -> Result<()> {
        if pcm.is_empty() {
            return Ok(());
        }

        let mono: Vec<f32> = pcm.iter().map(|&s| f32::from(s) / 32768.0).collect();

        let rendered = {
            let mut guard = self.resampler.lock();
            let stale = guard
                .as_ref()
                .map(|r| r.source_rate() != sample_rate)
                .unwrap_or(true);
            if stale {
                *guard = Some(Resampler::new(sample_rate, self.device_rate)?);
            }
            match guard.as_mut() {
                Some(resampler) => resampler.process(&mono)?,
                None => mono,
            }
        };

        let pushed = self.producer.lock().push_slice(&rendered);
        self.queued.fetch_add(pushed, Ordering::AcqRel);

        if pushed < rendered.len() {
            warn!(
                "Playback queue full, dropped {} samples",
                rendered.len() - pushed
            );
        }

        Ok(())
    }

    /// Audio is queued and the output is not suspended
    pub fn is_playing(&self) -> bool {
        !self.suspended.load(Ordering::Acquire)
            && !self.flush.load(Ordering::Acquire)
            && self.queued.load(Ordering::Acquire) > 0
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Output silence while keeping the queue
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        if self.suspended.swap(false, Ordering::AcqRel) {
            debug!("Audio player resumed");
        }
    }

    /// Drop everything queued
    pub fn stop(&self) {
        self.flush.store(true, Ordering::Release);
        self.resampler.lock().take();
        debug!("Audio player flushed");
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    /// Stop the output stream and join its thread. Idempotent.
    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            handle.thread().unpark();
            let _ = handle.join();
            info!("Audio player closed");
        }
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        self.close();
    }
}
