//! Debug recorder: rolling window of captured audio with local playback
//!
//! Side observer of the capture path. It keeps the most recent N seconds of
//! PCM16 audio in a circular buffer and can render that window through the
//! default output device.
//!
//! States: `idle -> recording -> done <-> playback`

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{AudioError, Result};
use crate::player::open_output_stream;
use crate::resampler::Resampler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    Idle,
    Recording,
    Done,
    Playback,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecorderState::Idle => "idle",
            RecorderState::Recording => "recording",
            RecorderState::Done => "done",
            RecorderState::Playback => "playback",
        };
        f.write_str(name)
    }
}

/// Notified after every state transition
pub type StateObserver = Arc<dyn Fn(RecorderState) + Send + Sync>;

struct Inner {
    state: RecorderState,
    window: HeapRb<i16>,
    observer: Option<StateObserver>,
    playback: Option<JoinHandle<()>>,
}

/// Shared handle; clones refer to the same recorder
#[derive(Clone)]
pub struct AudioRecorder {
    inner: Arc<Mutex<Inner>>,
    cancel: Arc<AtomicBool>,
    sample_rate: u32,
}

impl AudioRecorder {
    /// Recorder retaining the last `seconds` of audio at `sample_rate`
    pub fn new(sample_rate: u32, seconds: f32) -> Self {
        let capacity = ((sample_rate as f32 * seconds) as usize).max(1);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: RecorderState::Idle,
                window: HeapRb::new(capacity),
                observer: None,
                playback: None,
            })),
            cancel: Arc::new(AtomicBool::new(false)),
            sample_rate,
        }
    }

    pub fn state(&self) -> RecorderState {
        self.inner.lock().state
    }

    /// Register the state observer, replacing any previous one
    pub fn set_on_state_change<F>(&self, observer: F)
    where
        F: Fn(RecorderState) + Send + Sync + 'static,
    {
        self.inner.lock().observer = Some(Arc::new(observer));
    }

    /// Begin a fresh recording. Allowed from `idle` and `done`.
    pub fn start(&self) -> Result<()> {
        let observer = {
            let mut inner = self.inner.lock();
            match inner.state {
                RecorderState::Idle | RecorderState::Done => {}
                RecorderState::Recording => return Ok(()),
                actual => {
                    return Err(AudioError::RecorderState {
                        expected: "idle or done",
                        actual,
                    })
                }
            }
            inner.window.clear();
            inner.state = RecorderState::Recording;
            inner.observer.clone()
        };

        debug!("Recorder started");
        notify(observer, RecorderState::Recording);
        Ok(())
    }

    /// Append captured samples; ignored unless recording
    pub fn capture(&self, samples: &[i16]) {
        let mut inner = self.inner.lock();
        if inner.state == RecorderState::Recording {
            inner.window.push_slice_overwrite(samples);
        }
    }

    /// Stop recording and keep the window. No-op unless recording.
    pub fn finish(&self) {
        let observer = {
            let mut inner = self.inner.lock();
            if inner.state != RecorderState::Recording {
                return;
            }
            inner.state = RecorderState::Done;
            inner.observer.clone()
        };

        info!(
            "Recorder finished with {:.2}s retained",
            self.retained_duration()
        );
        notify(observer, RecorderState::Done);
    }

    /// Copy of the retained window, oldest sample first
    pub fn retained(&self) -> Vec<i16> {
        self.inner.lock().window.iter().copied().collect()
    }

    pub fn retained_duration(&self) -> f32 {
        self.inner.lock().window.occupied_len() as f32 / self.sample_rate as f32
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Play the retained window through the default output device.
    ///
    /// Only allowed from `done`. Returns once the output stream is running;
    /// the recorder goes back to `done` when the window has been rendered or
    /// playback is cancelled.
    pub fn playback(&self) -> Result<()> {
        let (samples, observer) = {
            let mut inner = self.inner.lock();
            if inner.state != RecorderState::Done {
                return Err(AudioError::RecorderState {
                    expected: "done",
                    actual: inner.state,
                });
            }
            inner.state = RecorderState::Playback;
            let samples: Vec<i16> = inner.window.iter().copied().collect();
            (samples, inner.observer.clone())
        };

        notify(observer.clone(), RecorderState::Playback);
        self.cancel.store(false, Ordering::Release);
        let (ready_tx, ready_rx) = sync_channel::<Result<()>>(1);
        let recorder = self.clone();

        let spawned = thread::Builder::new()
            .name("voxlink-playback".to_string())
            .spawn(move || recorder.render(samples, ready_tx));

        let setup = match spawned {
            Ok(handle) => {
                let setup = ready_rx.recv().unwrap_or_else(|_| {
                    Err(AudioError::Internal("Playback thread exited".into()))
                });
                if setup.is_ok() {
                    self.inner.lock().playback = Some(handle);
                } else {
                    let _ = handle.join();
                }
                setup
            }
            Err(e) => Err(AudioError::Internal(format!(
                "Failed to spawn playback thread: {}",
                e
            ))),
        };

        if let Err(e) = setup {
            self.inner.lock().state = RecorderState::Done;
            notify(observer, RecorderState::Done);
            return Err(e);
        }

        Ok(())
    }

    /// Stop an active playback. No-op otherwise.
    pub fn cancel_playback(&self) {
        let handle = self.inner.lock().playback.take();
        if let Some(handle) = handle {
            self.cancel.store(true, Ordering::Release);
            handle.thread().unpark();
            let _ = handle.join();
        }
    }

    /// Drop the window and return to `idle`
    pub fn reset(&self) {
        self.cancel_playback();
        let observer = {
            let mut inner = self.inner.lock();
            inner.window.clear();
            if inner.state == RecorderState::Idle {
                return;
            }
            inner.state = RecorderState::Idle;
            inner.observer.clone()
        };
        notify(observer, RecorderState::Idle);
    }

    fn render(&self, samples: Vec<i16>, ready: std::sync::mpsc::SyncSender<Result<()>>) {
        let finished = Arc::new(AtomicBool::new(false));
        let stream = match self.build_playback_stream(samples, Arc::clone(&finished)) {
            Ok(stream) => {
                let _ = ready.send(Ok(()));
                stream
            }
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };

        while !finished.load(Ordering::Acquire) && !self.cancel.load(Ordering::Acquire) {
            thread::park_timeout(Duration::from_millis(20));
        }
        drop(stream);

        let observer = {
            let mut inner = self.inner.lock();
            if inner.state != RecorderState::Playback {
                return;
            }
            inner.state = RecorderState::Done;
            inner.observer.clone()
        };
        debug!("Recorder playback ended");
        notify(observer, RecorderState::Done);
    }

    fn build_playback_stream(
        &self,
        samples: Vec<i16>,
        finished: Arc<AtomicBool>,
    ) -> Result<cpal::Stream> {
        let mono: Vec<f32> = samples.iter().map(|&s| f32::from(s) / 32768.0).collect();
        let source_rate = self.sample_rate;

        open_output_stream(move |device_rate| {
            let data = Resampler::new(source_rate, device_rate)?.process_all(&mono)?;
            let mut position = 0usize;
            Ok(move |out: &mut [f32]| {
                for slot in out.iter_mut() {
                    *slot = data.get(position).copied().unwrap_or(0.0);
                    position += 1;
                }
                if position >= data.len() {
                    finished.store(true, Ordering::Release);
                }
            })
        })
        .map(|(stream, _rate)| stream)
        .map_err(|e| {
            warn!("Recorder playback unavailable: {}", e);
            e
        })
    }
}

fn notify(observer: Option<StateObserver>, state: RecorderState) {
    if let Some(observer) = observer {
        observer(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let recorder = AudioRecorder::new(16000, 10.0);
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert!(recorder.retained().is_empty());
    }

    #[test]
    fn test_capture_ignored_unless_recording() {
        let recorder = AudioRecorder::new(8, 1.0);
        recorder.capture(&[1, 2, 3]);
        assert!(recorder.retained().is_empty());

        recorder.start().unwrap();
        recorder.capture(&[1, 2, 3]);
        recorder.finish();
        recorder.capture(&[4, 5]);
        assert_eq!(recorder.retained(), vec![1, 2, 3]);
    }

    #[test]
    fn test_window_keeps_most_recent_samples() {
        // 4 Hz for 1 second retains 4 samples
        let recorder = AudioRecorder::new(4, 1.0);
        recorder.start().unwrap();
        recorder.capture(&[1, 2, 3]);
        recorder.capture(&[4, 5, 6]);
        assert_eq!(recorder.retained(), vec![3, 4, 5, 6]);
        assert!((recorder.retained_duration() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_restart_clears_window() {
        let recorder = AudioRecorder::new(8, 1.0);
        recorder.start().unwrap();
        recorder.capture(&[7; 4]);
        recorder.finish();
        recorder.start().unwrap();
        assert!(recorder.retained().is_empty());
        assert_eq!(recorder.state(), RecorderState::Recording);
    }

    #[test]
    fn test_playback_requires_done() {
        let recorder = AudioRecorder::new(8, 1.0);
        let err = recorder.playback().unwrap_err();
        assert!(matches!(
            err,
            AudioError::RecorderState {
                actual: RecorderState::Idle,
                ..
            }
        ));

        recorder.start().unwrap();
        assert!(recorder.playback().is_err());
        assert_eq!(recorder.state(), RecorderState::Recording);
    }

    #[test]
    fn test_observer_sees_transitions() {
        let recorder = AudioRecorder::new(8, 1.0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        recorder.set_on_state_change(move |state| sink.lock().push(state));

        recorder.start().unwrap();
        recorder.finish();
        recorder.finish();
        recorder.reset();

        assert_eq!(
            *seen.lock(),
            vec![
                RecorderState::Recording,
                RecorderState::Done,
                RecorderState::Idle
            ]
        );
    }

    #[test]
    fn test_cancel_without_playback_is_noop() {
        let recorder = AudioRecorder::new(8, 1.0);
        recorder.cancel_playback();
        assert_eq!(recorder.state(), RecorderState::Idle);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&RecorderState::Playback).unwrap();
        assert_eq!(json, "\"playback\"");
        assert_eq!(RecorderState::Done.to_string(), "done");
    }
}
