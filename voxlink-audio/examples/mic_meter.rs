//! Open the microphone and print the loudness of each chunk
//! Usage: cargo run --example mic_meter [device_index]

use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use voxlink_audio::{AudioCapture, AudioConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let device_index = env::args().nth(1).and_then(|s| s.parse::<usize>().ok());

    let config = AudioConfig {
        device_index,
        ..Default::default()
    };

    let mut capture = AudioCapture::new(config);
    capture.set_on_meter(|level| {
        let bars = (level * 200.0).min(50.0) as usize;
        println!("{:6.4} {}", level, "#".repeat(bars));
    });

    let chunks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&chunks);
    capture.open(move |_chunk| {
        counter.fetch_add(1, Ordering::Relaxed);
    })?;

    println!("Listening for 5 seconds on {:?}", capture.device_name());
    thread::sleep(Duration::from_secs(5));
    capture.close();

    println!("Received {} chunks", chunks.load(Ordering::Relaxed));
    Ok(())
}
