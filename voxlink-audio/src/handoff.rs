//! Lock-free chunk hand-off from the device callback to the device thread
//!
//! Uses the `ringbuf` crate for wait-free single-producer single-consumer
//! operation. The real-time callback owns the [`ChunkSender`]; the thread that
//! delivers callbacks owns the [`ChunkReceiver`]. Neither side ever blocks on
//! the other: a full queue drops the newest chunk and counts it.

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::Thread;

use crate::processor::AudioChunk;

/// Create a bounded hand-off holding up to `capacity` chunks
pub fn chunk_handoff(capacity: usize) -> (ChunkSender, ChunkReceiver) {
    let rb = HeapRb::<AudioChunk>::new(capacity.max(1));
    let (producer, consumer) = rb.split();
    let dropped = Arc::new(AtomicUsize::new(0));

    (
        ChunkSender {
            producer,
            dropped: Arc::clone(&dropped),
            waker: None,
        },
        ChunkReceiver { consumer, dropped },
    )
}

/// Producer side, lives in the device callback
pub struct ChunkSender {
    producer: HeapProd<AudioChunk>,
    dropped: Arc<AtomicUsize>,
    waker: Option<Thread>,
}

impl ChunkSender {
    /// Thread to unpark after each posted chunk
    pub fn set_waker(&mut self, thread: Thread) {
        self.waker = Some(thread);
    }

    /// Post a completed chunk. Returns false if the queue was full.
    pub fn post(&mut self, chunk: AudioChunk) -> bool {
        let posted = match self.producer.try_push(chunk) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        };

        if let Some(waker) = &self.waker {
            waker.unpark();
        }

        posted
    }
}

/// Consumer side, lives on the device thread
pub struct ChunkReceiver {
    consumer: HeapCons<AudioChunk>,
    dropped: Arc<AtomicUsize>,
}

impl ChunkReceiver {
    pub fn try_recv(&mut self) -> Option<AudioChunk> {
        self.consumer.try_pop()
    }

    /// Chunks waiting to be delivered
    pub fn available(&self) -> usize {
        self.consumer.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }

    /// Total chunks dropped because the queue was full
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(level: f32) -> AudioChunk {
        AudioChunk {
            samples: vec![0; 4],
            level,
        }
    }

    #[test]
    fn test_handoff_preserves_order() {
        let (mut tx, mut rx) = chunk_handoff(8);
        for i in 0..5 {
            assert!(tx.post(chunk(i as f32 / 10.0)));
        }
        assert_eq!(rx.available(), 5);

        let levels: Vec<f32> = std::iter::from_fn(|| rx.try_recv()).map(|c| c.level).collect();
        assert_eq!(levels, vec![0.0, 0.1, 0.2, 0.3, 0.4]);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let (mut tx, mut rx) = chunk_handoff(2);
        assert!(tx.post(chunk(0.1)));
        assert!(tx.post(chunk(0.2)));
        assert!(!tx.post(chunk(0.3)));
        assert_eq!(rx.dropped(), 1);

        assert_eq!(rx.try_recv().map(|c| c.level), Some(0.1));
        assert!(tx.post(chunk(0.4)));
        assert_eq!(rx.available(), 2);
    }

    #[test]
    fn test_cross_thread_delivery() {
        let (mut tx, mut rx) = chunk_handoff(1024);
        let producer = std::thread::spawn(move || {
            for _ in 0..500 {
                tx.post(chunk(0.5));
            }
        });
        producer.join().unwrap();

        let mut received = 0;
        while rx.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, 500);
    }
}
