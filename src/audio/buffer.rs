//! Lock-free chunk queue between the audio side and the socket
//!
//! Chunks are opaque byte spans kept exactly as pushed: never split, merged
//! or reordered. The queue is unbounded unless a limit is given, in which
//! case the oldest chunk is dropped to make room.

use bytes::Bytes;
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// FIFO of audio chunks shared between threads
pub struct ChunkQueue {
    queue: SegQueue<Bytes>,
    limit: Option<usize>,
    chunks_pushed: AtomicUsize,
    bytes_pushed: AtomicUsize,
    overflow_count: AtomicUsize,
    empty_polls: AtomicUsize,
}

impl ChunkQueue {
    /// Create an unbounded queue
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    /// Create a queue that holds at most `limit` chunks
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            queue: SegQueue::new(),
            limit,
            chunks_pushed: AtomicUsize::new(0),
            bytes_pushed: AtomicUsize::new(0),
            overflow_count: AtomicUsize::new(0),
            empty_polls: AtomicUsize::new(0),
        }
    }

    /// Append a chunk. Never blocks.
    pub fn push(&self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if let Some(limit) = self.limit {
            while self.queue.len() >= limit {
                if self.queue.pop().is_none() {
                    break;
                }
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.chunks_pushed.fetch_add(1, Ordering::Relaxed);
        self.bytes_pushed.fetch_add(chunk.len(), Ordering::Relaxed);
        self.queue.push(chunk);
    }

    /// Take the oldest chunk, counting an empty poll when there is none.
    /// Used by the consumer that polls the queue in a loop.
    pub fn pop(&self) -> Option<Bytes> {
        match self.queue.pop() {
            Some(chunk) => Some(chunk),
            None => {
                self.empty_polls.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Take the oldest chunk without counting an empty poll, for draining
    /// whatever is there
    pub fn try_pop(&self) -> Option<Bytes> {
        self.queue.pop()
    }

    /// Discard everything queued, returning how many chunks were dropped
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of chunks waiting
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Get queue statistics
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.queue.len(),
            chunks_pushed: self.chunks_pushed.load(Ordering::Relaxed),
            bytes_pushed: self.bytes_pushed.load(Ordering::Relaxed),
            overflow_count: self.overflow_count.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
        }
    }
}

impl Default for ChunkQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub queued: usize,
    pub chunks_pushed: usize,
    pub bytes_pushed: usize,
    /// Chunks dropped to stay within the bound
    pub overflow_count: usize,
    /// Polls by the consumer that found nothing queued
    pub empty_polls: usize,
}

/// Thread-safe handle to a chunk queue
pub type SharedChunkQueue = Arc<ChunkQueue>;

/// The two directions of audio moving through the link.
///
/// Created once per process and handed to the supervisor and to whatever
/// captures or plays audio. Cloning shares the same queues.
#[derive(Clone, Default)]
pub struct AudioChannels {
    /// Capture side pushes, the fill loop sends to the peer
    pub outgoing: SharedChunkQueue,
    /// The drain loop pushes what the peer sent, the playback side pops
    pub incoming: SharedChunkQueue,
}

impl AudioChannels {
    /// Two unbounded queues
    pub fn new() -> Self {
        Self::default()
    }

    /// Two queues sharing the same optional bound
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            outgoing: Arc::new(ChunkQueue::with_limit(limit)),
            incoming: Arc::new(ChunkQueue::with_limit(limit)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_chunk_queue_basic() {
        let queue = ChunkQueue::new();

        queue.push(vec![1u8, 2, 3]);
        queue.push(Bytes::from_static(&[4, 5]));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop().unwrap(), Bytes::from_static(&[1, 2, 3]));
        assert_eq!(queue.pop().unwrap(), Bytes::from_static(&[4, 5]));
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());

        let stats = queue.stats();
        assert_eq!(stats.chunks_pushed, 2);
        assert_eq!(stats.bytes_pushed, 5);
        assert_eq!(stats.empty_polls, 1);
    }

    #[test]
    fn test_limit_drops_oldest() {
        let queue = ChunkQueue::with_limit(Some(2));
        for i in 0u8..4 {
            queue.push(vec![i]);
        }

        assert_eq!(queue.stats().overflow_count, 2);
        assert_eq!(queue.try_pop().unwrap()[0], 2);
        assert_eq!(queue.try_pop().unwrap()[0], 3);
    }

    #[test]
    fn test_clear_keeps_queue_usable() {
        let queue = ChunkQueue::new();
        queue.push(vec![0u8; 16]);
        queue.push(vec![0u8; 16]);
        assert_eq!(queue.clear(), 2);

        queue.push(vec![7u8]);
        assert_eq!(queue.try_pop().unwrap()[0], 7);
    }

    #[test]
    fn test_concurrent_producer_keeps_order() {
        let queue = Arc::new(ChunkQueue::new());
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0u32..1000 {
                    queue.push(i.to_be_bytes().to_vec());
                }
            })
        };

        let mut expected = 0u32;
        while expected < 1000 {
            if let Some(chunk) = queue.try_pop() {
                let value = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                assert_eq!(value, expected);
                expected += 1;
            }
        }
        producer.join().unwrap();
    }

    proptest! {
        #[test]
        fn prop_chunks_come_out_unchanged(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..32)) {
            let queue = ChunkQueue::new();
            for chunk in &chunks {
                queue.push(chunk.clone());
            }
            for chunk in &chunks {
                let popped = queue.try_pop().unwrap();
                prop_assert_eq!(&popped[..], &chunk[..]);
            }
            prop_assert!(queue.try_pop().is_none());
        }
    }
}
