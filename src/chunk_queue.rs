use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use tokio::sync::Notify;
use uuid::Uuid;

/// One bounded unit of captured audio awaiting send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Utterance the chunk was captured for
    pub session_id: Uuid,
    pub chunk_id: u64,
    /// Little-endian 16-bit PCM
    pub pcm: Vec<u8>,
    pub is_final: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; the oldest non-final chunk made room
    EvictedOldest { evicted_chunk_id: u64 },
    /// Queue was full of chunks that may not be evicted; the new non-final chunk was dropped
    DroppedIncoming,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: u64,
    pub evicted: u64,
    pub dropped: u64,
}

/// Outbound chunk queue favouring recency: when full, the oldest non-final chunk is
/// evicted. A final chunk is never evicted and is always accepted.
#[derive(Debug)]
pub struct ChunkQueue {
    chunks: VecDeque<AudioChunk>,
    capacity: usize,
    stats: QueueStats,
}

impl ChunkQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: VecDeque::with_capacity(capacity + 1),
            capacity,
            stats: QueueStats::default(),
        }
    }

    pub fn push(&mut self, chunk: AudioChunk) -> PushOutcome {
        let mut outcome = PushOutcome::Queued;

        if self.chunks.len() >= self.capacity {
            match self.chunks.iter().position(|c| !c.is_final) {
                Some(index) => {
                    // position() found it, so remove() cannot miss
                    if let Some(evicted) = self.chunks.remove(index) {
                        self.stats.evicted += 1;
                        debug!("Outbound queue full: evicted chunk {}", evicted.chunk_id);
                        outcome = PushOutcome::EvictedOldest {
                            evicted_chunk_id: evicted.chunk_id,
                        };
                    }
                }
                None if !chunk.is_final => {
                    self.stats.dropped += 1;
                    warn!("Outbound queue full of final chunks; dropping chunk {}", chunk.chunk_id);
                    return PushOutcome::DroppedIncoming;
                }
                None => {}
            }
        }

        self.chunks.push_back(chunk);
        self.stats.queued += 1;
        outcome
    }

    pub fn pop(&mut self) -> Option<AudioChunk> {
        self.chunks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    pub fn chunk_ids(&self) -> Vec<u64> {
        self.chunks.iter().map(|c| c.chunk_id).collect()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

/// [`ChunkQueue`] shared between the capture side (never blocks) and the async sender.
pub struct SharedChunkQueue {
    queue: Mutex<ChunkQueue>,
    available: Notify,
    closed: AtomicBool,
}

impl SharedChunkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(ChunkQueue::new(capacity)),
            available: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Non-blocking beyond a short critical section; safe to call from the capture path.
    pub fn push(&self, chunk: AudioChunk) -> PushOutcome {
        let outcome = match self.queue.lock() {
            Ok(mut queue) => queue.push(chunk),
            Err(_) => return PushOutcome::DroppedIncoming,
        };
        self.available.notify_one();
        outcome
    }

    /// Wait for the next chunk; `None` once closed and drained.
    pub async fn pop(&self) -> Option<AudioChunk> {
        loop {
            if let Ok(mut queue) = self.queue.lock() {
                if let Some(chunk) = queue.pop() {
                    return Some(chunk);
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.available.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<AudioChunk> {
        self.queue.lock().ok().and_then(|mut q| q.pop())
    }

    /// Stop accepting waits; pending chunks can still be drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_waiters();
        self.available.notify_one();
    }

    pub fn reopen(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.lock().map(|q| q.stats()).unwrap_or_default()
    }
}
