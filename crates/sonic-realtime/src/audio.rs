//! Audio Buffer
//!
//! Audio chunks arrive from the caller at its own pace, often before the
//! audio content block has been opened. They are held in a bounded buffer
//! that drops the oldest chunk on overflow and are drained in batches once
//! the protocol allows audio input.

use crate::queue::wait_closed;
use crate::session::Session;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct AudioBuffer {
    chunks: VecDeque<Bytes>,
    capacity: usize,
    dropped: u64,
}

impl AudioBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Appends a chunk, discarding the oldest one if the buffer is full.
    /// Returns true when a chunk was dropped.
    pub fn push(&mut self, chunk: Bytes) -> bool {
        let overflowed = self.chunks.len() >= self.capacity;
        if overflowed {
            self.chunks.pop_front();
            self.dropped += 1;
            warn!(
                capacity = self.capacity,
                dropped_total = self.dropped,
                "Audio buffer full, dropped oldest chunk"
            );
        }
        self.chunks.push_back(chunk);
        overflowed
    }

    /// Removes up to `max` chunks from the front.
    pub fn take_batch(&mut self, max: usize) -> Vec<Bytes> {
        let n = max.min(self.chunks.len());
        self.chunks.drain(..n).collect()
    }

    pub fn take_all(&mut self) -> Vec<Bytes> {
        self.chunks.drain(..).collect()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.chunks.len();
        self.chunks.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Outcome of one drain attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flush {
    /// Nothing buffered.
    Empty,
    /// This many chunks were enqueued as audio input.
    Flushed(usize),
    /// Audio content has not started yet; try again shortly.
    Deferred,
    /// Audio content already ended; this many late chunks were thrown away.
    Discarded(usize),
    /// The session is no longer active.
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DrainSettings {
    pub batch_size: usize,
    pub backoff: Duration,
}

/// Drains the session's audio buffer into its outbound queue until the
/// session closes.
pub(crate) async fn drain_audio(session: Arc<Session>, settings: DrainSettings) {
    let mut closed = session.queue.subscribe_closed();
    loop {
        match session.flush_audio(settings.batch_size) {
            Flush::Flushed(n) => {
                debug!(chunks = n, "Flushed audio batch");
                tokio::task::yield_now().await;
            }
            Flush::Discarded(n) => {
                debug!(chunks = n, "Discarded audio received after content end");
            }
            Flush::Empty => {
                tokio::select! {
                    _ = session.audio_ready.notified() => {}
                    _ = wait_closed(&mut closed) => break,
                }
            }
            Flush::Deferred => {
                tokio::select! {
                    _ = tokio::time::sleep(settings.backoff) => {}
                    _ = wait_closed(&mut closed) => break,
                }
            }
            Flush::Closed => break,
        }
    }
    debug!("Audio drain loop finished");
}
