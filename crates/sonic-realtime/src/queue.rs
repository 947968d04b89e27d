//! Outbound Queue
//!
//! A per-session FIFO of pending protocol messages. Producers push without
//! blocking; the transport's pull loop awaits `next()`, which suspends on the
//! wake signal while the queue is empty and returns `None` once the queue has
//! been closed and drained.

use crate::codec::OutboundEvent;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::{Notify, watch};

pub struct OutboundQueue {
    pending: Mutex<VecDeque<OutboundEvent>>,
    wake: Notify,
    closed: watch::Sender<bool>,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundQueue {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            pending: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            closed,
        }
    }

    /// Appends several events with no other producer interleaving between them.
    pub fn push_all<I>(&self, events: I)
    where
        I: IntoIterator<Item = OutboundEvent>,
    {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.extend(events);
        let pushed = pending.len() > before;
        drop(pending);
        if pushed {
            self.wake.notify_one();
        }
    }

    /// Pops the oldest event without waiting.
    pub fn try_pop(&self) -> Option<OutboundEvent> {
        self.pending.lock().pop_front()
    }

    /// Ends the stream once whatever is already queued has been pulled.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Ends the stream immediately, discarding anything still queued.
    /// Returns the number of discarded events.
    pub fn abort(&self) -> usize {
        let discarded = {
            let mut pending = self.pending.lock();
            let n = pending.len();
            pending.clear();
            n
        };
        self.closed.send_replace(true);
        discarded
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// A receiver that observes the close signal.
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Pops the oldest event, waiting for one if the queue is empty.
    ///
    /// Returns `None` when the queue is closed and nothing is left to pull.
    pub async fn next(&self) -> Option<OutboundEvent> {
        let mut closed = self.closed.subscribe();
        loop {
            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            if *closed.borrow_and_update() {
                return None;
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = closed.changed() => {}
            }
        }
    }
}

/// Resolves once `closed` reads true.
pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // Sender dropped: the session is gone.
    let _ = closed.wait_for(|is_closed| *is_closed).await;
}
