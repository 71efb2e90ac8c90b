//! Single-entry, drop-oldest frame mailbox.
//!
//! The producer never waits for the consumer. A frame submitted while another
//! is pending replaces it, and a frame submitted while another is being
//! processed marks the in-flight one as superseded.

use crate::sync::lock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

struct SlotState<F> {
    pending: Option<(u64, F)>,
    closed: bool,
}

pub struct FrameSlot<F> {
    state: Mutex<SlotState<F>>,
    ready: Condvar,
    /// Sequence number of the newest accepted frame.
    latest: Arc<AtomicU64>,
    dropped: AtomicU64,
}

/// Identifies one taken frame and tells whether a newer one has arrived since.
#[derive(Debug, Clone)]
pub struct FrameTicket {
    seq: u64,
    latest: Arc<AtomicU64>,
}

impl FrameTicket {
    /// A ticket that is never superseded, for frames processed outside a slot.
    pub fn detached() -> Self {
        Self {
            seq: 0,
            latest: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_superseded(&self) -> bool {
        self.latest.load(Ordering::SeqCst) != self.seq
    }
}

impl<F> FrameSlot<F> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                pending: None,
                closed: false,
            }),
            ready: Condvar::new(),
            latest: Arc::new(AtomicU64::new(0)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Accept a frame, discarding any frame still waiting. Returns its sequence number,
    /// or `None` once the slot is closed.
    pub fn submit(&self, frame: F) -> Option<u64> {
        let mut state = lock(&self.state);
        if state.closed {
            return None;
        }
        let seq = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((old, _)) = state.pending.replace((seq, frame)) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(dropped_seq = old, seq, dropped, "frame dropped before processing");
        }
        drop(state);
        self.ready.notify_one();
        Some(seq)
    }

    /// Block until a frame is pending or the slot is closed.
    ///
    /// Returns `None` once closed; a frame still pending at close is discarded.
    pub fn take(&self) -> Option<(F, FrameTicket)> {
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return None;
            }
            if let Some((seq, frame)) = state.pending.take() {
                let ticket = FrameTicket {
                    seq,
                    latest: Arc::clone(&self.latest),
                };
                return Some((frame, ticket));
            }
            state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking variant of [`take`](Self::take).
    pub fn try_take(&self) -> Option<(F, FrameTicket)> {
        let mut state = lock(&self.state);
        let (seq, frame) = state.pending.take()?;
        Some((
            frame,
            FrameTicket {
                seq,
                latest: Arc::clone(&self.latest),
            },
        ))
    }

    /// Wake the consumer and refuse further frames.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Frames replaced before the consumer got to them.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn latest_seq(&self) -> u64 {
        self.latest.load(Ordering::SeqCst)
    }
}

impl<F> Default for FrameSlot<F> {
    fn default() -> Self {
        Self::new()
    }
}
