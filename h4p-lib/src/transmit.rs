//! Outbound queue and the pump that drains it into the UART.

use crate::channel::{ByteChannel, InterruptEnable};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::trace;

#[derive(Default)]
struct QueueInner {
    frames: VecDeque<Bytes>,
    /// Head frame is the unsent remainder of a partially written frame
    head_partial: bool,
}

/// FIFO of encoded frames awaiting transmission
#[derive(Default)]
pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&self, frame: Bytes) {
        self.inner.lock().frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    /// True when the next write continues a frame rather than starting one
    pub fn head_is_partial(&self) -> bool {
        self.inner.lock().head_partial
    }

    /// Drop everything queued; returns how many frames were discarded
    pub fn purge(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.frames.len();
        inner.frames.clear();
        inner.head_partial = false;
        n
    }

    fn pop_front(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        inner.head_partial = false;
        inner.frames.pop_front()
    }

    fn push_front_remainder(&self, rest: Bytes) {
        let mut inner = self.inner.lock();
        inner.frames.push_front(rest);
        inner.head_partial = true;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpOutcome {
    pub bytes_written: usize,
    pub frames_completed: usize,
    /// Queue is empty after this run
    pub drained: bool,
}

/// Write queued frames while the transmitter accepts bytes.
///
/// A frame cut short by a full FIFO goes back to the head of the queue and
/// the transmit-ready interrupt is enabled so the next run resumes it. When
/// the queue drains the interrupt is switched off again.
pub fn pump<C: ByteChannel + ?Sized>(regs: &mut C, queue: &OutboundQueue) -> PumpOutcome {
    let mut outcome = PumpOutcome::default();

    while let Some(frame) = queue.pop_front() {
        let mut sent = 0;
        while sent < frame.len() && regs.transmit_ready() {
            if !regs.write_byte(frame[sent]) {
                break;
            }
            sent += 1;
        }
        outcome.bytes_written += sent;

        if sent < frame.len() {
            trace!(sent, left = frame.len() - sent, "tx fifo full, frame suspended");
            queue.push_front_remainder(frame.slice(sent..));
            break;
        }
        trace!(bytes = hex::encode(&frame), "UART write");
        outcome.frames_completed += 1;
    }

    outcome.drained = queue.is_empty();
    regs.set_interrupt_enabled(InterruptEnable::TransmitReady, !outcome.drained);
    outcome
}
