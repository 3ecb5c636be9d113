//! Byte-at-a-time H4+ frame reassembly.
//!
//! The parser never blocks: it is fed whatever the UART has ready and keeps
//! its cursor between calls, so a frame split across any number of receive
//! runs comes out identical to one delivered in a single burst.

use crate::constants::MAX_FRAME_SIZE;
use crate::error::FrameError;
use crate::packet::{Packet, PacketKind};
use bytes::BytesMut;
use strum_macros::Display;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RxState {
    AwaitingKind,
    AwaitingHeader,
    AwaitingBody,
    /// Consuming the body of a frame too large to keep
    Skipping,
}

/// Result of feeding one byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// Byte consumed, frame not complete yet
    Pending,
    /// Byte completed a frame
    Complete(Packet),
    /// Byte produced a framing error. After `UnknownKind` the cursor is back
    /// at `AwaitingKind`; after `TooLarge` it skips the declared body first.
    Error(FrameError),
}

/// Receive cursor plus the partially assembled frame.
#[derive(Debug)]
pub struct FrameParser {
    state: RxState,
    remaining: usize,
    kind: Option<PacketKind>,
    partial: BytesMut,
    capacity: usize,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameParser {
    /// `capacity` bounds header plus body of a single frame
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RxState::AwaitingKind,
            remaining: 0,
            kind: None,
            partial: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    /// Bytes still needed to finish the current header or body
    pub fn bytes_remaining(&self) -> usize {
        self.remaining
    }

    /// Kind of the frame being assembled, if any
    pub fn current_kind(&self) -> Option<PacketKind> {
        self.kind
    }

    /// True while a frame has been started but not completed
    pub fn has_partial(&self) -> bool {
        self.state != RxState::AwaitingKind
    }

    /// Bytes of the partial frame collected so far, indicator included
    pub fn partial_len(&self) -> usize {
        match self.state {
            RxState::AwaitingKind => 0,
            // Header already dropped, only the indicator is accounted for
            RxState::Skipping => 1,
            _ => self.partial.len() + 1,
        }
    }

    /// Drop any partial frame and wait for the next indicator byte
    pub fn discard(&mut self) {
        self.partial.clear();
        self.kind = None;
        self.remaining = 0;
        self.state = RxState::AwaitingKind;
    }

    pub fn push(&mut self, byte: u8) -> ParseEvent {
        match self.state {
            RxState::AwaitingKind => match PacketKind::try_from(byte) {
                Ok(kind) => {
                    self.kind = Some(kind);
                    self.partial.clear();
                    self.remaining = kind.header_len();
                    self.state = RxState::AwaitingHeader;
                    trace!(%kind, header_len = self.remaining, "rx frame start");
                    ParseEvent::Pending
                }
                Err(_) => {
                    warn!("Unknown H4 packet type {:#04x}", byte);
                    self.discard();
                    ParseEvent::Error(FrameError::UnknownKind(byte))
                }
            },
            RxState::AwaitingHeader => {
                self.partial.extend_from_slice(&[byte]);
                self.remaining -= 1;
                if self.remaining > 0 {
                    return ParseEvent::Pending;
                }
                self.header_complete()
            }
            RxState::AwaitingBody => {
                self.partial.extend_from_slice(&[byte]);
                self.remaining -= 1;
                if self.remaining > 0 {
                    return ParseEvent::Pending;
                }
                self.finish()
            }
            RxState::Skipping => {
                self.remaining -= 1;
                if self.remaining == 0 {
                    trace!(kind = ?self.kind, "oversized frame skipped");
                    self.discard();
                }
                ParseEvent::Pending
            }
        }
    }

    /// Feed a whole slice, collecting every event that is not `Pending`
    pub fn push_slice(&mut self, bytes: &[u8]) -> Vec<Result<Packet, FrameError>> {
        bytes
            .iter()
            .filter_map(|&b| match self.push(b) {
                ParseEvent::Pending => None,
                ParseEvent::Complete(packet) => Some(Ok(packet)),
                ParseEvent::Error(e) => Some(Err(e)),
            })
            .collect()
    }

    fn header_complete(&mut self) -> ParseEvent {
        let Some(kind) = self.kind else {
            self.discard();
            return ParseEvent::Pending;
        };
        let declared = kind.body_len(&self.partial);
        let capacity = self.capacity.saturating_sub(self.partial.len());
        if declared > capacity {
            warn!(%kind, declared, capacity, "Frame too long, skipping its body");
            self.partial.clear();
            self.remaining = declared;
            self.state = RxState::Skipping;
            return ParseEvent::Error(FrameError::TooLarge {
                kind,
                declared,
                capacity,
            });
        }
        if declared == 0 {
            return self.finish();
        }
        self.remaining = declared;
        self.state = RxState::AwaitingBody;
        ParseEvent::Pending
    }

    fn finish(&mut self) -> ParseEvent {
        let Some(kind) = self.kind.take() else {
            self.discard();
            return ParseEvent::Pending;
        };
        let data = self.partial.split().freeze();
        self.state = RxState::AwaitingKind;
        self.remaining = 0;
        trace!(%kind, len = data.len() + 1, "rx frame done");
        ParseEvent::Complete(Packet::new(kind, data))
    }
}
