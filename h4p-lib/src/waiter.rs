//! Single-slot handshake synchronisation.
//!
//! The bring-up sequencer arms the slot with the reply it expects and a
//! deadline, then awaits the returned [`Waiter`]. The receive path offers
//! every completed frame to the slot; the first frame that matches fulfils the
//! waiter exactly once. Frames arriving after the deadline find the slot empty
//! and are reported back as not awaited.

use crate::constants::{ALIVE_MARKER, SPEED_CHANGE_OPCODE};
use crate::error::HandshakeError;
use crate::packet::{Packet, PacketKind};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

/// Reply the armed waiter is looking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// Alive check carrying the marker byte, or Command Complete for the
    /// vendor speed change opcode
    SpeedChange,
    /// Alive check with the given message id
    Alive(u8),
    /// Command Complete for a firmware command; `None` accepts any opcode
    CommandComplete { opcode: Option<u16> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
    Ignore,
}

impl Expected {
    pub fn judge(&self, packet: &Packet) -> Verdict {
        match self {
            Expected::SpeedChange => {
                if packet.alive_message_id() == Some(ALIVE_MARKER) {
                    return Verdict::Accept;
                }
                match packet.command_complete() {
                    Some(cc) if cc.opcode == SPEED_CHANGE_OPCODE => Verdict::Accept,
                    _ => Verdict::Ignore,
                }
            }
            Expected::Alive(id) => {
                if packet.alive_message_id() == Some(*id) {
                    Verdict::Accept
                } else {
                    Verdict::Ignore
                }
            }
            Expected::CommandComplete { opcode } => match packet.kind() {
                // Neither answers a firmware command; left for the dispatcher to drop
                PacketKind::AliveCheck | PacketKind::Negotiation => Verdict::Ignore,
                PacketKind::Event => {
                    let Some(cc) = packet.command_complete() else {
                        return Verdict::Reject("non command complete event".to_string());
                    };
                    if cc.opcode == SPEED_CHANGE_OPCODE {
                        // Late speed change ack, belongs to an earlier step
                        return Verdict::Ignore;
                    }
                    if opcode.is_some_and(|op| op != cc.opcode) {
                        return Verdict::Ignore;
                    }
                    if !cc.is_success() {
                        return Verdict::Reject(format!(
                            "opcode {:#06x} failed with status {:#04x}",
                            cc.opcode, cc.status
                        ));
                    }
                    Verdict::Accept
                }
                kind => Verdict::Reject(format!("non event packet ({})", kind)),
            },
        }
    }
}

/// What happened to a frame offered to the slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offer {
    /// Matched and handed to the waiter
    Consumed,
    /// Matched the step but reported failure; waiter fulfilled with an error
    Rejected,
    /// Nobody is waiting for this frame
    NotAwaited(Packet),
}

type Reply = Result<Packet, HandshakeError>;

struct Armed {
    expected: Expected,
    generation: u64,
    reply: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct SlotInner {
    armed: Option<Armed>,
    generation: u64,
    closed: bool,
}

#[derive(Default)]
pub struct HandshakeSlot {
    inner: Mutex<SlotInner>,
}

impl HandshakeSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the slot. The deadline starts now, so arm before enqueueing the
    /// request whose reply is awaited.
    pub fn arm(&self, expected: Expected, timeout: Duration) -> Waiter<'_> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        inner.generation = inner.generation.wrapping_add(1);
        let generation = inner.generation;

        if let Some(previous) = inner.armed.take() {
            warn!(expected = ?previous.expected, "Replacing armed handshake waiter");
            let _ = previous.reply.send(Err(HandshakeError::Cancelled));
        }

        if inner.closed {
            let _ = tx.send(Err(HandshakeError::Cancelled));
        } else {
            inner.armed = Some(Armed {
                expected,
                generation,
                reply: tx,
            });
        }

        Waiter {
            slot: self,
            generation,
            deadline: Instant::now() + timeout,
            reply: rx,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.inner.lock().armed.is_some()
    }

    pub fn offer(&self, packet: Packet) -> Offer {
        let mut inner = self.inner.lock();
        let verdict = match &inner.armed {
            Some(armed) => armed.expected.judge(&packet),
            None => return Offer::NotAwaited(packet),
        };
        let result = match verdict {
            Verdict::Ignore => return Offer::NotAwaited(packet),
            Verdict::Accept => Ok(packet.clone()),
            Verdict::Reject(reason) => Err(HandshakeError::Rejected(reason)),
        };
        let Some(armed) = inner.armed.take() else {
            return Offer::NotAwaited(packet);
        };
        let rejected = result.is_err();
        if armed.reply.send(result).is_err() {
            // Waiter already gave up
            debug!("Handshake reply arrived after its waiter was dropped");
            return Offer::NotAwaited(packet);
        }
        if rejected { Offer::Rejected } else { Offer::Consumed }
    }

    /// Fulfil the armed waiter (if any) with `Cancelled`
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        if let Some(armed) = inner.armed.take() {
            debug!(expected = ?armed.expected, "Cancelling handshake waiter");
            let _ = armed.reply.send(Err(HandshakeError::Cancelled));
        }
    }

    /// Cancel and refuse further waits until [`HandshakeSlot::reopen`]
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.cancel();
    }

    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    fn disarm(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.armed.as_ref().is_some_and(|a| a.generation == generation) {
            inner.armed = None;
        }
    }
}

/// Pending handshake; resolves once with the reply, a timeout or cancellation.
pub struct Waiter<'a> {
    slot: &'a HandshakeSlot,
    generation: u64,
    deadline: Instant,
    reply: oneshot::Receiver<Reply>,
}

impl Waiter<'_> {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub async fn wait(mut self) -> Result<Packet, HandshakeError> {
        match timeout_at(self.deadline, &mut self.reply).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(HandshakeError::Cancelled),
            Err(_) => Err(HandshakeError::Timeout),
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.slot.disarm(self.generation);
    }
}
