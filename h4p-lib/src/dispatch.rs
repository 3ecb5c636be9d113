use crate::channel::HostStack;
use crate::packet::{Packet, PacketKind};
use crate::stats::Stats;
use crate::waiter::{HandshakeSlot, Offer};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// Where a completed frame ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Bring-up handshake waiter
    Handshake,
    /// Liveness probe waiter
    Probe,
    Host,
    Dropped,
}

/// Routes every completed frame to exactly one consumer.
///
/// Before the link is running frames belong to the bring-up handshake; after
/// that everything goes to the host except alive checks, which stay internal.
pub struct Dispatcher {
    running: AtomicBool,
    handshake: HandshakeSlot,
    probe: HandshakeSlot,
    host: Arc<dyn HostStack>,
    stats: Arc<Stats>,
}

impl Dispatcher {
    pub fn new(host: Arc<dyn HostStack>, stats: Arc<Stats>) -> Self {
        Self {
            running: AtomicBool::new(false),
            handshake: HandshakeSlot::new(),
            probe: HandshakeSlot::new(),
            host,
            stats,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn handshake(&self) -> &HandshakeSlot {
        &self.handshake
    }

    pub fn probe(&self) -> &HandshakeSlot {
        &self.probe
    }

    pub fn host(&self) -> &Arc<dyn HostStack> {
        &self.host
    }

    pub fn dispatch(&self, packet: Packet) -> Route {
        let kind = packet.kind();
        self.stats.received(kind);

        if !self.is_running() {
            return match self.handshake.offer(packet) {
                Offer::Consumed | Offer::Rejected => Route::Handshake,
                Offer::NotAwaited(packet) => {
                    debug!(%packet, "Unexpected frame during bring-up, dropped");
                    self.stats.dropped();
                    Route::Dropped
                }
            };
        }

        if kind == PacketKind::AliveCheck {
            return match self.probe.offer(packet) {
                Offer::Consumed | Offer::Rejected => Route::Probe,
                Offer::NotAwaited(packet) => {
                    debug!(%packet, "Unsolicited alive packet");
                    self.stats.dropped();
                    Route::Dropped
                }
            };
        }

        trace!(%kind, len = packet.wire_len(), "Frame sent to upper layer");
        self.host.deliver_packet(packet);
        Route::Host
    }
}
