//! Seams to the outside world: the UART register layer, the controller reset
//! line and the host Bluetooth stack.

use crate::packet::Packet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum_macros::Display;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum Direction {
    Rx,
    Tx,
}

/// Interrupt causes the UART can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum InterruptSource {
    /// Receive FIFO holds data
    DataReady,
    /// Character timeout with data still in the receive FIFO
    RxTimeout,
    /// Transmit FIFO has room again
    TransmitReady,
    /// Line status change (overrun, framing, break)
    LineStatus,
    /// Modem status change (CTS/DSR)
    ModemStatus,
    /// Controller raised its host-wakeup line
    HostWakeup,
}

/// Maskable interrupt enables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum InterruptEnable {
    DataReady,
    TransmitReady,
}

/// Which hardware handshake signals auto flow control drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlowSignals {
    pub cts: bool,
    pub rts: bool,
}

impl FlowSignals {
    pub const BOTH: FlowSignals = FlowSignals { cts: true, rts: true };
    pub const RTS: FlowSignals = FlowSignals { cts: false, rts: true };
}

pub type InterruptHandler = Arc<dyn Fn(InterruptSource) + Send + Sync>;

/// Raw serial device driven by the transport.
///
/// Implementations model a register interface: every call is expected to be
/// cheap and non-blocking. The transport serialises all calls behind one lock,
/// so `&mut self` is exclusive access to the registers.
pub trait ByteChannel: Send + 'static {
    /// Next received byte, if the receive FIFO has one
    fn read_byte(&mut self) -> Option<u8>;

    /// Queue one byte for transmission; `false` if the FIFO is full
    fn write_byte(&mut self, byte: u8) -> bool;

    fn data_ready(&self) -> bool;

    /// Transmit FIFO can take at least one more byte
    fn transmit_ready(&self) -> bool;

    /// Transmit FIFO and shift register are both empty
    fn transmitter_empty(&self) -> bool;

    /// Put the UART back into its power-on configuration
    fn reset(&mut self);

    fn set_baud(&mut self, rate: u32);

    fn set_flow_control(&mut self, enabled: bool, signals: FlowSignals);

    /// Manual RTS level, effective while auto RTS is off
    fn set_rts(&mut self, asserted: bool);

    fn cts_asserted(&self) -> bool;

    fn set_interrupt_enabled(&mut self, source: InterruptEnable, enabled: bool);

    /// Gate or ungate the clock domain serving one direction
    fn set_clock(&mut self, direction: Direction, enabled: bool);

    fn register_interrupt(&mut self, handler: InterruptHandler);
}

/// Controller reset GPIO
pub trait ResetLine: Send + Sync {
    fn set_reset(&self, asserted: bool);
}

/// Consumer of received frames once the link is running.
pub trait HostStack: Send + Sync {
    fn deliver_packet(&self, packet: Packet);

    /// Bring-up finished; the host may start sending.
    fn link_up(&self) {}

    fn link_down(&self) {}
}

/// Host side events surfaced by [`ChannelHost`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Packet(Packet),
    LinkUp,
    LinkDown,
}

/// `HostStack` that forwards everything into an mpsc channel
pub struct ChannelHost {
    tx: mpsc::UnboundedSender<HostEvent>,
}

impl ChannelHost {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<HostEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl HostStack for ChannelHost {
    fn deliver_packet(&self, packet: Packet) {
        // Receiver gone means the host shut down; nothing left to deliver to.
        let _ = self.tx.send(HostEvent::Packet(packet));
    }

    fn link_up(&self) {
        let _ = self.tx.send(HostEvent::LinkUp);
    }

    fn link_down(&self) {
        let _ = self.tx.send(HostEvent::LinkDown);
    }
}

/// Shared, lock-guarded register interface of one channel
pub type Registers<C> = Arc<parking_lot::Mutex<C>>;
