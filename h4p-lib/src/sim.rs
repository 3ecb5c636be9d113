//! In-memory UART and controller model.
//!
//! [`SimChannel`] is the register side handed to the transport;
//! [`SimController`] is the other end of the wire. It sees every byte the
//! transport writes, answers through a [`Responder`], drives CTS and
//! implements the reset line. Interrupts are raised the way a level-triggered
//! UART would raise them, always after the model's own lock is released.

use crate::channel::{
    ByteChannel, Direction, FlowSignals, InterruptEnable, InterruptHandler, InterruptSource, ResetLine,
};
use crate::constants::{ALIVE_MARKER, ALIVE_REQUEST, DEFAULT_BAUD, SPEED_CHANGE_OPCODE, STATUS_SUCCESS};
use crate::packet::{Packet, PacketKind};
use crate::parser::{FrameParser, ParseEvent};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Transmit FIFO depth in bytes
    pub tx_fifo_depth: usize,
    /// Controller consumes written bytes immediately. When off, bytes sit in
    /// the FIFO until [`SimController::drain_tx`].
    pub auto_drain: bool,
    /// CTS rises this long after reset is released; `None` never
    pub cts_after_reset: Option<Duration>,
    /// CTS stays up across a baud rate change
    pub cts_after_speed_change: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tx_fifo_depth: 64,
            auto_drain: true,
            cts_after_reset: Some(Duration::from_millis(5)),
            cts_after_speed_change: true,
        }
    }
}

/// Bytes the controller sends back, optionally after a delay
#[derive(Debug, Clone)]
pub struct Reply {
    pub delay: Duration,
    pub bytes: Bytes,
}

impl Reply {
    pub fn now(packet: Packet) -> Self {
        Self::after(Duration::ZERO, packet)
    }

    pub fn after(delay: Duration, packet: Packet) -> Self {
        Self {
            delay,
            bytes: packet.encode(),
        }
    }

    pub fn raw(delay: Duration, bytes: impl Into<Bytes>) -> Self {
        Self {
            delay,
            bytes: bytes.into(),
        }
    }
}

/// Controller behaviour: called for every complete frame the host sends.
pub trait Responder: Send {
    fn respond(&mut self, frame: &Packet) -> Vec<Reply>;
}

impl<F> Responder for F
where
    F: FnMut(&Packet) -> Vec<Reply> + Send,
{
    fn respond(&mut self, frame: &Packet) -> Vec<Reply> {
        self(frame)
    }
}

/// A controller that follows the protocol, with knobs for misbehaving.
#[derive(Debug, Clone)]
pub struct ScriptedChip {
    /// Ignore this many speed change requests before answering
    pub drop_speed_acks: u32,
    pub speed_ack_delay: Duration,
    /// Answer the speed change with a Command Complete instead of the alive
    /// marker; carries the status to report
    pub speed_ack_status: Option<u8>,
    pub command_ack_delay: Duration,
    /// Fail this opcode with the given status
    pub fail_opcode: Option<(u16, u8)>,
    /// Swallow everything
    pub silent: bool,
    pub speed_requests: u32,
}

impl Default for ScriptedChip {
    fn default() -> Self {
        Self {
            drop_speed_acks: 0,
            speed_ack_delay: Duration::from_millis(1),
            speed_ack_status: None,
            command_ack_delay: Duration::from_millis(1),
            fail_opcode: None,
            silent: false,
            speed_requests: 0,
        }
    }
}

impl ScriptedChip {
    pub fn new() -> Self {
        Self::default()
    }

    /// Speed change requests seen so far
    pub fn speed_requests(&self) -> u32 {
        self.speed_requests
    }
}

impl Responder for ScriptedChip {
    fn respond(&mut self, frame: &Packet) -> Vec<Reply> {
        if self.silent {
            return Vec::new();
        }
        match frame.kind() {
            PacketKind::AliveCheck if frame.alive_message_id() == Some(ALIVE_REQUEST) => {
                vec![Reply::after(self.command_ack_delay, Packet::alive(ALIVE_MARKER))]
            }
            PacketKind::Command => match frame.command_opcode() {
                Some(SPEED_CHANGE_OPCODE) => {
                    self.speed_requests += 1;
                    if self.speed_requests <= self.drop_speed_acks {
                        return Vec::new();
                    }
                    let reply = match self.speed_ack_status {
                        Some(status) => Packet::command_complete_event(SPEED_CHANGE_OPCODE, status),
                        None => Packet::alive(ALIVE_MARKER),
                    };
                    vec![Reply::after(self.speed_ack_delay, reply)]
                }
                Some(opcode) => {
                    let status = match self.fail_opcode {
                        Some((failing, status)) if failing == opcode => status,
                        _ => STATUS_SUCCESS,
                    };
                    vec![Reply::after(
                        self.command_ack_delay,
                        Packet::command_complete_event(opcode, status),
                    )]
                }
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }
}

struct SimState {
    config: SimConfig,
    rx: VecDeque<u8>,
    tx_fifo: VecDeque<u8>,
    wire: Vec<u8>,
    decoder: FrameParser,
    frames: Vec<Packet>,
    baud: u32,
    baud_log: Vec<u32>,
    flow: Option<FlowSignals>,
    rts: bool,
    cts: bool,
    irq_rx: bool,
    irq_tx: bool,
    clock_rx: bool,
    clock_tx: bool,
    clock_log: Vec<(Direction, bool)>,
    in_reset: bool,
    uart_resets: u32,
    responder: Option<Box<dyn Responder>>,
    pending_irqs: Vec<InterruptSource>,
    delayed: Vec<Reply>,
}

impl SimState {
    fn new(config: SimConfig) -> Self {
        Self {
            config,
            rx: VecDeque::new(),
            tx_fifo: VecDeque::new(),
            wire: Vec::new(),
            decoder: FrameParser::default(),
            frames: Vec::new(),
            baud: DEFAULT_BAUD,
            baud_log: Vec::new(),
            flow: None,
            rts: false,
            cts: false,
            irq_rx: false,
            irq_tx: false,
            clock_rx: false,
            clock_tx: false,
            clock_log: Vec::new(),
            in_reset: false,
            uart_resets: 0,
            responder: None,
            pending_irqs: Vec::new(),
            delayed: Vec::new(),
        }
    }

    fn rx_ready(&self) -> bool {
        self.clock_rx && !self.rx.is_empty()
    }

    fn tx_room(&self) -> bool {
        self.clock_tx && self.tx_fifo.len() < self.config.tx_fifo_depth
    }

    fn deliver(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
        if self.irq_rx && self.rx_ready() {
            self.pending_irqs.push(InterruptSource::DataReady);
        }
    }

    /// Move the transmit FIFO onto the wire and let the controller react
    fn drain(&mut self) -> usize {
        let bytes: Vec<u8> = self.tx_fifo.drain(..).collect();
        for &byte in &bytes {
            self.wire.push(byte);
            if let ParseEvent::Complete(frame) = self.decoder.push(byte) {
                trace!(%frame, "Controller received frame");
                let replies = match self.responder.as_mut() {
                    Some(responder) => responder.respond(&frame),
                    None => Vec::new(),
                };
                self.frames.push(frame);
                for reply in replies {
                    if reply.delay.is_zero() {
                        self.deliver(&reply.bytes);
                    } else {
                        self.delayed.push(reply);
                    }
                }
            }
        }
        if !bytes.is_empty() && self.irq_tx && self.tx_room() {
            self.pending_irqs.push(InterruptSource::TransmitReady);
        }
        bytes.len()
    }
}

struct SimShared {
    state: Mutex<SimState>,
    handler: Mutex<Option<InterruptHandler>>,
}

impl SimShared {
    /// Run `f` on the model, then raise whatever interrupts and delayed
    /// replies it produced with the model unlocked.
    fn op<R>(self: &Arc<Self>, f: impl FnOnce(&mut SimState) -> R) -> R {
        let (result, irqs, delayed) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            (result, mem::take(&mut state.pending_irqs), mem::take(&mut state.delayed))
        };
        for reply in delayed {
            self.schedule(reply);
        }
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            for irq in irqs {
                handler(irq);
            }
        }
        result
    }

    fn schedule(self: &Arc<Self>, reply: Reply) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(reply.delay).await;
            shared.op(|s| s.deliver(&reply.bytes));
        });
    }
}

/// Register side of the simulated UART
pub struct SimChannel {
    shared: Arc<SimShared>,
}

/// Controller side of the simulated UART; also the reset line.
#[derive(Clone)]
pub struct SimController {
    shared: Arc<SimShared>,
}

impl SimChannel {
    pub fn new(config: SimConfig) -> (Self, SimController) {
        let shared = Arc::new(SimShared {
            state: Mutex::new(SimState::new(config)),
            handler: Mutex::new(None),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            SimController { shared },
        )
    }
}

impl ByteChannel for SimChannel {
    fn read_byte(&mut self) -> Option<u8> {
        self.shared.op(|s| if s.clock_rx { s.rx.pop_front() } else { None })
    }

    fn write_byte(&mut self, byte: u8) -> bool {
        self.shared.op(|s| {
            if !s.tx_room() {
                return false;
            }
            s.tx_fifo.push_back(byte);
            if s.config.auto_drain {
                s.drain();
            }
            true
        })
    }

    fn data_ready(&self) -> bool {
        self.shared.state.lock().rx_ready()
    }

    fn transmit_ready(&self) -> bool {
        self.shared.state.lock().tx_room()
    }

    fn transmitter_empty(&self) -> bool {
        self.shared.state.lock().tx_fifo.is_empty()
    }

    fn reset(&mut self) {
        self.shared.op(|s| {
            s.rx.clear();
            s.tx_fifo.clear();
            s.decoder.discard();
            s.irq_rx = false;
            s.irq_tx = false;
            s.flow = None;
            s.uart_resets += 1;
        })
    }

    fn set_baud(&mut self, rate: u32) {
        self.shared.op(|s| {
            if rate != s.baud && !s.config.cts_after_speed_change {
                s.cts = false;
            }
            s.baud = rate;
            s.baud_log.push(rate);
        })
    }

    fn set_flow_control(&mut self, enabled: bool, signals: FlowSignals) {
        self.shared.op(|s| s.flow = enabled.then_some(signals))
    }

    fn set_rts(&mut self, asserted: bool) {
        self.shared.op(|s| s.rts = asserted)
    }

    fn cts_asserted(&self) -> bool {
        self.shared.state.lock().cts
    }

    fn set_interrupt_enabled(&mut self, source: InterruptEnable, enabled: bool) {
        self.shared.op(|s| match source {
            InterruptEnable::DataReady => {
                s.irq_rx = enabled;
                if enabled && s.rx_ready() {
                    s.pending_irqs.push(InterruptSource::DataReady);
                }
            }
            InterruptEnable::TransmitReady => {
                s.irq_tx = enabled;
                if enabled && s.tx_room() {
                    s.pending_irqs.push(InterruptSource::TransmitReady);
                }
            }
        })
    }

    fn set_clock(&mut self, direction: Direction, enabled: bool) {
        self.shared.op(|s| {
            let clock = match direction {
                Direction::Rx => &mut s.clock_rx,
                Direction::Tx => &mut s.clock_tx,
            };
            if *clock == enabled {
                return;
            }
            *clock = enabled;
            s.clock_log.push((direction, enabled));
            if enabled && direction == Direction::Rx && s.irq_rx && s.rx_ready() {
                s.pending_irqs.push(InterruptSource::DataReady);
            }
        })
    }

    fn register_interrupt(&mut self, handler: InterruptHandler) {
        *self.shared.handler.lock() = Some(handler);
    }
}

impl ResetLine for SimController {
    fn set_reset(&self, asserted: bool) {
        let rise = self.shared.op(|s| {
            s.in_reset = asserted;
            if asserted {
                s.cts = false;
                s.decoder.discard();
                return None;
            }
            match s.config.cts_after_reset {
                Some(delay) if delay.is_zero() => {
                    s.cts = true;
                    None
                }
                other => other,
            }
        });
        if let Some(delay) = rise {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                shared.op(|s| {
                    if !s.in_reset {
                        s.cts = true;
                    }
                });
            });
        }
    }
}

impl SimController {
    pub fn set_responder(&self, responder: impl Responder + 'static) {
        self.shared.op(|s| s.responder = Some(Box::new(responder)));
    }

    /// Put bytes on the wire towards the host
    pub fn inject(&self, bytes: &[u8]) {
        debug!(bytes = hex::encode(bytes), "Controller sends");
        self.shared.op(|s| s.deliver(bytes));
    }

    pub fn inject_packet(&self, packet: &Packet) {
        self.inject(&packet.encode());
    }

    pub fn inject_after(&self, delay: Duration, bytes: impl Into<Bytes>) {
        self.shared.schedule(Reply::raw(delay, bytes));
    }

    pub fn set_auto_drain(&self, enabled: bool) {
        self.shared.op(|s| {
            s.config.auto_drain = enabled;
            if enabled {
                s.drain();
            }
        });
    }

    /// Controller consumes everything in the transmit FIFO
    pub fn drain_tx(&self) -> usize {
        self.shared.op(|s| s.drain())
    }

    pub fn raise_host_wakeup(&self) {
        let handler = self.shared.handler.lock().clone();
        if let Some(handler) = handler {
            handler(InterruptSource::HostWakeup);
        }
    }

    /// Complete frames the controller has received, in order
    pub fn sent_frames(&self) -> Vec<Packet> {
        self.shared.state.lock().frames.clone()
    }

    pub fn clear_sent_frames(&self) {
        self.shared.state.lock().frames.clear();
    }

    /// Every byte that left the transmit FIFO
    pub fn wire_bytes(&self) -> Vec<u8> {
        self.shared.state.lock().wire.clone()
    }

    pub fn set_cts(&self, asserted: bool) {
        self.shared.op(|s| s.cts = asserted);
    }

    pub fn baud(&self) -> u32 {
        self.shared.state.lock().baud
    }

    /// Every rate programmed, in order
    pub fn baud_history(&self) -> Vec<u32> {
        self.shared.state.lock().baud_log.clone()
    }

    pub fn flow_control(&self) -> Option<FlowSignals> {
        self.shared.state.lock().flow
    }

    pub fn rts(&self) -> bool {
        self.shared.state.lock().rts
    }

    pub fn in_reset(&self) -> bool {
        self.shared.state.lock().in_reset
    }

    pub fn uart_resets(&self) -> u32 {
        self.shared.state.lock().uart_resets
    }

    pub fn clock_enabled(&self, direction: Direction) -> bool {
        let state = self.shared.state.lock();
        match direction {
            Direction::Rx => state.clock_rx,
            Direction::Tx => state.clock_tx,
        }
    }

    /// Clock transitions, in order
    pub fn clock_log(&self) -> Vec<(Direction, bool)> {
        self.shared.state.lock().clock_log.clone()
    }

    pub fn interrupt_enabled(&self, source: InterruptEnable) -> bool {
        let state = self.shared.state.lock();
        match source {
            InterruptEnable::DataReady => state.irq_rx,
            InterruptEnable::TransmitReady => state.irq_tx,
        }
    }

    pub fn tx_fifo_len(&self) -> usize {
        self.shared.state.lock().tx_fifo.len()
    }

    /// Bytes waiting in the host's receive FIFO
    pub fn rx_pending(&self) -> usize {
        self.shared.state.lock().rx.len()
    }
}
