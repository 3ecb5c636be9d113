//! Idle clock gating, one countdown per direction.
//!
//! Only active once the link is running. Lock order is timer state first,
//! then registers; callers must not hold the register lock when calling in.

use crate::channel::{ByteChannel, Direction, FlowSignals, InterruptEnable, Registers};
use crate::stats::Stats;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Default)]
struct IdleState {
    gated: bool,
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

impl IdleState {
    /// Invalidate any countdown in flight
    fn cancel(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

struct IdleTimer {
    direction: Direction,
    state: Mutex<IdleState>,
}

impl IdleTimer {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            state: Mutex::new(IdleState::default()),
        }
    }

    /// Countdown expired. Returns `false` when the direction is still busy and
    /// the countdown should run again.
    fn expire<C: ByteChannel>(&self, generation: u64, regs: &Registers<C>, stats: &Stats) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation || state.gated {
            return true;
        }
        let mut regs = regs.lock();
        match self.direction {
            Direction::Tx => {
                if !regs.transmitter_empty() {
                    return false;
                }
                regs.set_clock(Direction::Tx, false);
            }
            Direction::Rx => {
                if regs.data_ready() {
                    return false;
                }
                // Hold the remote off while we cannot hear it
                regs.set_flow_control(false, FlowSignals::RTS);
                regs.set_rts(false);
                regs.set_interrupt_enabled(InterruptEnable::DataReady, false);
                regs.set_clock(Direction::Rx, false);
            }
        }
        state.gated = true;
        state.pending = None;
        stats.gate_off(self.direction);
        debug!(direction = %self.direction, "Clock gated after idle timeout");
        true
    }

    fn ungate<C: ByteChannel>(&self, regs: &Registers<C>) {
        let mut state = self.state.lock();
        state.cancel();
        if !state.gated {
            return;
        }
        let mut regs = regs.lock();
        match self.direction {
            Direction::Tx => regs.set_clock(Direction::Tx, true),
            Direction::Rx => {
                regs.set_clock(Direction::Rx, true);
                regs.set_interrupt_enabled(InterruptEnable::DataReady, true);
                regs.set_flow_control(true, FlowSignals::RTS);
            }
        }
        state.gated = false;
        debug!(direction = %self.direction, "Clock re-enabled");
    }
}

pub struct PowerGovernor<C: ByteChannel> {
    regs: Registers<C>,
    stats: Arc<Stats>,
    timeout: Duration,
    active: AtomicBool,
    rx: Arc<IdleTimer>,
    tx: Arc<IdleTimer>,
}

impl<C: ByteChannel> PowerGovernor<C> {
    pub fn new(regs: Registers<C>, stats: Arc<Stats>, timeout: Duration) -> Self {
        Self {
            regs,
            stats,
            timeout,
            active: AtomicBool::new(false),
            rx: Arc::new(IdleTimer::new(Direction::Rx)),
            tx: Arc::new(IdleTimer::new(Direction::Tx)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_gated(&self, direction: Direction) -> bool {
        self.timer(direction).state.lock().gated
    }

    /// Start governing; both directions begin counting down immediately.
    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
        self.arm(&self.tx);
        self.arm(&self.rx);
        debug!(timeout_ms = self.timeout.as_millis() as u64, "Power management active");
    }

    /// Stop governing: cancel both countdowns and ungate anything gated.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        self.tx.ungate(&self.regs);
        self.rx.ungate(&self.regs);
    }

    /// Outbound queue drained
    pub fn tx_idle(&self) {
        if self.is_active() {
            self.arm(&self.tx);
        }
    }

    /// Called before a packet is queued; the transmit clock is running when
    /// this returns.
    pub fn wake_tx(&self) {
        if self.is_active() {
            self.tx.ungate(&self.regs);
        }
    }

    /// Bytes were received; restart the receive countdown
    pub fn rx_activity(&self) {
        if self.is_active() {
            self.arm(&self.rx);
        }
    }

    /// Host wakeup: receive path back on, then count down again
    pub fn wake_rx(&self) {
        if self.is_active() {
            self.rx.ungate(&self.regs);
            self.arm(&self.rx);
        }
    }

    fn timer(&self, direction: Direction) -> &Arc<IdleTimer> {
        match direction {
            Direction::Rx => &self.rx,
            Direction::Tx => &self.tx,
        }
    }

    fn arm(&self, timer: &Arc<IdleTimer>) {
        let mut state = timer.state.lock();
        state.cancel();
        if state.gated {
            return;
        }
        let generation = state.generation;
        let timer = Arc::clone(timer);
        let regs = Arc::clone(&self.regs);
        let stats = Arc::clone(&self.stats);
        let timeout = self.timeout;
        state.pending = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(timeout).await;
                if timer.expire(generation, &regs, &stats) {
                    break;
                }
            }
        }));
    }
}

impl<C: ByteChannel> Drop for PowerGovernor<C> {
    fn drop(&mut self) {
        self.tx.state.lock().cancel();
        self.rx.state.lock().cancel();
    }
}
