//! The H4+ transport: one receive task, one transmit task, bring-up and
//! teardown around them.
//!
//! Interrupts never touch the registers directly. The handler registered
//! with the [`ByteChannel`] only wakes the task serving the direction that
//! fired; each task drains its side under the register lock and then does
//! everything else (dispatch, power bookkeeping) with the lock released.

use crate::bringup::{BringupReport, BringupState, Sequencer};
use crate::channel::{
    ByteChannel, Direction, HostStack, InterruptEnable, InterruptHandler, InterruptSource, Registers,
    ResetLine,
};
use crate::config::TransportConfig;
use crate::constants::{ALIVE_MARKER, ALIVE_REQUEST};
use crate::dispatch::Dispatcher;
use crate::error::{FrameError, H4pError};
use crate::firmware::FirmwareLoader;
use crate::packet::Packet;
use crate::parser::{FrameParser, ParseEvent};
use crate::power::PowerGovernor;
use crate::stats::{LinkStats, Stats};
use crate::transmit::{OutboundQueue, pump};
use crate::waiter::Expected;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum LinkState {
    Closed,
    BringingUp(BringupState),
    Running,
}

/// Wakeups for the two worker tasks.
///
/// `Notify` keeps one stored permit, so any number of interrupts between two
/// runs coalesce into a single pending run per direction.
#[derive(Default)]
struct Scheduler {
    rx: Notify,
    tx: Notify,
    host_wake: AtomicBool,
    shutdown: AtomicBool,
}

impl Scheduler {
    fn interrupt(&self, source: InterruptSource) {
        match source {
            InterruptSource::DataReady | InterruptSource::RxTimeout | InterruptSource::LineStatus => {
                self.rx.notify_one()
            }
            InterruptSource::TransmitReady => self.tx.notify_one(),
            InterruptSource::HostWakeup => {
                self.host_wake.store(true, Ordering::Release);
                self.rx.notify_one();
            }
            InterruptSource::ModemStatus => trace!("Modem status change"),
        }
    }

    fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.rx.notify_one();
        self.tx.notify_one();
    }

    fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Receive progress shared with the transmit side
#[derive(Default)]
struct RxFlags {
    /// Bytes of the frame currently being assembled, 0 between frames
    partial: AtomicUsize,
    timed_out: AtomicBool,
}

struct Tasks {
    rx: JoinHandle<()>,
    tx: JoinHandle<()>,
}

pub(crate) struct Link<C: ByteChannel> {
    pub(crate) regs: Registers<C>,
    pub(crate) reset_line: Arc<dyn ResetLine>,
    pub(crate) config: TransportConfig,
    pub(crate) dispatcher: Dispatcher,
    firmware: Arc<dyn FirmwareLoader>,
    queue: OutboundQueue,
    governor: PowerGovernor<C>,
    stats: Arc<Stats>,
    sched: Arc<Scheduler>,
    rx_flags: RxFlags,
    state: Mutex<LinkState>,
    cancel: AtomicBool,
    tasks: Mutex<Option<Tasks>>,
    last_report: Mutex<Option<BringupReport>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl<C: ByteChannel> Link<C> {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn set_bringup_state(&self, state: BringupState) {
        *self.state.lock() = match state {
            BringupState::Running => LinkState::Running,
            other => LinkState::BringingUp(other),
        };
    }

    /// Queue a frame on behalf of bring-up, bypassing the running check
    pub(crate) fn queue_internal(&self, packet: &Packet) {
        self.queue.push_back(packet.encode());
        self.sched.tx.notify_one();
    }

    pub(crate) fn enter_running(&self) {
        self.dispatcher.handshake().cancel();
        self.dispatcher.set_running(true);
        *self.state.lock() = LinkState::Running;
        info!("Link is up");
        self.dispatcher.host().link_up();
        if self.config.power_management {
            self.governor.activate();
        }
    }

    fn run_rx(&self, parser: &mut FrameParser) {
        if self.sched.host_wake.swap(false, Ordering::AcqRel) {
            debug!("Host wakeup");
            self.governor.wake_rx();
        }
        if self.rx_flags.timed_out.swap(false, Ordering::AcqRel) && parser.has_partial() {
            warn!(
                kind = ?parser.current_kind(),
                bytes = parser.partial_len(),
                "Discarding partial frame after receive timeout"
            );
            parser.discard();
            self.stats.rx_timeout();
        }

        let mut completed = Vec::new();
        let mut count = 0;
        {
            let mut regs = self.regs.lock();
            while regs.data_ready() {
                let Some(byte) = regs.read_byte() else {
                    break;
                };
                count += 1;
                match parser.push(byte) {
                    ParseEvent::Pending => {}
                    ParseEvent::Complete(packet) => completed.push(packet),
                    ParseEvent::Error(FrameError::UnknownKind(_)) => self.stats.frame_error(),
                    ParseEvent::Error(FrameError::TooLarge { .. }) => self.stats.oversize_frame(),
                }
            }
        }
        self.rx_flags.partial.store(parser.partial_len(), Ordering::Release);

        if count > 0 {
            trace!(count, "UART read");
            self.stats.bytes_rx(count);
            self.governor.rx_activity();
        }
        for packet in completed {
            self.dispatcher.dispatch(packet);
        }
    }

    fn run_tx(&self) {
        if !self.queue.is_empty() && !self.queue.head_is_partial() {
            let partial = self.rx_flags.partial.load(Ordering::Acquire);
            if partial > 0 {
                // Remote missed its receive deadline while we were starting
                // a new outbound frame.
                warn!(bytes = partial, "Receive timed out mid-frame");
                self.rx_flags.timed_out.store(true, Ordering::Release);
                self.sched.rx.notify_one();
            }
        }

        let outcome = {
            let mut regs = self.regs.lock();
            pump(&mut *regs, &self.queue)
        };
        self.stats.bytes_tx(outcome.bytes_written);
        if outcome.drained {
            self.governor.tx_idle();
        }
    }

    /// Release everything acquired by open. Safe to call in any state.
    async fn teardown(&self) {
        let was_running = self.dispatcher.is_running();
        self.dispatcher.set_running(false);
        self.governor.deactivate();
        self.dispatcher.handshake().close();
        self.dispatcher.probe().close();

        let purged = self.queue.purge();
        if purged > 0 {
            debug!(purged, "Dropped queued frames");
        }

        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            self.sched.stop();
            for (name, handle) in [("rx", tasks.rx), ("tx", tasks.tx)] {
                if let Err(e) = handle.await {
                    error!("{} task ended abnormally: {}", name, e);
                }
            }
        }
        self.rx_flags.partial.store(0, Ordering::Release);
        self.rx_flags.timed_out.store(false, Ordering::Release);

        {
            let mut regs = self.regs.lock();
            regs.set_clock(Direction::Tx, true);
            regs.set_clock(Direction::Rx, true);
            regs.reset();
            regs.set_interrupt_enabled(InterruptEnable::DataReady, false);
            regs.set_interrupt_enabled(InterruptEnable::TransmitReady, false);
            regs.set_clock(Direction::Tx, false);
            regs.set_clock(Direction::Rx, false);
        }
        self.reset_line.set_reset(true);

        *self.state.lock() = LinkState::Closed;
        if was_running {
            self.dispatcher.host().link_down();
        }
        info!("Link is down");
    }
}

async fn rx_task<C: ByteChannel>(link: Arc<Link<C>>) {
    let mut parser = FrameParser::new(link.config.max_frame_size);
    loop {
        link.sched.rx.notified().await;
        if link.sched.is_stopped() {
            break;
        }
        link.run_rx(&mut parser);
    }
    trace!("rx task stopped");
}

async fn tx_task<C: ByteChannel>(link: Arc<Link<C>>) {
    loop {
        link.sched.tx.notified().await;
        if link.sched.is_stopped() {
            break;
        }
        link.run_tx();
    }
    trace!("tx task stopped");
}

/// H4+ transport over one UART.
///
/// ```no_run
/// # use h4p_lib::*;
/// # async fn demo(channel: impl ByteChannel, reset: std::sync::Arc<dyn ResetLine>, fw: FirmwareImage) -> Result<(), H4pError> {
/// let (host, mut events) = ChannelHost::new();
/// let transport = Transport::new(channel, reset, host, std::sync::Arc::new(fw), TransportConfig::default());
/// transport.open().await?;
/// transport.enqueue_for_transmit(Packet::command(0x0c03, &[])?)?;
/// # Ok(()) }
/// ```
pub struct Transport<C: ByteChannel> {
    link: Arc<Link<C>>,
}

impl<C: ByteChannel> Transport<C> {
    pub fn new(
        channel: C,
        reset_line: Arc<dyn ResetLine>,
        host: Arc<dyn HostStack>,
        firmware: Arc<dyn FirmwareLoader>,
        config: TransportConfig,
    ) -> Self {
        let regs: Registers<C> = Arc::new(Mutex::new(channel));
        let stats = Arc::new(Stats::default());
        let governor = PowerGovernor::new(Arc::clone(&regs), Arc::clone(&stats), config.idle_timeout);
        let link = Link {
            regs,
            reset_line,
            dispatcher: Dispatcher::new(host, Arc::clone(&stats)),
            firmware,
            queue: OutboundQueue::new(),
            governor,
            stats,
            sched: Arc::new(Scheduler::default()),
            rx_flags: RxFlags::default(),
            state: Mutex::new(LinkState::Closed),
            cancel: AtomicBool::new(false),
            tasks: Mutex::new(None),
            last_report: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            config,
        };
        Self { link: Arc::new(link) }
    }

    /// Bring the controller up. Returns once the link is running, or with the
    /// reason bring-up failed; on failure everything is torn down again.
    pub async fn open(&self) -> Result<(), H4pError> {
        let link = &self.link;
        let _guard = link.lifecycle.lock().await;
        if link.dispatcher.is_running() {
            return Ok(());
        }

        let image = link.firmware.load().inspect_err(|e| error!("Cannot read firmware: {}", e))?;

        link.cancel.store(false, Ordering::Release);
        link.sched.shutdown.store(false, Ordering::Release);
        link.sched.host_wake.store(false, Ordering::Release);
        link.dispatcher.handshake().reopen();
        link.dispatcher.probe().reopen();

        {
            let sched = Arc::clone(&link.sched);
            let handler: InterruptHandler = Arc::new(move |source: InterruptSource| sched.interrupt(source));
            let mut regs = link.regs.lock();
            regs.set_clock(Direction::Tx, true);
            regs.set_clock(Direction::Rx, true);
            regs.register_interrupt(handler);
        }
        *link.tasks.lock() = Some(Tasks {
            rx: tokio::spawn(rx_task(Arc::clone(link))),
            tx: tokio::spawn(tx_task(Arc::clone(link))),
        });

        let mut sequencer = Sequencer::new(link, image.len());
        let result = sequencer.run(&image).await;
        let report = sequencer.into_report();
        info!(
            attempts = report.speed_attempts,
            firmware = report.firmware_acked,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Bring-up finished"
        );
        *link.last_report.lock() = Some(report);

        if let Err(e) = result {
            error!("Bring-up failed: {}", e);
            link.teardown().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Stop the link. Cancels an open in progress; a no-op when closed.
    pub async fn close(&self) {
        let link = &self.link;
        link.cancel.store(true, Ordering::Release);
        link.dispatcher.handshake().close();
        link.dispatcher.probe().close();

        let _guard = link.lifecycle.lock().await;
        if *link.state.lock() == LinkState::Closed {
            return;
        }
        link.teardown().await;
    }

    /// Queue a frame for the controller. Only accepted while running, and
    /// only if its length field matches and it fits `max_frame_size`.
    pub fn enqueue_for_transmit(&self, packet: Packet) -> Result<(), H4pError> {
        let link = &self.link;
        if !link.dispatcher.is_running() {
            warn!(kind = %packet.kind(), "Frame for non-running link");
            return Err(H4pError::NotRunning);
        }
        packet.check_length()?;
        if packet.data().len() > link.config.max_frame_size {
            return Err(H4pError::InvalidPacket(format!(
                "{} frame of {} bytes exceeds the {} byte limit",
                packet.kind(),
                packet.data().len(),
                link.config.max_frame_size
            )));
        }
        link.stats.sent(packet.kind());
        link.governor.wake_tx();
        link.queue.push_back(packet.encode());
        link.sched.tx.notify_one();
        Ok(())
    }

    /// Drop every frame still waiting to go out. Returns how many were dropped.
    pub fn flush(&self) -> usize {
        let purged = self.link.queue.purge();
        debug!(purged, "Flushed outbound queue");
        purged
    }

    /// Send an alive check and wait for the controller to answer it.
    /// Returns the round-trip time.
    pub async fn check_alive(&self) -> Result<Duration, H4pError> {
        let link = &self.link;
        if !link.dispatcher.is_running() {
            return Err(H4pError::NotRunning);
        }
        let waiter = link
            .dispatcher
            .probe()
            .arm(Expected::Alive(ALIVE_MARKER), link.config.alive_timeout);
        let started = Instant::now();
        link.governor.wake_tx();
        link.queue_internal(&Packet::alive(ALIVE_REQUEST));
        waiter.wait().await?;
        Ok(started.elapsed())
    }

    pub fn state(&self) -> LinkState {
        self.link.state.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.link.dispatcher.is_running()
    }

    pub fn stats(&self) -> LinkStats {
        self.link.stats.snapshot()
    }

    pub fn last_bringup(&self) -> Option<BringupReport> {
        self.link.last_report.lock().clone()
    }

    pub fn pending_frames(&self) -> usize {
        self.link.queue.len()
    }

    pub fn is_gated(&self, direction: Direction) -> bool {
        self.link.governor.is_gated(direction)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.link.config
    }
}

impl<C: ByteChannel> Drop for Transport<C> {
    fn drop(&mut self) {
        // Tasks hold their own reference to the link; stop them so it is freed.
        self.link.cancel.store(true, Ordering::Release);
        self.link.dispatcher.handshake().close();
        self.link.dispatcher.probe().close();
        self.link.governor.deactivate();
        self.link.sched.stop();
    }
}
