//! Controller bring-up: reset, speed negotiation and firmware upload.
//!
//! States advance strictly in order
//! `Reset → WaitCts → SpeedChangeSent → SpeedAck → FirmwareSending →
//! FirmwareAck → Running`; any failure ends the sequence in `Failed`.

use crate::channel::{ByteChannel, FlowSignals, InterruptEnable};
use crate::config::TransportConfig;
use crate::error::{BringupError, HandshakeError};
use crate::firmware::FirmwareImage;
use crate::packet::Packet;
use crate::transport::Link;
use crate::waiter::Expected;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum_macros::Display;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum BringupState {
    Reset,
    WaitCts,
    SpeedChangeSent,
    SpeedAck,
    FirmwareSending,
    FirmwareAck,
    Running,
    Failed(BringupError),
}

/// What happened during the last bring-up attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BringupReport {
    /// Every state entered, in order
    pub trace: Vec<BringupState>,
    /// Speed change commands sent
    pub speed_attempts: u32,
    /// Firmware commands acknowledged
    pub firmware_acked: usize,
    pub firmware_total: usize,
    #[serde(with = "crate::config::millis")]
    pub elapsed: Duration,
}

impl BringupReport {
    fn new(firmware_total: usize) -> Self {
        Self {
            trace: Vec::new(),
            speed_attempts: 0,
            firmware_acked: 0,
            firmware_total,
            elapsed: Duration::ZERO,
        }
    }

    pub fn final_state(&self) -> Option<&BringupState> {
        self.trace.last()
    }

    /// Speed change commands that had to be resent
    pub fn speed_retries(&self) -> u32 {
        self.speed_attempts.saturating_sub(1)
    }

    pub fn succeeded(&self) -> bool {
        self.final_state() == Some(&BringupState::Running)
    }
}

pub(crate) struct Sequencer<'a, C: ByteChannel> {
    link: &'a Link<C>,
    report: BringupReport,
    started: Instant,
}

impl<'a, C: ByteChannel> Sequencer<'a, C> {
    pub(crate) fn new(link: &'a Link<C>, firmware_total: usize) -> Self {
        Self {
            link,
            report: BringupReport::new(firmware_total),
            started: Instant::now(),
        }
    }

    pub(crate) fn into_report(mut self) -> BringupReport {
        self.report.elapsed = self.started.elapsed();
        self.report
    }

    pub(crate) async fn run(&mut self, firmware: &FirmwareImage) -> Result<(), BringupError> {
        let result = self.steps(firmware).await;
        if let Err(e) = &result {
            self.enter(BringupState::Failed(e.clone()));
        }
        result
    }

    async fn steps(&mut self, firmware: &FirmwareImage) -> Result<(), BringupError> {
        self.reset().await?;
        self.negotiate_speed().await?;
        self.switch_baud().await?;
        self.upload_firmware(firmware).await?;
        self.check_cancelled()?;
        self.link.enter_running();
        self.enter(BringupState::Running);
        Ok(())
    }

    fn config(&self) -> &'a TransportConfig {
        &self.link.config
    }

    fn enter(&mut self, state: BringupState) {
        debug!(%state, "Bring-up state");
        self.link.set_bringup_state(state.clone());
        self.report.trace.push(state);
    }

    fn check_cancelled(&self) -> Result<(), BringupError> {
        if self.link.is_cancelled() {
            return Err(BringupError::Cancelled);
        }
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), BringupError> {
        let config = self.config();
        self.enter(BringupState::Reset);
        info!("Resetting controller...");
        self.link.reset_line.set_reset(true);
        sleep(config.reset_settle).await;
        {
            let mut regs = self.link.regs.lock();
            regs.reset();
            regs.set_baud(config.initial_baud);
            regs.set_flow_control(false, FlowSignals::BOTH);
            regs.set_rts(false);
            regs.set_interrupt_enabled(InterruptEnable::DataReady, true);
        }
        self.link.reset_line.set_reset(false);
        self.check_cancelled()?;

        self.enter(BringupState::WaitCts);
        if !self.wait_for_cts().await? {
            error!("No CTS from controller after reset");
            return Err(BringupError::NoResponseAfterReset);
        }
        sleep(config.post_reset_delay).await;
        self.check_cancelled()
    }

    /// Poll CTS until asserted or the configured timeout passes
    async fn wait_for_cts(&self) -> Result<bool, BringupError> {
        let config = self.config();
        let deadline = Instant::now() + config.cts_timeout;
        loop {
            self.check_cancelled()?;
            if self.link.regs.lock().cts_asserted() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(config.cts_poll_interval).await;
        }
    }

    async fn negotiate_speed(&mut self) -> Result<(), BringupError> {
        let config = self.config();
        self.link
            .regs
            .lock()
            .set_flow_control(true, FlowSignals::BOTH);

        let request = Packet::speed_change(config.target_baud);
        for attempt in 1..=config.speed_change_attempts {
            self.report.speed_attempts = attempt;
            self.enter(BringupState::SpeedChangeSent);

            let waiter = self
                .link
                .dispatcher
                .handshake()
                .arm(Expected::SpeedChange, config.speed_change_timeout);
            self.link.queue_internal(&request);

            match waiter.wait().await {
                Ok(reply) => {
                    if let Some(cc) = reply.command_complete() {
                        if !cc.is_success() {
                            error!("Speed change rejected, status {:#04x}", cc.status);
                            return Err(BringupError::SpeedChangeRejected { status: cc.status });
                        }
                    }
                    info!("Got speed change response after {} try(-ies)", attempt);
                    self.enter(BringupState::SpeedAck);
                    return Ok(());
                }
                Err(HandshakeError::Timeout) => {
                    warn!(attempt, "No speed change response");
                }
                Err(HandshakeError::Cancelled) => return Err(BringupError::Cancelled),
                Err(HandshakeError::Rejected(reason)) => {
                    warn!(attempt, %reason, "Speed change reply rejected");
                }
            }
        }

        error!(
            "No response to speed change after {} attempts",
            config.speed_change_attempts
        );
        Err(BringupError::SpeedNegotiationTimeout {
            attempts: config.speed_change_attempts,
        })
    }

    /// Move our side of the UART to the negotiated rate
    async fn switch_baud(&mut self) -> Result<(), BringupError> {
        let config = self.config();
        {
            let mut regs = self.link.regs.lock();
            regs.set_flow_control(false, FlowSignals::BOTH);
            regs.set_rts(false);
            regs.set_baud(config.target_baud);
        }
        if !self.wait_for_cts().await? {
            error!("No CTS from controller after speed change");
            return Err(BringupError::NoCtsAfterSpeedChange);
        }
        sleep(config.speed_settle).await;
        self.link
            .regs
            .lock()
            .set_flow_control(true, FlowSignals::BOTH);
        info!("UART running at {} baud", config.target_baud);
        self.check_cancelled()
    }

    async fn upload_firmware(&mut self, firmware: &FirmwareImage) -> Result<(), BringupError> {
        let config = self.config();
        self.enter(BringupState::FirmwareSending);
        info!("Sending firmware, {} commands", firmware.len());

        for (index, command) in firmware.commands().iter().enumerate() {
            let expected = Expected::CommandComplete {
                opcode: command.command_opcode(),
            };
            let waiter = self
                .link
                .dispatcher
                .handshake()
                .arm(expected, config.firmware_ack_timeout);
            self.link.queue_internal(command);

            match waiter.wait().await {
                Ok(_) => self.report.firmware_acked += 1,
                Err(HandshakeError::Timeout) => {
                    error!(index, "Timeout while sending firmware");
                    return Err(BringupError::FirmwareTransferError {
                        index,
                        reason: "no command complete before deadline".to_string(),
                    });
                }
                Err(HandshakeError::Cancelled) => return Err(BringupError::Cancelled),
                Err(HandshakeError::Rejected(reason)) => {
                    error!(index, %reason, "Firmware command failed");
                    return Err(BringupError::FirmwareTransferError { index, reason });
                }
            }
        }

        self.enter(BringupState::FirmwareAck);
        info!("Firmware sent, {} commands acknowledged", self.report.firmware_acked);
        Ok(())
    }
}
