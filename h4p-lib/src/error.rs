use crate::packet::PacketKind;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// The primary error type for the `h4p-lib` library.
#[derive(Error, Debug)]
pub enum H4pError {
    #[error("Bring-up failed: {0}")]
    Bringup(#[from] BringupError),

    #[error("Transport is not running")]
    NotRunning,

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Invalid firmware image at offset {offset}: {message}")]
    InvalidFirmware { offset: usize, message: String },

    #[error("Insufficient data: expected at least {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons the bring-up sequence can stop short of `Running`.
///
/// Every variant is fatal to the open attempt: the transport is torn down and
/// left closed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BringupError {
    #[error("No CTS from controller after reset")]
    NoResponseAfterReset,

    #[error("No speed change response after {attempts} attempt(s)")]
    SpeedNegotiationTimeout { attempts: u32 },

    #[error("Speed change rejected with status {status:#04x}")]
    SpeedChangeRejected { status: u8 },

    #[error("No CTS after speed change")]
    NoCtsAfterSpeedChange,

    #[error("Firmware transfer failed at command {index}: {reason}")]
    FirmwareTransferError { index: usize, reason: String },

    #[error("Bring-up cancelled by close")]
    Cancelled,
}

impl BringupError {
    /// Errno-style code so an owning driver can tell the failures apart.
    pub fn code(&self) -> i32 {
        match self {
            BringupError::NoResponseAfterReset => -19,            // ENODEV
            BringupError::SpeedNegotiationTimeout { .. } => -110, // ETIMEDOUT
            BringupError::SpeedChangeRejected { .. } => -71,      // EPROTO
            BringupError::NoCtsAfterSpeedChange => -5,            // EIO
            BringupError::FirmwareTransferError { .. } => -121,   // EREMOTEIO
            BringupError::Cancelled => -125,                      // ECANCELED
        }
    }
}

/// Receive-path framing failures. Recovered locally by resynchronising.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("Unknown H4 packet type {0:#04x}")]
    UnknownKind(u8),

    #[error("{kind} frame declares {declared} body bytes, only {capacity} available")]
    TooLarge {
        kind: PacketKind,
        declared: usize,
        capacity: usize,
    },
}

/// Outcome of a handshake wait that did not produce a matching reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Timed out waiting for reply")]
    Timeout,

    #[error("Wait cancelled")]
    Cancelled,

    #[error("Reply rejected: {0}")]
    Rejected(String),
}
