//! Firmware image container.
//!
//! An image is a flat sequence of records, each a little-endian `u16` length
//! followed by that many bytes holding exactly one H4 frame (indicator
//! included). Records are sent in order during bring-up, each one waiting for
//! its Command Complete before the next goes out.

use crate::error::H4pError;
use crate::packet::Packet;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::path::PathBuf;
use tracing::debug;

const RECORD_LEN_SIZE: usize = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImage {
    commands: Vec<Packet>,
}

impl FirmwareImage {
    pub fn new(commands: Vec<Packet>) -> Self {
        Self { commands }
    }

    pub fn commands(&self) -> &[Packet] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn from_bytes(mut bytes: Bytes) -> Result<Self, H4pError> {
        let total = bytes.len();
        let mut commands = Vec::new();
        while bytes.has_remaining() {
            let offset = total - bytes.remaining();
            if bytes.remaining() < RECORD_LEN_SIZE {
                return Err(H4pError::InvalidFirmware {
                    offset,
                    message: "truncated record length".to_string(),
                });
            }
            let len = bytes.get_u16_le() as usize;
            if len == 0 {
                return Err(H4pError::InvalidFirmware {
                    offset,
                    message: "empty record".to_string(),
                });
            }
            if bytes.remaining() < len {
                return Err(H4pError::InvalidFirmware {
                    offset,
                    message: format!("record needs {} bytes, {} left", len, bytes.remaining()),
                });
            }
            let record = bytes.split_to(len);
            let packet = Packet::try_from(record).map_err(|e| H4pError::InvalidFirmware {
                offset,
                message: e.to_string(),
            })?;
            commands.push(packet);
        }
        debug!(records = commands.len(), bytes = total, "Parsed firmware image");
        Ok(Self { commands })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        for packet in &self.commands {
            let frame = packet.encode();
            out.put_u16_le(frame.len() as u16);
            out.extend_from_slice(&frame);
        }
        out.freeze()
    }
}

/// Source of the firmware image, consulted on every open
pub trait FirmwareLoader: Send + Sync {
    fn load(&self) -> Result<FirmwareImage, H4pError>;
}

impl FirmwareLoader for FirmwareImage {
    fn load(&self) -> Result<FirmwareImage, H4pError> {
        Ok(self.clone())
    }
}

/// Firmware image read from disk at open time
#[derive(Debug, Clone)]
pub struct FirmwareFile {
    pub path: PathBuf,
}

impl FirmwareFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FirmwareLoader for FirmwareFile {
    fn load(&self) -> Result<FirmwareImage, H4pError> {
        let data = std::fs::read(&self.path)?;
        FirmwareImage::from_bytes(Bytes::from(data))
    }
}
