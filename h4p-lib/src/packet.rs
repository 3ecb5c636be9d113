//! H4+ wire format.
//!
//! Every frame on the UART starts with a one-byte packet indicator, followed
//! by a kind-specific fixed header and a body whose length is decoded from
//! that header:
//!
//! | Kind        | Indicator | Header | Body length field          |
//! |-------------|-----------|--------|----------------------------|
//! | Command     | `0x01`    | 3      | `u8` at offset 2           |
//! | ACL data    | `0x02`    | 4      | `LE16` at offset 2         |
//! | SCO data    | `0x03`    | 3      | `u8` at offset 2           |
//! | Event       | `0x04`    | 2      | `u8` at offset 1           |
//! | Negotiation | `0x06`    | 11     | none                       |
//! | Alive check | `0x07`    | 3      | none                       |
//!
//! A [`Packet`] stores the kind separately and keeps header plus body in
//! `data`; [`Packet::encode`] puts the indicator back in front.

use crate::constants::*;
use crate::error::H4pError;
use bytes::{BufMut, Bytes, BytesMut};
use modular_bitfield::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::Display;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, TryFromPrimitive, IntoPrimitive, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum PacketKind {
    #[strum(to_string = "Command")]
    Command = 0x01,
    #[strum(to_string = "ACL")]
    AclData = 0x02,
    #[strum(to_string = "SCO")]
    ScoData = 0x03,
    #[strum(to_string = "Event")]
    Event = 0x04,
    #[strum(to_string = "Negotiation")]
    Negotiation = 0x06,
    #[strum(to_string = "AliveCheck")]
    AliveCheck = 0x07,
}

impl PacketKind {
    /// Fixed header length that follows the indicator byte
    pub fn header_len(&self) -> usize {
        match self {
            PacketKind::Command => COMMAND_HDR_SIZE,
            PacketKind::AclData => ACL_HDR_SIZE,
            PacketKind::ScoData => SCO_HDR_SIZE,
            PacketKind::Event => EVENT_HDR_SIZE,
            PacketKind::Negotiation => NEGOTIATION_HDR_SIZE,
            PacketKind::AliveCheck => ALIVE_HDR_SIZE,
        }
    }

    /// Decode the body length from a complete header.
    ///
    /// `header` must be exactly `header_len()` bytes.
    pub fn body_len(&self, header: &[u8]) -> usize {
        match self {
            PacketKind::Command => header[2] as usize,
            PacketKind::Event => header[1] as usize,
            PacketKind::AclData => match <[u8; ACL_HDR_SIZE]>::try_from(header) {
                Ok(raw) => AclHeader::from_bytes(raw).data_len() as usize,
                Err(_) => 0,
            },
            PacketKind::ScoData => match <[u8; SCO_HDR_SIZE]>::try_from(header) {
                Ok(raw) => ScoHeader::from_bytes(raw).data_len() as usize,
                Err(_) => 0,
            },
            PacketKind::Negotiation | PacketKind::AliveCheck => 0,
        }
    }
}

/// ACL data header (little-endian on the wire)
#[bitfield(bytes = 4)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AclHeader {
    pub handle: B12,
    pub packet_boundary: B2,
    pub broadcast: B2,
    pub data_len: u16,
}

/// SCO data header (little-endian on the wire)
#[bitfield(bytes = 3)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoHeader {
    pub handle: B12,
    pub packet_status: B2,
    #[skip]
    unused: B2,
    pub data_len: u8,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CommandHeaderRaw {
    pub opcode: U16,
    pub plen: u8,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CommandCompleteRaw {
    pub evt: u8,
    pub plen: u8,
    pub ncmd: u8,
    pub opcode: U16,
    pub status: u8,
}

/// Vendor speed change command, indicator included
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SpeedChangeCmd {
    pub indicator: u8,
    pub header: CommandHeaderRaw,
    pub baud: U32,
}

/// Decoded Command Complete event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandComplete {
    pub ncmd: u8,
    pub opcode: u16,
    pub status: u8,
}

impl CommandComplete {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// One complete H4+ frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketKind,
    data: Bytes,
}

impl Packet {
    pub fn new(kind: PacketKind, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// Build an HCI command frame. Fails when `params` does not fit the
    /// 8-bit length field.
    pub fn command(opcode: u16, params: &[u8]) -> Result<Self, H4pError> {
        let plen = length_field::<u8>(PacketKind::Command, params.len())?;
        let mut data = BytesMut::with_capacity(COMMAND_HDR_SIZE + params.len());
        data.put_u16_le(opcode);
        data.put_u8(plen);
        data.extend_from_slice(params);
        Ok(Self::new(PacketKind::Command, data.freeze()))
    }

    /// Build an HCI event frame
    pub fn event(code: u8, params: &[u8]) -> Result<Self, H4pError> {
        let plen = length_field::<u8>(PacketKind::Event, params.len())?;
        let mut data = BytesMut::with_capacity(EVENT_HDR_SIZE + params.len());
        data.put_u8(code);
        data.put_u8(plen);
        data.extend_from_slice(params);
        Ok(Self::new(PacketKind::Event, data.freeze()))
    }

    /// Build a Command Complete event for `opcode` with the given status
    pub fn command_complete_event(opcode: u16, status: u8) -> Self {
        let [lo, hi] = opcode.to_le_bytes();
        Self::new(PacketKind::Event, vec![EVT_CMD_COMPLETE, 4, 1, lo, hi, status])
    }

    /// Build an ACL data frame
    pub fn acl(handle: u16, packet_boundary: u8, payload: &[u8]) -> Result<Self, H4pError> {
        let data_len = length_field::<u16>(PacketKind::AclData, payload.len())?;
        let header = AclHeader::new()
            .with_handle(handle & 0x0FFF)
            .with_packet_boundary(packet_boundary & 0x03)
            .with_broadcast(0)
            .with_data_len(data_len);
        let mut data = BytesMut::with_capacity(ACL_HDR_SIZE + payload.len());
        data.extend_from_slice(&header.into_bytes());
        data.extend_from_slice(payload);
        Ok(Self::new(PacketKind::AclData, data.freeze()))
    }

    /// Build an SCO data frame
    pub fn sco(handle: u16, payload: &[u8]) -> Result<Self, H4pError> {
        let data_len = length_field::<u8>(PacketKind::ScoData, payload.len())?;
        let header = ScoHeader::new()
            .with_handle(handle & 0x0FFF)
            .with_packet_status(0)
            .with_data_len(data_len);
        let mut data = BytesMut::with_capacity(SCO_HDR_SIZE + payload.len());
        data.extend_from_slice(&header.into_bytes());
        data.extend_from_slice(payload);
        Ok(Self::new(PacketKind::ScoData, data.freeze()))
    }

    /// Vendor command switching the controller UART to `baud`
    pub fn speed_change(baud: u32) -> Self {
        let cmd = SpeedChangeCmd {
            indicator: H4_CMD_PKT,
            header: CommandHeaderRaw {
                opcode: U16::new(SPEED_CHANGE_OPCODE),
                plen: SPEED_CHANGE_PLEN,
            },
            baud: U32::new(baud),
        };
        Self::new(PacketKind::Command, Bytes::copy_from_slice(&cmd.as_bytes()[1..]))
    }

    /// Alive check carrying `message_id` (`ALIVE_REQUEST` or `ALIVE_MARKER`)
    pub fn alive(message_id: u8) -> Self {
        Self::new(PacketKind::AliveCheck, vec![ALIVE_DLEN, message_id, 0x00])
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Header and body, without the indicator byte
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn header(&self) -> &[u8] {
        let end = self.kind.header_len().min(self.data.len());
        &self.data[..end]
    }

    pub fn body(&self) -> &[u8] {
        let start = self.kind.header_len().min(self.data.len());
        &self.data[start..]
    }

    /// Length on the wire, indicator included
    pub fn wire_len(&self) -> usize {
        1 + self.data.len()
    }

    /// Serialize with the indicator byte in front
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.wire_len());
        out.put_u8(self.kind.into());
        out.extend_from_slice(&self.data);
        out.freeze()
    }

    /// Header present and its length field matches the body
    pub fn check_length(&self) -> Result<(), H4pError> {
        let header_len = self.kind.header_len();
        if self.data.len() < header_len {
            return Err(H4pError::InsufficientData {
                expected: 1 + header_len,
                actual: 1 + self.data.len(),
            });
        }
        let expected = header_len + self.kind.body_len(&self.data[..header_len]);
        if self.data.len() != expected {
            return Err(H4pError::InvalidPacket(format!(
                "{} frame declares {} bytes, got {}",
                self.kind,
                expected,
                self.data.len()
            )));
        }
        Ok(())
    }

    pub fn command_opcode(&self) -> Option<u16> {
        if self.kind != PacketKind::Command {
            return None;
        }
        CommandHeaderRaw::read_from_prefix(&self.data)
            .ok()
            .map(|(hdr, _)| hdr.opcode.get())
    }

    /// Decode as a Command Complete event, if it is one
    pub fn command_complete(&self) -> Option<CommandComplete> {
        if self.kind != PacketKind::Event {
            return None;
        }
        let (raw, _) = CommandCompleteRaw::read_from_prefix(&self.data).ok()?;
        if raw.evt != EVT_CMD_COMPLETE || (raw.plen as usize) < 4 {
            return None;
        }
        Some(CommandComplete {
            ncmd: raw.ncmd,
            opcode: raw.opcode.get(),
            status: raw.status,
        })
    }

    /// Message id of an alive check (second header byte)
    pub fn alive_message_id(&self) -> Option<u8> {
        if self.kind != PacketKind::AliveCheck {
            return None;
        }
        self.data.get(1).copied()
    }

    pub fn acl_header(&self) -> Option<AclHeader> {
        if self.kind != PacketKind::AclData {
            return None;
        }
        let raw: [u8; ACL_HDR_SIZE] = self.data.get(..ACL_HDR_SIZE)?.try_into().ok()?;
        Some(AclHeader::from_bytes(raw))
    }

    pub fn sco_header(&self) -> Option<ScoHeader> {
        if self.kind != PacketKind::ScoData {
            return None;
        }
        let raw: [u8; SCO_HDR_SIZE] = self.data.get(..SCO_HDR_SIZE)?.try_into().ok()?;
        Some(ScoHeader::from_bytes(raw))
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{} bytes] {}", self.kind, self.wire_len(), hex::encode(&self.data))
    }
}

impl From<Packet> for Bytes {
    fn from(packet: Packet) -> Self {
        packet.encode()
    }
}

/// Decode exactly one complete frame, indicator included.
impl TryFrom<Bytes> for Packet {
    type Error = H4pError;

    fn try_from(mut bytes: Bytes) -> Result<Self, Self::Error> {
        let indicator = *bytes
            .first()
            .ok_or(H4pError::InvalidPacket("Missing packet indicator".to_string()))?;
        let kind = PacketKind::try_from(indicator)
            .map_err(|_| H4pError::InvalidPacket(format!("Unknown packet indicator {:#04x}", indicator)))?;
        let packet = Packet {
            kind,
            data: bytes.split_off(1),
        };
        packet.check_length()?;
        Ok(packet)
    }
}

/// Convert a body length into the header's length field type
fn length_field<T: TryFrom<usize>>(kind: PacketKind, len: usize) -> Result<T, H4pError> {
    T::try_from(len).map_err(|_| {
        H4pError::InvalidPacket(format!(
            "{} body of {} bytes does not fit the length field",
            kind, len
        ))
    })
}
