// Protocol and timing constants for the H4+ transport

use std::time::Duration;

/// H4 packet indicator: HCI command (host to controller)
pub const H4_CMD_PKT: u8 = 0x01;

/// H4 packet indicator: ACL data
pub const H4_ACL_PKT: u8 = 0x02;

/// H4 packet indicator: SCO data
pub const H4_SCO_PKT: u8 = 0x03;

/// H4 packet indicator: HCI event (controller to host)
pub const H4_EVT_PKT: u8 = 0x04;

/// H4+ packet indicator: legacy negotiation packet
pub const H4_NEG_PKT: u8 = 0x06;

/// H4+ packet indicator: alive check
pub const H4_ALIVE_PKT: u8 = 0x07;

/// Command header: opcode (LE16) + parameter length (u8)
pub const COMMAND_HDR_SIZE: usize = 3;

/// Event header: event code + parameter length
pub const EVENT_HDR_SIZE: usize = 2;

/// ACL header: handle/flags (LE16) + data length (LE16)
pub const ACL_HDR_SIZE: usize = 4;

/// SCO header: handle/flags (LE16) + data length (u8)
pub const SCO_HDR_SIZE: usize = 3;

/// Negotiation packets carry a fixed 11-byte header and no body
pub const NEGOTIATION_HDR_SIZE: usize = 11;

/// Alive check packets carry a fixed 3-byte header and no body
pub const ALIVE_HDR_SIZE: usize = 3;

/// Largest ACL payload the controller may send
pub const MAX_ACL_SIZE: usize = 1024;

/// Receive buffer capacity: largest ACL payload plus its header
pub const MAX_FRAME_SIZE: usize = MAX_ACL_SIZE + ACL_HDR_SIZE;

/// Vendor command: change UART baud rate
pub const SPEED_CHANGE_OPCODE: u16 = 0xFF36;

/// Parameter length of the speed change command (LE32 baud)
pub const SPEED_CHANGE_PLEN: u8 = 4;

/// Alive check message id sent by the host
pub const ALIVE_REQUEST: u8 = 0x55;

/// Alive check message id answered by the controller
pub const ALIVE_MARKER: u8 = 0xCC;

/// Length byte carried in the first header byte of an alive packet
pub const ALIVE_DLEN: u8 = 0x02;

/// HCI event code: Command Complete
pub const EVT_CMD_COMPLETE: u8 = 0x0E;

/// HCI status: success
pub const STATUS_SUCCESS: u8 = 0x00;

/// Baud rate the controller boots with
pub const DEFAULT_BAUD: u32 = 115_200;

/// Operational baud rate negotiated during bring-up
pub const TARGET_BAUD: u32 = 3_686_400;

/// Time the reset line is held asserted
pub const RESET_SETTLE: Duration = Duration::from_millis(20);

/// Delay after CTS first shows up, in case the chip answered early
pub const POST_RESET_DELAY: Duration = Duration::from_millis(20);

/// Bound on every "wait for clear to send" step
pub const CTS_TIMEOUT: Duration = Duration::from_millis(100);

/// CTS polling granularity
pub const CTS_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Per-attempt timeout of the speed change handshake
pub const SPEED_CHANGE_TIMEOUT: Duration = Duration::from_millis(100);

/// Total speed change attempts before giving up
pub const SPEED_CHANGE_ATTEMPTS: u32 = 3;

/// Delay after CTS reconfirmation so both sides run at the new rate
pub const SPEED_SETTLE: Duration = Duration::from_millis(10);

/// Per-command timeout while uploading firmware
pub const FIRMWARE_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Idle time before a direction's clock is gated
pub const IDLE_TIMEOUT: Duration = Duration::from_millis(200);

/// Timeout of a liveness probe once running
pub const ALIVE_TIMEOUT: Duration = Duration::from_millis(100);
