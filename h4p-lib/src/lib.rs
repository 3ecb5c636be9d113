pub mod bringup;
pub mod channel;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod firmware;
pub mod packet;
pub mod parser;
pub mod power;
pub mod sim;
pub mod stats;
pub mod transmit;
pub mod transport;
pub mod waiter;

pub use bringup::{BringupReport, BringupState};
pub use channel::{
    ByteChannel, ChannelHost, Direction, FlowSignals, HostEvent, HostStack, InterruptEnable, InterruptSource,
    ResetLine,
};
pub use config::TransportConfig;
pub use error::{BringupError, FrameError, H4pError, HandshakeError};
pub use firmware::{FirmwareFile, FirmwareImage, FirmwareLoader};
pub use packet::{Packet, PacketKind};
pub use parser::{FrameParser, ParseEvent, RxState};
pub use stats::LinkStats;
pub use transport::{LinkState, Transport};
