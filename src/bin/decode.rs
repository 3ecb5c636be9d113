use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use h4p_lib::{FirmwareImage, FrameParser, Packet, PacketKind};
use h4p_rs::logging::setup_logging;
use std::io::Read;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Decode an H4+ byte stream, or list the records of a firmware image.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Hex stream to decode; read from stdin when omitted. Whitespace and ':' are ignored.
    hex: Option<String>,
    /// Firmware image to list instead of a stream
    #[arg(short, long, conflicts_with = "hex")]
    firmware: Option<PathBuf>,
    /// Receive buffer capacity (header + body)
    #[arg(long, default_value_t = h4p_lib::constants::MAX_FRAME_SIZE)]
    capacity: usize,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(None, &cli.verbose, env!("CARGO_CRATE_NAME"))?;

    if let Some(path) = &cli.firmware {
        let data = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
        let image = FirmwareImage::from_bytes(Bytes::from(data))?;
        println!("{} records", image.len());
        for (index, command) in image.commands().iter().enumerate() {
            println!("{:4}: {}", index, describe(command));
        }
        return Ok(());
    }

    let text = match cli.hex {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    if cleaned.is_empty() {
        bail!("No input");
    }
    let bytes = hex::decode(&cleaned).context("Input is not valid hex")?;
    debug!("Decoding {} bytes", bytes.len());

    let mut parser = FrameParser::new(cli.capacity);
    let mut frames = 0;
    for result in parser.push_slice(&bytes) {
        match result {
            Ok(packet) => {
                frames += 1;
                println!("{}", describe(&packet));
            }
            Err(e) => warn!("{}", e),
        }
    }
    if parser.has_partial() {
        warn!(
            "Stream ends inside a {} frame, {} bytes missing",
            parser.current_kind().map(|k| k.to_string()).unwrap_or_default(),
            parser.bytes_remaining()
        );
    }
    println!("{} frames", frames);
    Ok(())
}

fn describe(packet: &Packet) -> String {
    let detail = match packet.kind() {
        PacketKind::Command => packet
            .command_opcode()
            .map(|op| format!("opcode {:#06x}, {} param bytes", op, packet.body().len())),
        PacketKind::Event => match packet.command_complete() {
            Some(cc) => Some(format!(
                "Command Complete opcode {:#06x} status {:#04x} ncmd {}",
                cc.opcode, cc.status, cc.ncmd
            )),
            None => packet.header().first().map(|code| format!("event {:#04x}", code)),
        },
        PacketKind::AclData => packet.acl_header().map(|h| {
            format!(
                "handle {:#05x} pb {} bc {} len {}",
                h.handle(),
                h.packet_boundary(),
                h.broadcast(),
                h.data_len()
            )
        }),
        PacketKind::ScoData => packet
            .sco_header()
            .map(|h| format!("handle {:#05x} len {}", h.handle(), h.data_len())),
        PacketKind::AliveCheck => packet.alive_message_id().map(|id| format!("message {:#04x}", id)),
        PacketKind::Negotiation => None,
    };
    match detail {
        Some(detail) => format!("{} ({})", packet, detail),
        None => packet.to_string(),
    }
}
