use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use h4p_lib::sim::{ScriptedChip, SimChannel, SimConfig};
use h4p_lib::{
    ChannelHost, Direction, FirmwareFile, FirmwareImage, FirmwareLoader, HostEvent, Packet, Transport,
    TransportConfig,
};
use h4p_rs::logging::setup_logging;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Run the H4+ transport against a simulated controller: bring-up, some
/// traffic, an alive check and idle gating, then print what happened.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Transport config as JSON; missing fields use defaults
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Firmware image (length-prefixed H4 records); a synthetic image is used otherwise
    #[arg(short, long)]
    firmware: Option<PathBuf>,
    /// Number of synthetic firmware commands when no image is given
    #[arg(long, default_value_t = 8)]
    fw_commands: usize,
    /// Speed change requests the simulated controller ignores
    #[arg(long, default_value_t = 0)]
    drop_speed_acks: u32,
    /// Firmware opcode the controller fails (hex, e.g. fd03)
    #[arg(long)]
    fail_opcode: Option<String>,
    /// ACL frames to send once the link is up
    #[arg(long, default_value_t = 4)]
    traffic: usize,
    /// Transmit FIFO depth of the simulated UART
    #[arg(long, default_value_t = 16)]
    fifo_depth: usize,
    /// Stay idle this long after traffic to watch clock gating (ms)
    #[arg(long, default_value_t = 300)]
    idle_ms: u64,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose, env!("CARGO_CRATE_NAME"))?;

    if let Err(e) = run(cli).await {
        error!("Simulation failed: {:?}", e);
        process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => TransportConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => TransportConfig::default(),
    };

    let firmware: Arc<dyn FirmwareLoader> = match &cli.firmware {
        Some(path) => Arc::new(FirmwareFile::new(path)),
        None => Arc::new(synthetic_firmware(cli.fw_commands)?),
    };

    let fail_opcode = cli
        .fail_opcode
        .as_deref()
        .map(|s| u16::from_str_radix(s.trim_start_matches("0x"), 16))
        .transpose()
        .context("Invalid --fail-opcode")?;

    let (channel, chip) = SimChannel::new(SimConfig {
        tx_fifo_depth: cli.fifo_depth,
        ..SimConfig::default()
    });
    chip.set_responder(ScriptedChip {
        drop_speed_acks: cli.drop_speed_acks,
        fail_opcode: fail_opcode.map(|op| (op, 0x01)),
        ..ScriptedChip::new()
    });

    let (host, mut events) = ChannelHost::new();
    let transport = Transport::new(channel, Arc::new(chip.clone()), host, firmware, config);

    let opened = transport.open().await;
    if let Some(report) = transport.last_bringup() {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    opened.context("Bring-up failed")?;

    for i in 0..cli.traffic {
        let payload: Vec<u8> = (0..32).map(|b| (b as u8).wrapping_add(i as u8)).collect();
        transport.enqueue_for_transmit(Packet::acl(0x0001, 2, &payload)?)?;
    }
    match transport.check_alive().await {
        Ok(rtt) => info!("Controller alive, round trip {:?}", rtt),
        Err(e) => warn!("Alive check failed: {}", e),
    }

    // Loop the controller's traffic back so the host side sees something too
    for frame in chip.sent_frames().iter().filter(|f| f.acl_header().is_some()) {
        chip.inject_packet(frame);
    }

    tokio::time::sleep(Duration::from_millis(cli.idle_ms)).await;
    info!(
        "Clock gating: tx {}, rx {}",
        gated(transport.is_gated(Direction::Tx)),
        gated(transport.is_gated(Direction::Rx))
    );

    while let Ok(event) = events.try_recv() {
        match event {
            HostEvent::Packet(packet) => info!("Host received {}", packet),
            other => info!("Host event {:?}", other),
        }
    }

    transport.close().await;
    println!("{}", serde_json::to_string_pretty(&transport.stats())?);
    Ok(())
}

fn synthetic_firmware(count: usize) -> Result<FirmwareImage> {
    let commands = (0..count)
        .map(|i| Packet::command(0xFD00 | (i as u16 & 0xFF), &[i as u8; 8]))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FirmwareImage::new(commands))
}

fn gated(on: bool) -> &'static str {
    if on { "gated" } else { "running" }
}
