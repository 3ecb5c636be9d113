//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use h4p_lib::constants::*;
#[allow(unused_imports)]
pub use h4p_lib::sim::{Reply, Responder, ScriptedChip, SimChannel, SimConfig, SimController};
#[allow(unused_imports)]
pub use h4p_lib::*;
#[allow(unused_imports)]
pub use std::sync::Arc;
#[allow(unused_imports)]
pub use std::time::Duration;
#[allow(unused_imports)]
pub use tokio::sync::mpsc::UnboundedReceiver;
#[allow(unused_imports)]
pub use tokio::time::{Instant, sleep};

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

/// Vendor firmware commands, each acknowledged by a Command Complete
#[allow(dead_code)]
pub fn firmware(count: usize) -> FirmwareImage {
    FirmwareImage::new(
        (0..count)
            .map(|i| Packet::command(0xFD00 + i as u16, &[i as u8, 0xA5]).unwrap())
            .collect(),
    )
}

#[allow(dead_code)]
pub struct Harness {
    pub transport: Transport<SimChannel>,
    pub chip: SimController,
    pub events: UnboundedReceiver<HostEvent>,
}

#[allow(dead_code)]
impl Harness {
    pub fn new(chip: ScriptedChip, sim: SimConfig, image: FirmwareImage, config: TransportConfig) -> Self {
        let (channel, controller) = SimChannel::new(sim);
        controller.set_responder(chip);
        let (host, events) = ChannelHost::new();
        let transport = Transport::new(
            channel,
            Arc::new(controller.clone()),
            host,
            Arc::new(image),
            config,
        );
        Self {
            transport,
            chip: controller,
            events,
        }
    }

    pub fn with_chip(chip: ScriptedChip) -> Self {
        Self::new(chip, SimConfig::default(), firmware(3), TransportConfig::default())
    }

    /// Well-behaved controller, default timings, opened
    pub async fn running() -> Self {
        Self::running_with(TransportConfig::default()).await
    }

    pub async fn running_with(config: TransportConfig) -> Self {
        let mut harness = Self::new(ScriptedChip::new(), SimConfig::default(), firmware(3), config);
        harness.transport.open().await.expect("bring-up failed");
        assert_eq!(harness.events.recv().await, Some(HostEvent::LinkUp));
        harness.chip.clear_sent_frames();
        harness
    }

    /// Everything delivered to the host so far
    pub fn drain_events(&mut self) -> Vec<HostEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Let spawned tasks run without advancing the paused clock much
#[allow(dead_code)]
pub async fn settle() {
    sleep(Duration::from_millis(5)).await;
}

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
