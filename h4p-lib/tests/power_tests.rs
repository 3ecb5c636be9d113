mod common;
use common::*;

const IDLE: Duration = Duration::from_millis(200);

fn gate_offs(chip: &SimController, direction: Direction) -> usize {
    chip.clock_log()
        .iter()
        .filter(|&&(d, on)| d == direction && !on)
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_both_directions_gate_after_idle() {
    let h = Harness::running().await;
    assert!(h.chip.clock_enabled(Direction::Tx));
    assert!(h.chip.clock_enabled(Direction::Rx));

    sleep(IDLE - Duration::from_millis(20)).await;
    assert!(!h.transport.is_gated(Direction::Tx));
    assert!(!h.transport.is_gated(Direction::Rx));

    sleep(Duration::from_millis(40)).await;
    assert!(h.transport.is_gated(Direction::Tx));
    assert!(h.transport.is_gated(Direction::Rx));
    assert!(!h.chip.clock_enabled(Direction::Tx));
    assert!(!h.chip.clock_enabled(Direction::Rx));

    let stats = h.transport.stats();
    assert_eq!(stats.tx_gate_offs, 1);
    assert_eq!(stats.rx_gate_offs, 1);

    // Stays gated; no repeated gate-offs
    sleep(IDLE * 3).await;
    assert_eq!(h.transport.stats().tx_gate_offs, 1);
    assert_eq!(gate_offs(&h.chip, Direction::Tx), 1);
}

#[tokio::test(start_paused = true)]
async fn test_regular_traffic_never_gates() {
    let h = Harness::running().await;
    for _ in 0..6 {
        sleep(Duration::from_millis(150)).await;
        // The chip answers each command, which keeps receive busy too
        h.transport
            .enqueue_for_transmit(Packet::command(0x0c03, &[]).unwrap())
            .unwrap();
    }
    settle().await;
    assert_eq!(gate_offs(&h.chip, Direction::Tx), 0);
    assert_eq!(gate_offs(&h.chip, Direction::Rx), 0);
    assert_eq!(h.chip.sent_frames().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_enqueue_ungates_transmit() {
    let h = Harness::running().await;
    sleep(IDLE + Duration::from_millis(20)).await;
    assert!(!h.chip.clock_enabled(Direction::Tx));

    let cmd = Packet::command(0x0c03, &[]).unwrap();
    h.transport.enqueue_for_transmit(cmd.clone()).unwrap();
    // Clock is back before the frame is even queued
    assert!(h.chip.clock_enabled(Direction::Tx));
    assert!(!h.transport.is_gated(Direction::Tx));

    settle().await;
    assert_eq!(h.chip.sent_frames(), vec![cmd]);

    sleep(IDLE + Duration::from_millis(20)).await;
    assert!(h.transport.is_gated(Direction::Tx));
    assert_eq!(h.transport.stats().tx_gate_offs, 2);
}

#[tokio::test(start_paused = true)]
async fn test_transmit_stays_on_while_fifo_busy() {
    let h = Harness::running().await;
    h.chip.set_auto_drain(false);
    h.transport
        .enqueue_for_transmit(Packet::command(0x0c03, &[]).unwrap())
        .unwrap();
    settle().await;
    assert!(h.chip.tx_fifo_len() > 0);

    // Countdown expires with bytes still in the FIFO: re-armed, not gated
    sleep(IDLE + Duration::from_millis(50)).await;
    assert!(h.chip.clock_enabled(Direction::Tx));

    h.chip.drain_tx();
    sleep(IDLE + Duration::from_millis(20)).await;
    assert!(!h.chip.clock_enabled(Direction::Tx));
}

#[tokio::test(start_paused = true)]
async fn test_receive_gate_holds_remote_off() {
    let mut h = Harness::running().await;
    sleep(IDLE + Duration::from_millis(20)).await;

    assert!(h.transport.is_gated(Direction::Rx));
    assert!(!h.chip.clock_enabled(Direction::Rx));
    assert!(!h.chip.interrupt_enabled(InterruptEnable::DataReady));
    assert!(!h.chip.rts());
    assert_eq!(h.chip.flow_control(), None);

    // Controller talks anyway; nothing is read while gated
    let event = Packet::event(0x13, &[0x01, 0x02, 0x00, 0x01, 0x00]).unwrap();
    h.chip.inject_packet(&event);
    settle().await;
    assert!(h.drain_events().is_empty());
    assert_eq!(h.chip.rx_pending(), event.wire_len());

    // Host wakeup brings the receive path back and drains it
    h.chip.raise_host_wakeup();
    settle().await;
    assert!(!h.transport.is_gated(Direction::Rx));
    assert!(h.chip.clock_enabled(Direction::Rx));
    assert!(h.chip.interrupt_enabled(InterruptEnable::DataReady));
    assert_eq!(h.chip.flow_control(), Some(FlowSignals::RTS));
    assert_eq!(h.drain_events(), vec![HostEvent::Packet(event)]);
    assert_eq!(h.chip.rx_pending(), 0);

    // Idle again, gated again
    sleep(IDLE + Duration::from_millis(20)).await;
    assert!(h.transport.is_gated(Direction::Rx));
}

#[tokio::test(start_paused = true)]
async fn test_no_gating_during_bringup() {
    // Slow firmware acks make bring-up take several idle periods
    let h = Harness::new(
        ScriptedChip {
            command_ack_delay: Duration::from_millis(300),
            ..ScriptedChip::new()
        },
        SimConfig::default(),
        firmware(3),
        TransportConfig::default(),
    );
    let started = Instant::now();
    h.transport.open().await.expect("bring-up failed");
    assert!(started.elapsed() > IDLE * 4);

    assert_eq!(gate_offs(&h.chip, Direction::Tx), 0);
    assert_eq!(gate_offs(&h.chip, Direction::Rx), 0);
}

#[tokio::test(start_paused = true)]
async fn test_power_management_disabled() {
    let h = Harness::running_with(TransportConfig {
        power_management: false,
        ..TransportConfig::default()
    })
    .await;
    sleep(IDLE * 5).await;
    assert!(h.chip.clock_enabled(Direction::Tx));
    assert!(h.chip.clock_enabled(Direction::Rx));
    assert_eq!(h.transport.stats().tx_gate_offs, 0);
}

#[tokio::test(start_paused = true)]
async fn test_check_alive_while_gated() {
    let h = Harness::running().await;
    sleep(IDLE + Duration::from_millis(20)).await;
    assert!(h.transport.is_gated(Direction::Tx));
    assert!(h.transport.is_gated(Direction::Rx));

    // Transmit side wakes for the request; the reply waits behind the
    // receive gate until the host is woken
    let (result, ()) = tokio::join!(h.transport.check_alive(), async {
        sleep(Duration::from_millis(10)).await;
        h.chip.raise_host_wakeup();
    });
    assert!(result.is_ok(), "{:?}", result);
}

#[tokio::test(start_paused = true)]
async fn test_close_while_gated() {
    let h = Harness::running().await;
    sleep(IDLE + Duration::from_millis(20)).await;
    h.transport.close().await;

    assert!(!h.transport.is_gated(Direction::Tx));
    assert!(!h.transport.is_gated(Direction::Rx));
    assert!(!h.chip.clock_enabled(Direction::Tx));
    assert!(!h.chip.clock_enabled(Direction::Rx));

    // Timers are gone: nothing else touches the clocks
    let log = h.chip.clock_log();
    sleep(IDLE * 3).await;
    assert_eq!(h.chip.clock_log(), log);
}
