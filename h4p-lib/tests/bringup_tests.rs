mod common;
use common::*;

#[tokio::test(start_paused = true)]
async fn test_bringup_happy_path() {
    let mut h = Harness::with_chip(ScriptedChip {
        speed_ack_delay: Duration::from_millis(80),
        ..ScriptedChip::new()
    });
    h.transport.open().await.expect("bring-up failed");

    assert_eq!(h.transport.state(), LinkState::Running);
    assert!(h.transport.is_running());
    assert_eq!(h.events.recv().await, Some(HostEvent::LinkUp));

    let report = h.transport.last_bringup().expect("no report");
    assert!(report.succeeded());
    assert_eq!(report.speed_attempts, 1);
    assert_eq!(report.speed_retries(), 0);
    assert_eq!(report.firmware_acked, 3);
    assert_eq!(
        report.trace,
        vec![
            BringupState::Reset,
            BringupState::WaitCts,
            BringupState::SpeedChangeSent,
            BringupState::SpeedAck,
            BringupState::FirmwareSending,
            BringupState::FirmwareAck,
            BringupState::Running,
        ]
    );

    // Speed change first, then the firmware in order
    let sent = h.chip.sent_frames();
    assert_eq!(sent.len(), 4);
    assert_eq!(sent[0], Packet::speed_change(TARGET_BAUD));
    assert_eq!(&sent[1..], firmware(3).commands());

    assert_eq!(h.chip.baud(), TARGET_BAUD);
    assert_eq!(h.chip.baud_history(), vec![DEFAULT_BAUD, TARGET_BAUD]);
    assert_eq!(h.chip.flow_control(), Some(FlowSignals::BOTH));
    assert!(!h.chip.in_reset());
}

#[tokio::test(start_paused = true)]
async fn test_bringup_speed_ack_via_command_complete() {
    let h = Harness::with_chip(ScriptedChip {
        speed_ack_status: Some(STATUS_SUCCESS),
        ..ScriptedChip::new()
    });
    h.transport.open().await.expect("bring-up failed");
    assert_eq!(h.transport.state(), LinkState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_bringup_speed_change_rejected() {
    let h = Harness::with_chip(ScriptedChip {
        speed_ack_status: Some(0x12),
        ..ScriptedChip::new()
    });
    let err = h.transport.open().await.unwrap_err();
    assert!(matches!(
        err,
        H4pError::Bringup(BringupError::SpeedChangeRejected { status: 0x12 })
    ));
    assert_eq!(h.transport.state(), LinkState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_bringup_retries_lost_speed_ack() {
    let h = Harness::with_chip(ScriptedChip {
        drop_speed_acks: 1,
        ..ScriptedChip::new()
    });
    h.transport.open().await.expect("bring-up failed");

    let report = h.transport.last_bringup().unwrap();
    assert_eq!(report.speed_attempts, 2);
    assert_eq!(report.speed_retries(), 1);

    let speed_changes = h
        .chip
        .sent_frames()
        .iter()
        .filter(|f| f.command_opcode() == Some(SPEED_CHANGE_OPCODE))
        .count();
    assert_eq!(speed_changes, 2);
}

#[tokio::test(start_paused = true)]
async fn test_bringup_speed_negotiation_gives_up() {
    let h = Harness::with_chip(ScriptedChip {
        drop_speed_acks: u32::MAX,
        ..ScriptedChip::new()
    });
    let started = Instant::now();
    let err = h.transport.open().await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(
        err,
        H4pError::Bringup(BringupError::SpeedNegotiationTimeout { attempts: 3 })
    ));
    let report = h.transport.last_bringup().unwrap();
    assert_eq!(report.speed_attempts, 3);
    assert_eq!(
        report.final_state(),
        Some(&BringupState::Failed(BringupError::SpeedNegotiationTimeout { attempts: 3 }))
    );

    // Three 100 ms waits after reset settle, CTS and post-reset delay
    assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(400), "{:?}", elapsed);

    // Torn down: reset asserted, clocks off, no task left
    assert_eq!(h.transport.state(), LinkState::Closed);
    assert!(h.chip.in_reset());
    assert!(!h.chip.clock_enabled(Direction::Tx));
    assert!(!h.chip.clock_enabled(Direction::Rx));
    assert_eq!(h.transport.pending_frames(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_bringup_no_cts_after_reset() {
    let h = Harness::new(
        ScriptedChip::new(),
        SimConfig {
            cts_after_reset: None,
            ..SimConfig::default()
        },
        firmware(1),
        TransportConfig::default(),
    );
    let err = h.transport.open().await.unwrap_err();
    assert!(matches!(err, H4pError::Bringup(BringupError::NoResponseAfterReset)));
    assert!(h.chip.sent_frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_bringup_no_cts_after_speed_change() {
    let h = Harness::new(
        ScriptedChip::new(),
        SimConfig {
            cts_after_speed_change: false,
            ..SimConfig::default()
        },
        firmware(1),
        TransportConfig::default(),
    );
    let err = h.transport.open().await.unwrap_err();
    assert!(matches!(err, H4pError::Bringup(BringupError::NoCtsAfterSpeedChange)));
    assert_eq!(err_code(&err), -5);
}

fn err_code(err: &H4pError) -> i32 {
    match err {
        H4pError::Bringup(e) => e.code(),
        _ => 0,
    }
}

#[tokio::test(start_paused = true)]
async fn test_bringup_firmware_command_fails() {
    let image = firmware(3);
    let failing = image.commands()[1].command_opcode().unwrap();
    let h = Harness::new(
        ScriptedChip {
            fail_opcode: Some((failing, 0x01)),
            ..ScriptedChip::new()
        },
        SimConfig::default(),
        image,
        TransportConfig::default(),
    );
    let err = h.transport.open().await.unwrap_err();
    match err {
        H4pError::Bringup(BringupError::FirmwareTransferError { index, .. }) => assert_eq!(index, 1),
        other => panic!("unexpected error {:?}", other),
    }
    let report = h.transport.last_bringup().unwrap();
    assert_eq!(report.firmware_acked, 1);
    // Third command never sent
    assert_eq!(h.chip.sent_frames().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_bringup_firmware_ack_timeout() {
    let (channel, chip) = SimChannel::new(SimConfig::default());
    let mut seen = 0;
    chip.set_responder(move |frame: &Packet| {
        seen += 1;
        match frame.command_opcode() {
            Some(SPEED_CHANGE_OPCODE) => vec![Reply::now(Packet::alive(ALIVE_MARKER))],
            // First firmware command is acknowledged, the second never is
            Some(opcode) if seen == 2 => vec![Reply::now(Packet::command_complete_event(opcode, 0))],
            _ => Vec::new(),
        }
    });
    let (host, _events) = ChannelHost::new();
    let transport = Transport::new(
        channel,
        Arc::new(chip.clone()),
        host,
        Arc::new(firmware(2)),
        TransportConfig::default(),
    );

    let err = transport.open().await.unwrap_err();
    assert!(matches!(
        err,
        H4pError::Bringup(BringupError::FirmwareTransferError { index: 1, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_bringup_unexpected_frame_is_dropped() {
    let (channel, chip) = SimChannel::new(SimConfig::default());
    chip.set_responder(|frame: &Packet| match frame.command_opcode() {
        Some(SPEED_CHANGE_OPCODE) => vec![
            // Stray ACL frame ahead of the real answer
            Reply::now(Packet::acl(1, 2, &[0xde, 0xad]).unwrap()),
            Reply::after(Duration::from_millis(5), Packet::alive(ALIVE_MARKER)),
        ],
        Some(opcode) => vec![Reply::now(Packet::command_complete_event(opcode, 0))],
        None => Vec::new(),
    });
    let (host, mut events) = ChannelHost::new();
    let transport = Transport::new(
        channel,
        Arc::new(chip.clone()),
        host,
        Arc::new(firmware(1)),
        TransportConfig::default(),
    );
    transport.open().await.expect("bring-up failed");

    // Host only ever hears about the link coming up
    assert_eq!(events.recv().await, Some(HostEvent::LinkUp));
    assert!(events.try_recv().is_err());
    assert_eq!(transport.stats().dropped_frames, 1);
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_frame_during_firmware_upload_is_dropped() {
    let (channel, chip) = SimChannel::new(SimConfig::default());
    chip.set_responder(|frame: &Packet| match frame.command_opcode() {
        Some(SPEED_CHANGE_OPCODE) => vec![Reply::now(Packet::alive(ALIVE_MARKER))],
        Some(opcode) => vec![
            // Legacy negotiation frame ahead of every firmware ack
            Reply::now(Packet::new(PacketKind::Negotiation, vec![0x01; 11])),
            Reply::after(Duration::from_millis(2), Packet::command_complete_event(opcode, 0)),
        ],
        None => Vec::new(),
    });
    let (host, mut events) = ChannelHost::new();
    let transport = Transport::new(
        channel,
        Arc::new(chip.clone()),
        host,
        Arc::new(firmware(2)),
        TransportConfig::default(),
    );
    transport.open().await.expect("bring-up failed");

    assert_eq!(transport.last_bringup().unwrap().firmware_acked, 2);
    assert_eq!(transport.stats().dropped_frames, 2);
    assert_eq!(events.recv().await, Some(HostEvent::LinkUp));
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_bringup() {
    let h = Harness::with_chip(ScriptedChip {
        silent: true,
        ..ScriptedChip::new()
    });
    let started = Instant::now();
    let (result, ()) = tokio::join!(h.transport.open(), async {
        // Somewhere inside the first speed change wait
        sleep(Duration::from_millis(60)).await;
        assert!(matches!(h.transport.state(), LinkState::BringingUp(_)));
        h.transport.close().await;
    });

    assert!(matches!(result, Err(H4pError::Bringup(BringupError::Cancelled))));
    // Well short of the 100 ms speed change deadline
    assert!(started.elapsed() < Duration::from_millis(100), "{:?}", started.elapsed());
    assert_eq!(h.transport.state(), LinkState::Closed);
    assert!(h.chip.in_reset());
    assert_eq!(
        h.transport.last_bringup().unwrap().final_state(),
        Some(&BringupState::Failed(BringupError::Cancelled))
    );
}

#[tokio::test(start_paused = true)]
async fn test_reopen_after_failure() {
    let h = Harness::with_chip(ScriptedChip {
        drop_speed_acks: 3,
        ..ScriptedChip::new()
    });
    assert!(h.transport.open().await.is_err());
    // The chip answers the fourth request, which is the first of the retry
    h.transport.open().await.expect("second bring-up failed");
    assert_eq!(h.transport.state(), LinkState::Running);
    assert_eq!(h.transport.last_bringup().unwrap().speed_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_twice_is_noop() {
    let h = Harness::running().await;
    h.transport.open().await.expect("second open failed");
    assert_eq!(h.transport.last_bringup().unwrap().speed_attempts, 1);
    assert!(h.chip.sent_frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_firmware_file_missing() {
    let (channel, chip) = SimChannel::new(SimConfig::default());
    let (host, _events) = ChannelHost::new();
    let transport = Transport::new(
        channel,
        Arc::new(chip.clone()),
        host,
        Arc::new(FirmwareFile::new("/nonexistent/h4p/firmware.bin")),
        TransportConfig::default(),
    );
    assert!(matches!(transport.open().await, Err(H4pError::Io(_))));
    assert!(transport.last_bringup().is_none());
    assert!(chip.sent_frames().is_empty());
}
