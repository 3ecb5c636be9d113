use crate::channel::Direction;
use crate::packet::PacketKind;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live diagnostic counters, updated from the receive and transmit tasks.
#[derive(Debug, Default)]
pub struct Stats {
    byte_rx: AtomicU64,
    byte_tx: AtomicU64,
    err_rx: AtomicU64,
    frame_errors: AtomicU64,
    oversize_frames: AtomicU64,
    rx_timeouts: AtomicU64,
    cmd_tx: AtomicU64,
    acl_tx: AtomicU64,
    sco_tx: AtomicU64,
    evt_rx: AtomicU64,
    acl_rx: AtomicU64,
    sco_rx: AtomicU64,
    dropped_frames: AtomicU64,
    tx_gate_offs: AtomicU64,
    rx_gate_offs: AtomicU64,
}

/// Point-in-time copy of [`Stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub byte_rx: u64,
    pub byte_tx: u64,
    /// Receive errors of any kind (bad indicator, oversize, timed out partials)
    pub err_rx: u64,
    pub frame_errors: u64,
    pub oversize_frames: u64,
    pub rx_timeouts: u64,
    pub cmd_tx: u64,
    pub acl_tx: u64,
    pub sco_tx: u64,
    pub evt_rx: u64,
    pub acl_rx: u64,
    pub sco_rx: u64,
    /// Frames nobody wanted (unexpected during bring-up, stale alive replies)
    pub dropped_frames: u64,
    pub tx_gate_offs: u64,
    pub rx_gate_offs: u64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl Stats {
    pub fn snapshot(&self) -> LinkStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        LinkStats {
            byte_rx: get(&self.byte_rx),
            byte_tx: get(&self.byte_tx),
            err_rx: get(&self.err_rx),
            frame_errors: get(&self.frame_errors),
            oversize_frames: get(&self.oversize_frames),
            rx_timeouts: get(&self.rx_timeouts),
            cmd_tx: get(&self.cmd_tx),
            acl_tx: get(&self.acl_tx),
            sco_tx: get(&self.sco_tx),
            evt_rx: get(&self.evt_rx),
            acl_rx: get(&self.acl_rx),
            sco_rx: get(&self.sco_rx),
            dropped_frames: get(&self.dropped_frames),
            tx_gate_offs: get(&self.tx_gate_offs),
            rx_gate_offs: get(&self.rx_gate_offs),
        }
    }

    pub(crate) fn bytes_rx(&self, n: usize) {
        bump(&self.byte_rx, n as u64);
    }

    pub(crate) fn bytes_tx(&self, n: usize) {
        bump(&self.byte_tx, n as u64);
    }

    pub(crate) fn frame_error(&self) {
        bump(&self.frame_errors, 1);
        bump(&self.err_rx, 1);
    }

    pub(crate) fn oversize_frame(&self) {
        bump(&self.oversize_frames, 1);
        bump(&self.err_rx, 1);
    }

    pub(crate) fn rx_timeout(&self) {
        bump(&self.rx_timeouts, 1);
        bump(&self.err_rx, 1);
    }

    pub(crate) fn dropped(&self) {
        bump(&self.dropped_frames, 1);
    }

    pub(crate) fn gate_off(&self, direction: Direction) {
        match direction {
            Direction::Tx => bump(&self.tx_gate_offs, 1),
            Direction::Rx => bump(&self.rx_gate_offs, 1),
        }
    }

    pub(crate) fn sent(&self, kind: PacketKind) {
        match kind {
            PacketKind::Command => bump(&self.cmd_tx, 1),
            PacketKind::AclData => bump(&self.acl_tx, 1),
            PacketKind::ScoData => bump(&self.sco_tx, 1),
            _ => {}
        }
    }

    pub(crate) fn received(&self, kind: PacketKind) {
        match kind {
            PacketKind::Event => bump(&self.evt_rx, 1),
            PacketKind::AclData => bump(&self.acl_rx, 1),
            PacketKind::ScoData => bump(&self.sco_rx, 1),
            _ => {}
        }
    }
}
