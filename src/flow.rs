//! Per-flow connection state.
//!
//! The classic control block is split by writer: `FlowTx` is owned by the
//! transmit worker, `FlowRx` by the receive parser, and `FlowShared` is the
//! small atomic bundle both sides touch. The split is what lets the two
//! hot loops run lock-free: each field has exactly one writer, and the
//! shared fields are released by the parser and acquired by the transmit
//! pipeline.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;

use crate::config::NetConfig;
use crate::port::SteeringRule;
use crate::wire::{Ipv4Address, TcpSeqNumber};

/// Client subset of the TCP state machine. Transitions never skip a state:
/// Init → SynSent → Established (→ Closed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TcpState {
    Init = 0,
    SynSent = 1,
    Established = 2,
    Closed = 3,
}

impl TcpState {
    fn from_u8(value: u8) -> TcpState {
        match value {
            0 => TcpState::Init,
            1 => TcpState::SynSent,
            2 => TcpState::Established,
            _ => TcpState::Closed,
        }
    }
}

/// Fields read and written across the TX/RX worker boundary.
#[repr(align(64))]
pub struct FlowShared {
    state: AtomicU8,
    /// Next acknowledgement number to stamp on outbound packets.
    next_ack: AtomicU32,
    /// Last receive window advertised by the peer.
    rwin: AtomicU16,
}

impl FlowShared {
    fn new() -> FlowShared {
        FlowShared {
            state: AtomicU8::new(TcpState::Init as u8),
            next_ack: AtomicU32::new(0),
            rwin: AtomicU16::new(0xffff),
        }
    }

    pub fn state(&self) -> TcpState {
        TcpState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TcpState) {
        self.state.store(state as u8, Ordering::Release)
    }

    pub fn next_ack(&self) -> TcpSeqNumber {
        TcpSeqNumber(self.next_ack.load(Ordering::Acquire))
    }

    pub fn set_next_ack(&self, ack: TcpSeqNumber) {
        self.next_ack.store(ack.0, Ordering::Release)
    }

    pub fn rwin(&self) -> u16 {
        self.rwin.load(Ordering::Acquire)
    }

    pub fn set_rwin(&self, rwin: u16) {
        self.rwin.store(rwin, Ordering::Release)
    }
}

/// Transmit-side view: one writer, the TX pipeline (and the handshake
/// engine before the workers exist).
#[derive(Debug, Clone, Copy)]
pub struct FlowTx {
    pub src_addr: Ipv4Address,
    pub dst_addr: Ipv4Address,
    pub src_port: u16,
    pub dst_port: u16,
    /// Initial sequence number picked at table build time.
    pub seq_ini: u32,
    pub next_seq: TcpSeqNumber,
}

/// Receive-side view: one writer, the RX parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowRx {
    pub last_seq_recv: TcpSeqNumber,
    pub last_ack_recv: TcpSeqNumber,
}

/// The full flow table. `shared` is handed to both workers; `tx` moves
/// into the transmit worker and `rx` into the parser when the drive phase
/// starts.
pub struct FlowTable {
    pub shared: Arc<Vec<FlowShared>>,
    pub tx: Vec<FlowTx>,
    pub rx: Vec<FlowRx>,
    pub rules: Vec<SteeringRule>,
}

impl FlowTable {
    pub fn new(nr_flows: usize, net: &NetConfig, rng: &mut StdRng) -> FlowTable {
        let mut shared = Vec::with_capacity(nr_flows);
        let mut tx = Vec::with_capacity(nr_flows);
        let mut rx = Vec::with_capacity(nr_flows);
        let mut rules = Vec::with_capacity(nr_flows);

        for i in 0..nr_flows {
            let src_port = ((i % nr_flows) + 1) as u16;
            let seq_ini: u32 = rng.gen();

            shared.push(FlowShared::new());
            tx.push(FlowTx {
                src_addr: net.src_ip,
                dst_addr: net.dst_ip,
                src_port,
                dst_port: net.dst_port,
                seq_ini,
                next_seq: TcpSeqNumber(seq_ini),
            });
            rx.push(FlowRx::default());
            rules.push(SteeringRule {
                src_addr: net.dst_ip,
                dst_addr: net.src_ip,
                src_port: net.dst_port,
                dst_port: src_port,
                mark: i as u32,
                queue: 0,
            });
        }

        FlowTable {
            shared: Arc::new(shared),
            tx,
            rx,
            rules,
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}
