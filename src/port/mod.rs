//! Abstract raw Ethernet port.
//!
//! The generator drives whatever NIC backend is plugged in through three
//! narrow capabilities: burst transmit, burst receive, and a hardware
//! 5-tuple steering table that tags matched frames with a flow mark and
//! directs them to our receive queue. Checksum fill-in for the IPv4 and
//! TCP headers is the port's responsibility; the wire layer always emits
//! zeros there.
//!
//! After the control plane is set up the port splits into an owned TX half
//! and an owned RX half, one per worker, plus a control handle for
//! statistics.

#[cfg(target_os = "linux")]
pub mod afpacket;
pub mod veth;

use crate::wire::{EthernetFrame, Ipv4Address, Ipv4Packet, TcpPacket, ETHERTYPE_IPV4, PROTO_TCP};

/// One raw Ethernet frame plus the receive-side metadata the port attaches.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    /// Flow mark assigned by a matching steering rule, if any.
    pub mark: Option<u32>,
}

impl Frame {
    pub fn new(len: usize) -> Frame {
        Frame {
            data: vec![0; len],
            mark: None,
        }
    }
}

/// Exact-match 5-tuple rule: frames *from* the peer endpoint *to* ours are
/// marked with `mark` and steered to receive queue `queue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SteeringRule {
    pub src_addr: Ipv4Address,
    pub dst_addr: Ipv4Address,
    pub src_port: u16,
    pub dst_port: u16,
    pub mark: u32,
    pub queue: u16,
}

/// Opaque handle of an installed steering rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleHandle(pub usize);

/// Software rendition of the hardware steering table: match `frame`
/// against `rules` and return the mark of the first hit.
pub(crate) fn steer(rules: &[SteeringRule], frame: &Frame) -> Option<u32> {
    let eth = EthernetFrame::new_checked(&frame.data[..]).ok()?;
    if eth.ethertype() != ETHERTYPE_IPV4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
    if ip.next_header() != PROTO_TCP {
        return None;
    }
    let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
    rules
        .iter()
        .find(|r| {
            r.src_addr == ip.src_addr()
                && r.dst_addr == ip.dst_addr()
                && r.src_port == tcp.src_port()
                && r.dst_port == tcp.dst_port()
        })
        .map(|r| r.mark)
}

/// Cumulative port counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_errors: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
}

/// Owned transmit half of a split port.
pub trait TxQueue: Send {
    /// Hand a burst of frames to the port. Returns how many were accepted;
    /// the rest are dropped.
    fn tx_burst(&mut self, frames: Vec<Frame>) -> usize;

    fn tx_one(&mut self, frame: Frame) -> bool {
        self.tx_burst(vec![frame]) == 1
    }
}

/// Owned receive half of a split port.
pub trait RxQueue: Send {
    /// Pull up to `max` frames into `out`. Returns how many arrived.
    fn rx_burst(&mut self, out: &mut Vec<Frame>, max: usize) -> usize;
}

/// Control handle that stays with the orchestrator after the split.
pub trait PortCtl: Send {
    fn stats(&self) -> PortStats;
}

/// A raw port before the split: full control plane plus both data paths.
///
/// The handshake engine runs against this single-threaded view; only once
/// every flow is established does `split` hand the data paths to the
/// workers, which is what makes handshake-before-drive a hard
/// happens-before boundary.
pub trait RawPort {
    fn install_steering(&mut self, rule: &SteeringRule) -> anyhow::Result<RuleHandle>;

    /// Remove every installed rule.
    fn flush_steering(&mut self);

    /// Zero the cumulative counters.
    fn reset_stats(&mut self);

    fn stats(&self) -> PortStats;

    fn tx_burst(&mut self, frames: Vec<Frame>) -> usize;

    fn rx_burst(&mut self, out: &mut Vec<Frame>, max: usize) -> usize;

    fn split(self: Box<Self>) -> (Box<dyn TxQueue>, Box<dyn RxQueue>, Box<dyn PortCtl>);
}
