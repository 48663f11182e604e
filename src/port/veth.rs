//! In-memory port pair.
//!
//! Two [RawPort]s joined by a lossless wire, with a software rendition of
//! the steering table. Tests and demos act as the server on one side while
//! the generator drives the other; nothing here is fast, it only has to be
//! faithful.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{steer, Frame, PortCtl, PortStats, RawPort, RuleHandle, RxQueue, SteeringRule, TxQueue};

#[derive(Default)]
struct Side {
    inbox: VecDeque<Frame>,
    rules: Vec<SteeringRule>,
    stats: PortStats,
}

#[derive(Default)]
struct Wire {
    sides: [Side; 2],
}

/// One end of an in-memory port pair.
pub struct VethPort {
    idx: usize,
    wire: Arc<Mutex<Wire>>,
}

/// Create a connected pair of ports.
pub fn pair() -> (VethPort, VethPort) {
    let wire = Arc::new(Mutex::new(Wire::default()));
    (
        VethPort {
            idx: 0,
            wire: wire.clone(),
        },
        VethPort { idx: 1, wire },
    )
}

fn do_tx(wire: &Arc<Mutex<Wire>>, idx: usize, frames: Vec<Frame>) -> usize {
    let mut wire = wire.lock().unwrap();
    let n = frames.len();
    for frame in frames {
        wire.sides[idx].stats.tx_packets += 1;
        wire.sides[idx].stats.tx_bytes += frame.data.len() as u64;
        wire.sides[idx ^ 1].inbox.push_back(frame);
    }
    n
}

fn do_rx(wire: &Arc<Mutex<Wire>>, idx: usize, out: &mut Vec<Frame>, max: usize) -> usize {
    let mut wire = wire.lock().unwrap();
    let side = &mut wire.sides[idx];
    let n = side.inbox.len().min(max);
    for _ in 0..n {
        let mut frame = side.inbox.pop_front().unwrap();
        frame.mark = steer(&side.rules, &frame);
        side.stats.rx_packets += 1;
        side.stats.rx_bytes += frame.data.len() as u64;
        out.push(frame);
    }
    n
}

impl RawPort for VethPort {
    fn install_steering(&mut self, rule: &SteeringRule) -> anyhow::Result<RuleHandle> {
        let mut wire = self.wire.lock().unwrap();
        let rules = &mut wire.sides[self.idx].rules;
        rules.push(*rule);
        Ok(RuleHandle(rules.len() - 1))
    }

    fn flush_steering(&mut self) {
        self.wire.lock().unwrap().sides[self.idx].rules.clear();
    }

    fn reset_stats(&mut self) {
        self.wire.lock().unwrap().sides[self.idx].stats = PortStats::default();
    }

    fn stats(&self) -> PortStats {
        self.wire.lock().unwrap().sides[self.idx].stats
    }

    fn tx_burst(&mut self, frames: Vec<Frame>) -> usize {
        do_tx(&self.wire, self.idx, frames)
    }

    fn rx_burst(&mut self, out: &mut Vec<Frame>, max: usize) -> usize {
        do_rx(&self.wire, self.idx, out, max)
    }

    fn split(self: Box<Self>) -> (Box<dyn TxQueue>, Box<dyn RxQueue>, Box<dyn PortCtl>) {
        let tx = VethTx {
            idx: self.idx,
            wire: self.wire.clone(),
        };
        let rx = VethRx {
            idx: self.idx,
            wire: self.wire.clone(),
        };
        let ctl = VethCtl {
            idx: self.idx,
            wire: self.wire,
        };
        (Box::new(tx), Box::new(rx), Box::new(ctl))
    }
}

pub struct VethTx {
    idx: usize,
    wire: Arc<Mutex<Wire>>,
}

impl TxQueue for VethTx {
    fn tx_burst(&mut self, frames: Vec<Frame>) -> usize {
        do_tx(&self.wire, self.idx, frames)
    }
}

pub struct VethRx {
    idx: usize,
    wire: Arc<Mutex<Wire>>,
}

impl RxQueue for VethRx {
    fn rx_burst(&mut self, out: &mut Vec<Frame>, max: usize) -> usize {
        do_rx(&self.wire, self.idx, out, max)
    }
}

pub struct VethCtl {
    idx: usize,
    wire: Arc<Mutex<Wire>>,
}

impl PortCtl for VethCtl {
    fn stats(&self) -> PortStats {
        self.wire.lock().unwrap().sides[self.idx].stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{
        EthernetFrame, Ipv4Address, Ipv4Packet, TcpPacket, ETHERTYPE_IPV4, PROTO_TCP,
    };

    fn tcp_frame(
        src: Ipv4Address,
        dst: Ipv4Address,
        src_port: u16,
        dst_port: u16,
    ) -> Frame {
        let mut frame = Frame::new(54);
        {
            let mut eth = EthernetFrame::new_unchecked(&mut frame.data[..]);
            eth.set_ethertype(ETHERTYPE_IPV4);
        }
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut frame.data[14..]);
            ip.set_ver_ihl_basic();
            ip.set_total_len(40);
            ip.set_next_header(PROTO_TCP);
            ip.set_src_addr(src);
            ip.set_dst_addr(dst);
        }
        {
            let mut tcp = TcpPacket::new_unchecked(&mut frame.data[34..]);
            tcp.set_src_port(src_port);
            tcp.set_dst_port(dst_port);
            tcp.set_header_len(20);
        }
        frame
    }

    #[test]
    fn frames_cross_the_wire_and_get_marked() {
        let (mut client, mut server) = pair();
        let us = Ipv4Address::new(10, 0, 0, 1);
        let peer = Ipv4Address::new(10, 0, 0, 2);
        client
            .install_steering(&SteeringRule {
                src_addr: peer,
                dst_addr: us,
                src_port: 80,
                dst_port: 7,
                mark: 42,
                queue: 0,
            })
            .unwrap();

        // peer -> us, matching the rule
        assert_eq!(server.tx_burst(vec![tcp_frame(peer, us, 80, 7)]), 1);
        // peer -> us, some other flow
        assert_eq!(server.tx_burst(vec![tcp_frame(peer, us, 80, 9)]), 1);

        let mut out = Vec::new();
        assert_eq!(client.rx_burst(&mut out, 32), 2);
        assert_eq!(out[0].mark, Some(42));
        assert_eq!(out[1].mark, None);
        assert_eq!(client.stats().rx_packets, 2);
        assert_eq!(server.stats().tx_packets, 2);
    }

    #[test]
    fn split_halves_share_the_wire() {
        let (client, mut server) = pair();
        let (mut tx, mut rx, ctl) = Box::new(client).split();
        assert!(tx.tx_one(tcp_frame(
            Ipv4Address::new(10, 0, 0, 1),
            Ipv4Address::new(10, 0, 0, 2),
            1,
            2
        )));
        let mut out = Vec::new();
        assert_eq!(server.rx_burst(&mut out, 32), 1);

        server.tx_burst(out.drain(..).collect());
        let mut back = Vec::new();
        assert_eq!(rx.rx_burst(&mut back, 32), 1);
        assert_eq!(ctl.stats().tx_packets, 1);
        assert_eq!(ctl.stats().rx_packets, 1);
    }
}
