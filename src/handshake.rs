//! User-space 3-way handshake.
//!
//! Runs single-threaded against the unsplit port, one flow at a time, and
//! returns only when every flow is Established. The drive workers are
//! spawned strictly afterwards, so none of this needs the atomics'
//! cross-thread guarantees; they are simply the same fields the workers
//! will use later.

use anyhow::{bail, Result};
use log::{debug, warn};

use crate::config::NetConfig;
use crate::flow::{FlowTable, TcpState};
use crate::packet::{build_handshake_ack, build_syn};
use crate::port::{Frame, RawPort};
use crate::time::rdtsc;
use crate::wire::{tcp, EthernetFrame, Ipv4Packet, TcpPacket, ETHERTYPE_IPV4, PROTO_TCP};

pub const HANDSHAKE_TIMEOUT_US: u64 = 500_000;
pub const HANDSHAKE_RETRANSMISSION: u32 = 4;

#[derive(Debug, Clone, Copy)]
pub struct HandshakeConfig {
    pub timeout_us: u64,
    /// Total SYN attempts per flow, the initial transmission included.
    pub max_attempts: u32,
}

impl Default for HandshakeConfig {
    fn default() -> HandshakeConfig {
        HandshakeConfig {
            timeout_us: HANDSHAKE_TIMEOUT_US,
            max_attempts: HANDSHAKE_RETRANSMISSION,
        }
    }
}

const BURST_SIZE: usize = 32;

/// Establish every flow in the table, then zero the port counters so the
/// handshake traffic stays out of the run statistics.
pub fn establish_all(
    port: &mut dyn RawPort,
    table: &mut FlowTable,
    net: &NetConfig,
    ticks_per_us: u64,
    cfg: &HandshakeConfig,
) -> Result<()> {
    port.flush_steering();

    for i in 0..table.len() {
        port.install_steering(&table.rules[i])?;

        if port.tx_burst(vec![build_syn(&table.tx[i], net)]) != 1 {
            bail!("cannot transmit the SYN packet for flow {i}");
        }
        table.shared[i].set_state(TcpState::SynSent);

        let mut attempts = 1u32;
        let mut deadline = rdtsc() + cfg.timeout_us * ticks_per_us;
        let mut frames = Vec::with_capacity(BURST_SIZE);

        while table.shared[i].state() != TcpState::Established {
            frames.clear();
            port.rx_burst(&mut frames, BURST_SIZE);
            for frame in &frames {
                if let Some(ack) = process_syn_ack(frame, table, net) {
                    if port.tx_burst(vec![ack]) != 1 {
                        bail!("cannot transmit the ACK packet for flow {i}");
                    }
                }
            }

            if rdtsc() > deadline {
                if attempts == cfg.max_attempts {
                    bail!("cannot establish connection on flow {i}");
                }
                attempts += 1;
                warn!("flow {i}: retransmitting SYN, attempt {attempts}");
                if port.tx_burst(vec![build_syn(&table.tx[i], net)]) != 1 {
                    bail!("cannot transmit the SYN packet for flow {i}");
                }
                deadline = rdtsc() + cfg.timeout_us * ticks_per_us;
            }
        }
        debug!("flow {i}: established after {attempts} attempt(s)");
    }

    port.reset_stats();
    Ok(())
}

/// Examine one received frame; if it is the SYN+ACK a flow in SynSent is
/// waiting for, advance that flow and return the completing ACK.
///
/// Frames without a steering mark, duplicate SYN+ACKs for flows already
/// Established, and anything that is not IPv4/TCP are ignored.
fn process_syn_ack(frame: &Frame, table: &mut FlowTable, net: &NetConfig) -> Option<Frame> {
    let eth = EthernetFrame::new_checked(&frame.data[..]).ok()?;
    if eth.ethertype() != ETHERTYPE_IPV4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
    if ip.next_header() != PROTO_TCP {
        return None;
    }
    let hdr = TcpPacket::new_checked(ip.payload()).ok()?;

    let idx = frame.mark? as usize;
    if idx >= table.len() {
        return None;
    }

    let shared = &table.shared[idx];
    if shared.state() != TcpState::SynSent || hdr.flags() != tcp::FLAG_SYN | tcp::FLAG_ACK {
        return None;
    }

    shared.set_state(TcpState::Established);
    let seq = hdr.seq_number();
    table.rx[idx].last_seq_recv = seq;
    shared.set_next_ack(seq + 1);

    Some(build_handshake_ack(&mut table.tx[idx], shared, net))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::veth;
    use crate::wire::{EthernetAddress, Ipv4Address, TcpSeqNumber};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn net() -> NetConfig {
        NetConfig {
            src_ether: EthernetAddress([2, 0, 0, 0, 0, 1]),
            dst_ether: EthernetAddress([2, 0, 0, 0, 0, 2]),
            src_ip: Ipv4Address::new(10, 0, 0, 1),
            dst_ip: Ipv4Address::new(10, 0, 0, 2),
            dst_port: 7777,
        }
    }

    /// Reply to every SYN seen on `peer` with a well-formed SYN+ACK until
    /// `stop` flips. Returns the number of SYNs seen.
    fn serve_syn_acks(
        peer: &mut veth::VethPort,
        net: &NetConfig,
        peer_isn: u32,
        stop: &AtomicBool,
        mute_first: usize,
    ) -> usize {
        let mut seen = 0;
        let mut frames = Vec::new();
        while !stop.load(Ordering::Relaxed) {
            frames.clear();
            peer.rx_burst(&mut frames, 32);
            for frame in &frames {
                let eth = EthernetFrame::new_checked(&frame.data[..]).unwrap();
                let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
                let hdr = TcpPacket::new_checked(ip.payload()).unwrap();
                if hdr.flags() != tcp::FLAG_SYN {
                    continue;
                }
                seen += 1;
                if seen <= mute_first {
                    continue;
                }
                let mut reply = Frame::new(54);
                {
                    let mut eth = EthernetFrame::new_unchecked(&mut reply.data[..]);
                    eth.set_dst_addr(net.src_ether);
                    eth.set_src_addr(net.dst_ether);
                    eth.set_ethertype(ETHERTYPE_IPV4);
                    let mut rip = Ipv4Packet::new_unchecked(&mut reply.data[14..]);
                    rip.set_ver_ihl_basic();
                    rip.set_total_len(40);
                    rip.set_next_header(PROTO_TCP);
                    rip.set_src_addr(net.dst_ip);
                    rip.set_dst_addr(net.src_ip);
                    let mut rtcp = TcpPacket::new_unchecked(&mut reply.data[34..]);
                    rtcp.set_src_port(net.dst_port);
                    rtcp.set_dst_port(hdr.src_port());
                    rtcp.set_seq_number(TcpSeqNumber(peer_isn));
                    rtcp.set_ack_number(hdr.seq_number() + 1);
                    rtcp.set_header_len(20);
                    rtcp.set_flags(tcp::FLAG_SYN | tcp::FLAG_ACK);
                    rtcp.set_window_len(0xffff);
                }
                peer.tx_burst(vec![reply]);
            }
            std::thread::yield_now();
        }
        seen
    }

    #[test]
    fn all_flows_establish() {
        let (mut client, mut peer) = veth::pair();
        let net = net();
        let mut rng = StdRng::seed_from_u64(5);
        let mut table = FlowTable::new(4, &net, &mut rng);

        let stop = Arc::new(AtomicBool::new(false));
        let server = {
            let net = net;
            let stop = stop.clone();
            std::thread::spawn(move || serve_syn_acks(&mut peer, &net, 5000, &stop, 0))
        };

        let cfg = HandshakeConfig {
            timeout_us: 50_000,
            max_attempts: 4,
        };
        let tpus = crate::time::calibrate_ticks_per_us();
        establish_all(&mut client, &mut table, &net, tpus, &cfg).unwrap();
        stop.store(true, Ordering::Relaxed);
        let syns = server.join().unwrap();

        assert_eq!(syns, 4);
        for i in 0..table.len() {
            assert_eq!(table.shared[i].state(), TcpState::Established);
            // SYN consumed one sequence number
            assert_eq!(
                table.tx[i].next_seq,
                TcpSeqNumber(table.tx[i].seq_ini) + 1
            );
            // acking the peer ISN + 1
            assert_eq!(table.shared[i].next_ack(), TcpSeqNumber(5001));
        }
        // three handshake frames per flow crossed the wire, then counters
        // were reset
        assert_eq!(client.stats().tx_packets, 0);
    }

    #[test]
    fn silent_peer_forces_retransmissions_then_success() {
        let (mut client, mut peer) = veth::pair();
        let net = net();
        let mut rng = StdRng::seed_from_u64(6);
        let mut table = FlowTable::new(1, &net, &mut rng);

        let stop = Arc::new(AtomicBool::new(false));
        let server = {
            let net = net;
            let stop = stop.clone();
            // ignore the first three SYNs; answer the fourth
            std::thread::spawn(move || serve_syn_acks(&mut peer, &net, 1, &stop, 3))
        };

        let cfg = HandshakeConfig {
            timeout_us: 20_000,
            max_attempts: 4,
        };
        let tpus = crate::time::calibrate_ticks_per_us();
        establish_all(&mut client, &mut table, &net, tpus, &cfg).unwrap();
        stop.store(true, Ordering::Relaxed);
        let syns = server.join().unwrap();

        assert_eq!(syns, 4, "three retransmissions after the initial SYN");
        assert_eq!(table.shared[0].state(), TcpState::Established);
    }

    #[test]
    fn dead_peer_exhausts_the_syn_retries() {
        let (mut client, _peer) = veth::pair();
        let net = net();
        let mut rng = StdRng::seed_from_u64(7);
        let mut table = FlowTable::new(1, &net, &mut rng);

        let cfg = HandshakeConfig {
            timeout_us: 5_000,
            max_attempts: 4,
        };
        let tpus = crate::time::calibrate_ticks_per_us();
        let err = establish_all(&mut client, &mut table, &net, tpus, &cfg).unwrap_err();
        assert!(err.to_string().contains("cannot establish"));
        // initial + three retransmissions
        assert_eq!(client.stats().tx_packets, 4);
    }

    #[test]
    fn duplicate_syn_ack_is_ignored() {
        let (mut client, mut peer) = veth::pair();
        let net = net();
        let mut rng = StdRng::seed_from_u64(8);
        let mut table = FlowTable::new(1, &net, &mut rng);

        // run a normal handshake
        let stop = Arc::new(AtomicBool::new(false));
        let server = {
            let net = net;
            let stop = stop.clone();
            std::thread::spawn(move || {
                serve_syn_acks(&mut peer, &net, 777, &stop, 0);
            })
        };
        let cfg = HandshakeConfig {
            timeout_us: 50_000,
            max_attempts: 4,
        };
        let tpus = crate::time::calibrate_ticks_per_us();
        establish_all(&mut client, &mut table, &net, tpus, &cfg).unwrap();
        stop.store(true, Ordering::Relaxed);
        server.join().unwrap();

        let next_seq = table.tx[0].next_seq;
        // replay the SYN+ACK: the flow is Established, nothing must change
        let mut dup = Frame::new(54);
        dup.mark = Some(0);
        {
            let mut eth = EthernetFrame::new_unchecked(&mut dup.data[..]);
            eth.set_ethertype(ETHERTYPE_IPV4);
            let mut ip = Ipv4Packet::new_unchecked(&mut dup.data[14..]);
            ip.set_ver_ihl_basic();
            ip.set_total_len(40);
            ip.set_next_header(PROTO_TCP);
            ip.set_src_addr(net.dst_ip);
            ip.set_dst_addr(net.src_ip);
            let mut hdr = TcpPacket::new_unchecked(&mut dup.data[34..]);
            hdr.set_seq_number(TcpSeqNumber(777));
            hdr.set_header_len(20);
            hdr.set_flags(tcp::FLAG_SYN | tcp::FLAG_ACK);
        }
        assert!(process_syn_ack(&dup, &mut table, &net).is_none());
        assert_eq!(table.tx[0].next_seq, next_seq);
    }
}
