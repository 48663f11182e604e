//! Receive path: ingest and parser, joined by a single-producer
//! single-consumer ring.
//!
//! Ingest does as little as possible per frame: pull a burst, stamp the
//! arrival timestamp into the payload, enqueue. The parser does the
//! protocol work on its own core: validation, per-flow receive state, and
//! the latency record. After the quit flag flips the parser drains the
//! ring to empty so no in-flight response is lost.

use std::sync::atomic::Ordering;

use anyhow::{bail, Result};
use heapless::spsc::{Consumer, Producer, Queue};

use crate::flow::{FlowRx, FlowShared};
use crate::measure::LatencyRecord;
use crate::port::{Frame, RxQueue};
use crate::run::RunCtx;
use crate::time::rdtsc;
use crate::wire::{payload, EthernetFrame, Ipv4Packet, TcpPacket, ETHERTYPE_IPV4, PROTO_TCP};

pub const BURST_SIZE: usize = 32;
pub const RING_ELEMENTS: usize = 32 * 1024;

pub type RxProducer = Producer<'static, Frame, RING_ELEMENTS>;
pub type RxConsumer = Consumer<'static, Frame, RING_ELEMENTS>;

/// Allocate the ring for one run and split it into its two halves.
///
/// The backing storage is leaked; a run owns its ring for the process
/// lifetime, which is exactly the lifetime a generator run has.
pub fn rx_ring() -> (RxProducer, RxConsumer) {
    let queue: &'static mut Queue<Frame, RING_ELEMENTS> = Box::leak(Box::new(Queue::new()));
    queue.split()
}

/// Ingest loop: burst-receive, timestamp, enqueue.
pub fn run_ingest(queue: &mut dyn RxQueue, ring: &mut RxProducer, ctx: &RunCtx) -> Result<()> {
    let mut frames = Vec::with_capacity(BURST_SIZE);

    while !ctx.quit.load(Ordering::Relaxed) {
        frames.clear();
        let nb_rx = queue.rx_burst(&mut frames, BURST_SIZE);
        if nb_rx == 0 {
            core::hint::spin_loop();
            continue;
        }

        let now = rdtsc();
        for mut frame in frames.drain(..) {
            // short frames (bare ACKs) carry no payload to stamp; the
            // parser drops them anyway
            if frame.data.len() >= payload::MEASURE_LEN {
                payload::set(&mut frame.data, payload::WORD_RX_TSC, now);
            }
            if ring.enqueue(frame).is_err() {
                bail!("cannot enqueue the packet to the parser ring");
            }
        }
    }
    Ok(())
}

/// Parser loop: dequeue, validate, update flow state, record latency.
pub fn run_parser(
    ring: &mut RxConsumer,
    flows: &mut [FlowRx],
    shared: &[FlowShared],
    records: &mut Vec<LatencyRecord>,
    ctx: &RunCtx,
) {
    loop {
        while let Some(frame) = ring.dequeue() {
            process_frame(&frame, flows, shared, records, ctx);
        }
        if ctx.quit.load(Ordering::Relaxed) {
            // one final drain; the producer stops right after the flag
            while let Some(frame) = ring.dequeue() {
                process_frame(&frame, flows, shared, records, ctx);
            }
            return;
        }
        core::hint::spin_loop();
    }
}

/// Handle one frame. Returns true if a measurement record was appended.
pub fn process_frame(
    frame: &Frame,
    flows: &mut [FlowRx],
    shared: &[FlowShared],
    records: &mut Vec<LatencyRecord>,
    ctx: &RunCtx,
) -> bool {
    let Ok(eth) = EthernetFrame::new_checked(&frame.data[..]) else {
        return false;
    };
    if eth.ethertype() != ETHERTYPE_IPV4 {
        return false;
    }
    let Ok(ip) = Ipv4Packet::new_checked(eth.payload()) else {
        return false;
    };
    if ip.next_header() != PROTO_TCP {
        return false;
    }
    let Ok(hdr) = TcpPacket::new_checked(ip.payload()) else {
        return false;
    };

    // do not process empty packets
    let payload_len = ip.payload().len() - hdr.header_len() as usize;
    if payload_len == 0 || frame.data.len() < payload::MEASURE_LEN {
        return false;
    }

    // the flow index the steering table assigned on arrival
    let Some(mark) = frame.mark else {
        return false;
    };
    let idx = mark as usize;
    if idx >= flows.len() {
        return false;
    }

    // sanity check against the id the server echoed back
    if mark as u64 != payload::get(&frame.data, payload::WORD_FLOW_ID) {
        ctx.rx_dropped.fetch_add(1, Ordering::Relaxed);
        return false;
    }

    shared[idx].set_rwin(hdr.window_len());

    // retransmits and reorders leave the receive state alone
    let seq = hdr.seq_number();
    if flows[idx].last_seq_recv.lt(seq) {
        flows[idx].last_seq_recv = seq;
    }
    flows[idx].last_ack_recv = hdr.ack_number();

    let ack_cur = shared[idx].next_ack();
    let ack_new = seq + payload_len;
    if ack_cur.leq(ack_new) {
        shared[idx].set_next_ack(ack_new);
    }

    records.push(LatencyRecord {
        tx_tsc: payload::get(&frame.data, payload::WORD_TX_TSC),
        rx_tsc: payload::get(&frame.data, payload::WORD_RX_TSC),
        flow_id: mark as u64,
        worker_id: payload::get(&frame.data, payload::WORD_WORKER_ID),
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::flow::FlowTable;
    use crate::wire::{tcp, EthernetAddress, Ipv4Address, TcpSeqNumber};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn netcfg() -> NetConfig {
        NetConfig {
            src_ether: EthernetAddress([2, 0, 0, 0, 0, 1]),
            dst_ether: EthernetAddress([2, 0, 0, 0, 0, 2]),
            src_ip: Ipv4Address::new(10, 0, 0, 1),
            dst_ip: Ipv4Address::new(10, 0, 0, 2),
            dst_port: 7777,
        }
    }

    /// A 96-byte reply frame as the server would send it.
    fn reply(seq: u32, win: u16, flow: u32, tx_tsc: u64, rx_tsc: u64) -> Frame {
        let net = netcfg();
        let mut frame = Frame::new(96);
        frame.mark = Some(flow);
        {
            let mut eth = EthernetFrame::new_unchecked(&mut frame.data[..]);
            eth.set_ethertype(ETHERTYPE_IPV4);
            let mut ip = Ipv4Packet::new_unchecked(&mut frame.data[14..]);
            ip.set_ver_ihl_basic();
            ip.set_total_len(82);
            ip.set_next_header(PROTO_TCP);
            ip.set_src_addr(net.dst_ip);
            ip.set_dst_addr(net.src_ip);
            let mut hdr = TcpPacket::new_unchecked(&mut frame.data[34..]);
            hdr.set_src_port(net.dst_port);
            hdr.set_dst_port(1);
            hdr.set_seq_number(TcpSeqNumber(seq));
            hdr.set_header_len(20);
            hdr.set_flags(tcp::FLAG_PSH | tcp::FLAG_ACK);
            hdr.set_window_len(win);
        }
        payload::set(&mut frame.data, payload::WORD_TX_TSC, tx_tsc);
        payload::set(&mut frame.data, payload::WORD_RX_TSC, rx_tsc);
        payload::set(&mut frame.data, payload::WORD_FLOW_ID, flow as u64);
        payload::set(&mut frame.data, payload::WORD_WORKER_ID, 0x0b);
        frame
    }

    fn fixture() -> (FlowTable, RunCtx) {
        let mut rng = StdRng::seed_from_u64(9);
        let table = FlowTable::new(2, &netcfg(), &mut rng);
        (table, RunCtx::new(1000, 96))
    }

    #[test]
    fn a_reply_becomes_a_record_and_updates_the_flow() {
        let (mut table, ctx) = fixture();
        let mut records = Vec::new();
        let frame = reply(500, 4096, 1, 10_000, 17_000);
        assert!(process_frame(
            &frame,
            &mut table.rx,
            &table.shared,
            &mut records,
            &ctx
        ));

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tx_tsc, 10_000);
        assert_eq!(records[0].rx_tsc, 17_000);
        assert_eq!(records[0].flow_id, 1);
        assert_eq!(records[0].worker_id, 0x0b);

        assert_eq!(table.shared[1].rwin(), 4096);
        assert_eq!(table.rx[1].last_seq_recv, TcpSeqNumber(500));
        // 82 total - 20 ip - 20 tcp = 42 bytes of payload
        assert_eq!(table.shared[1].next_ack(), TcpSeqNumber(500 + 42));
    }

    #[test]
    fn mark_and_payload_disagreement_drops_the_record() {
        let (mut table, ctx) = fixture();
        let mut records = Vec::new();
        let mut frame = reply(500, 4096, 1, 10, 20);
        frame.mark = Some(0); // steering says flow 0, payload says flow 1
        assert!(!process_frame(
            &frame,
            &mut table.rx,
            &table.shared,
            &mut records,
            &ctx
        ));
        assert!(records.is_empty());
        assert_eq!(ctx.rx_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unmarked_and_empty_frames_are_ignored() {
        let (mut table, ctx) = fixture();
        let mut records = Vec::new();

        let mut unmarked = reply(500, 4096, 0, 10, 20);
        unmarked.mark = None;
        assert!(!process_frame(
            &unmarked,
            &mut table.rx,
            &table.shared,
            &mut records,
            &ctx
        ));

        // a bare ACK: 54 bytes, no payload
        let mut empty = Frame::new(54);
        empty.mark = Some(0);
        {
            let mut eth = EthernetFrame::new_unchecked(&mut empty.data[..]);
            eth.set_ethertype(ETHERTYPE_IPV4);
            let mut ip = Ipv4Packet::new_unchecked(&mut empty.data[14..]);
            ip.set_ver_ihl_basic();
            ip.set_total_len(40);
            ip.set_next_header(PROTO_TCP);
            let mut hdr = TcpPacket::new_unchecked(&mut empty.data[34..]);
            hdr.set_header_len(20);
            hdr.set_flags(tcp::FLAG_ACK);
        }
        assert!(!process_frame(
            &empty,
            &mut table.rx,
            &table.shared,
            &mut records,
            &ctx
        ));
        assert!(records.is_empty());
    }

    #[test]
    fn retransmits_do_not_move_state_backwards() {
        let (mut table, ctx) = fixture();
        let mut records = Vec::new();

        assert!(process_frame(
            &reply(1000, 100, 0, 1, 2),
            &mut table.rx,
            &table.shared,
            &mut records,
            &ctx
        ));
        let ack_after_first = table.shared[0].next_ack();

        // an older (retransmitted) segment still yields a record but must
        // not regress last_seq_recv or next_ack
        assert!(process_frame(
            &reply(500, 100, 0, 3, 4),
            &mut table.rx,
            &table.shared,
            &mut records,
            &ctx
        ));
        assert_eq!(table.rx[0].last_seq_recv, TcpSeqNumber(1000));
        assert_eq!(table.shared[0].next_ack(), ack_after_first);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn parser_drains_the_ring_after_quit() {
        let (mut table, ctx) = fixture();
        let (mut prod, mut cons) = rx_ring();
        for i in 0..10u32 {
            prod.enqueue(reply(1000 + i * 42, 100, 0, i as u64, i as u64 + 5))
                .map_err(|_| ())
                .unwrap();
        }
        ctx.quit.store(true, Ordering::Relaxed);

        let mut records = Vec::new();
        run_parser(&mut cons, &mut table.rx, &table.shared, &mut records, &ctx);
        assert_eq!(records.len(), 10);
    }
}
