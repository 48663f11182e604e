//! Outbound frame assembly.
//!
//! Every frame the generator emits is built here from a flow's transmit
//! view: SYN and bare-ACK frames for the handshake, PSH|ACK data frames
//! for the drive phase. IPv4 and TCP checksums are left zero for the
//! port's offload to fill in.

use crate::config::NetConfig;
use crate::flow::{FlowShared, FlowTx};
use crate::port::Frame;
use crate::wire::{
    tcp, EthernetFrame, Ipv4Packet, TcpPacket, TcpSeqNumber, ETHERNET_HEADER_LEN, ETHERTYPE_IPV4,
    IPV4_HEADER_LEN, PROTO_TCP, TCP_HEADER_LEN,
};

/// Offset of the TCP header within a frame.
const TCP_OFFSET: usize = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN;

fn emit_eth_ipv4(frame: &mut [u8], net: &NetConfig, flow: &FlowTx, ip_total_len: u16) {
    let mut eth = EthernetFrame::new_unchecked(&mut frame[..]);
    eth.set_dst_addr(net.dst_ether);
    eth.set_src_addr(net.src_ether);
    eth.set_ethertype(ETHERTYPE_IPV4);

    let mut ip = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..]);
    ip.set_ver_ihl_basic();
    ip.set_total_len(ip_total_len);
    ip.set_ident(0);
    ip.clear_flags();
    ip.set_hop_limit(255);
    ip.set_next_header(PROTO_TCP);
    ip.clear_checksum();
    ip.set_src_addr(flow.src_addr);
    ip.set_dst_addr(flow.dst_addr);
}

/// Build the SYN opening a flow: window-scale and MSS options, sequence
/// number at the flow's initial value.
pub fn build_syn(flow: &FlowTx, net: &NetConfig) -> Frame {
    let len = TCP_OFFSET + tcp::SYN_HEADER_LEN;
    let mut frame = Frame::new(len);
    emit_eth_ipv4(
        &mut frame.data,
        net,
        flow,
        (IPV4_HEADER_LEN + tcp::SYN_HEADER_LEN) as u16,
    );

    let mut hdr = TcpPacket::new_unchecked(&mut frame.data[TCP_OFFSET..]);
    hdr.set_src_port(flow.src_port);
    hdr.set_dst_port(flow.dst_port);
    hdr.set_seq_number(TcpSeqNumber(flow.seq_ini));
    hdr.set_ack_number(TcpSeqNumber(0));
    hdr.set_header_len(tcp::SYN_HEADER_LEN as u8);
    hdr.set_flags(tcp::FLAG_SYN);
    hdr.set_window_len(0xffff);
    hdr.clear_checksum();
    hdr.clear_urgent();
    hdr.emit_syn_options();
    frame
}

/// Build the bare ACK that completes the handshake. Consumes one sequence
/// number: the flow's `next_seq` advances past the SYN.
pub fn build_handshake_ack(flow: &mut FlowTx, shared: &FlowShared, net: &NetConfig) -> Frame {
    let len = TCP_OFFSET + TCP_HEADER_LEN;
    let mut frame = Frame::new(len);
    emit_eth_ipv4(
        &mut frame.data,
        net,
        flow,
        (IPV4_HEADER_LEN + TCP_HEADER_LEN) as u16,
    );

    flow.next_seq = flow.next_seq + 1;

    let mut hdr = TcpPacket::new_unchecked(&mut frame.data[TCP_OFFSET..]);
    hdr.set_src_port(flow.src_port);
    hdr.set_dst_port(flow.dst_port);
    hdr.set_seq_number(flow.next_seq);
    hdr.set_ack_number(shared.next_ack());
    hdr.set_header_len(TCP_HEADER_LEN as u8);
    hdr.set_flags(tcp::FLAG_ACK);
    hdr.set_window_len(0xffff);
    hdr.clear_checksum();
    hdr.clear_urgent();
    frame
}

/// Build one data frame and advance the flow's sequence number by the
/// payload size. The acknowledgement field is left zero; [refresh_ack]
/// stamps it immediately before transmit.
///
/// Frames too short to hold all six measurement words are padded with an
/// Ethernet trailer past the IP datagram; the IP total length still
/// reflects `frame_size`.
pub fn build_data(flow: &mut FlowTx, net: &NetConfig, frame_size: usize) -> Frame {
    let mut frame = Frame::new(frame_size.max(crate::wire::payload::REQUEST_LEN));
    emit_eth_ipv4(
        &mut frame.data,
        net,
        flow,
        (frame_size - ETHERNET_HEADER_LEN) as u16,
    );

    let payload_size = frame_size - TCP_OFFSET - TCP_HEADER_LEN;
    let seq = flow.next_seq;
    flow.next_seq = seq + payload_size;

    let mut hdr = TcpPacket::new_unchecked(&mut frame.data[TCP_OFFSET..]);
    hdr.set_src_port(flow.src_port);
    hdr.set_dst_port(flow.dst_port);
    hdr.set_seq_number(seq);
    hdr.set_ack_number(TcpSeqNumber(0));
    hdr.set_header_len(TCP_HEADER_LEN as u8);
    hdr.set_flags(tcp::FLAG_PSH | tcp::FLAG_ACK);
    hdr.set_window_len(0xffff);
    hdr.clear_checksum();
    hdr.clear_urgent();
    frame
}

/// Stamp the latest acknowledgement number into an already-built frame.
pub fn refresh_ack(frame: &mut Frame, ack: TcpSeqNumber) {
    let mut hdr = TcpPacket::new_unchecked(&mut frame.data[TCP_OFFSET..]);
    hdr.set_ack_number(ack);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::EthernetAddress;

    fn fixture() -> (FlowTx, NetConfig) {
        let net = NetConfig {
            src_ether: EthernetAddress([2, 0, 0, 0, 0, 1]),
            dst_ether: EthernetAddress([2, 0, 0, 0, 0, 2]),
            src_ip: crate::wire::Ipv4Address::new(10, 0, 0, 1),
            dst_ip: crate::wire::Ipv4Address::new(10, 0, 0, 2),
            dst_port: 7777,
        };
        let flow = FlowTx {
            src_addr: net.src_ip,
            dst_addr: net.dst_ip,
            src_port: 1,
            dst_port: net.dst_port,
            seq_ini: 1000,
            next_seq: TcpSeqNumber(1000),
        };
        (flow, net)
    }

    #[test]
    fn syn_carries_options_and_isn() {
        let (flow, net) = fixture();
        let frame = build_syn(&flow, &net);
        assert_eq!(frame.data.len(), 62);

        let eth = EthernetFrame::new_checked(&frame.data[..]).unwrap();
        assert_eq!(eth.ethertype(), ETHERTYPE_IPV4);
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(ip.total_len(), 48);
        let hdr = TcpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(hdr.flags(), tcp::FLAG_SYN);
        assert_eq!(hdr.seq_number(), TcpSeqNumber(1000));
        assert_eq!(hdr.header_len() as usize, tcp::SYN_HEADER_LEN);
    }

    #[test]
    fn data_frame_advances_seq_by_payload() {
        let (mut flow, net) = fixture();
        let frame = build_data(&mut flow, &net, 96);
        // 96 requested, padded out so all six payload words fit
        assert_eq!(frame.data.len(), 102);
        assert_eq!(flow.next_seq, TcpSeqNumber(1000 + 42));

        let hdr = TcpPacket::new_unchecked(&frame.data[34..]);
        assert_eq!(hdr.flags(), tcp::FLAG_PSH | tcp::FLAG_ACK);
        assert_eq!(hdr.seq_number(), TcpSeqNumber(1000));

        let second = build_data(&mut flow, &net, 96);
        let hdr = TcpPacket::new_unchecked(&second.data[34..]);
        assert_eq!(hdr.seq_number(), TcpSeqNumber(1042));
    }

    #[test]
    fn ack_refresh_touches_only_the_ack_field() {
        let (mut flow, net) = fixture();
        let mut frame = build_data(&mut flow, &net, 96);
        let before = frame.data.clone();
        refresh_ack(&mut frame, TcpSeqNumber(0xabcd));
        let hdr = TcpPacket::new_unchecked(&frame.data[34..]);
        assert_eq!(hdr.ack_number(), TcpSeqNumber(0xabcd));
        // everything but bytes 42..46 (the ack field) unchanged
        assert_eq!(&frame.data[..42], &before[..42]);
        assert_eq!(&frame.data[46..], &before[46..]);
    }
}
