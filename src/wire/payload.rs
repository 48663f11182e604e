//! Measurement payload carried in every data frame.
//!
//! Eight-byte little-endian words starting right after the TCP header.
//! Word 3 is written by the server; everything else by this generator.

use byteorder::{ByteOrder, LittleEndian};

use super::{ETHERNET_HEADER_LEN, IPV4_HEADER_LEN, TCP_HEADER_LEN};

/// Byte offset of word 0 from the start of the frame.
pub const OFFSET: usize = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + TCP_HEADER_LEN;

pub const WORD_TX_TSC: usize = 0;
pub const WORD_RX_TSC: usize = 1;
pub const WORD_FLOW_ID: usize = 2;
pub const WORD_WORKER_ID: usize = 3;
pub const WORD_ITERATIONS: usize = 4;
pub const WORD_RANDOMNESS: usize = 5;

/// Number of payload words.
pub const WORDS: usize = 6;

/// Octets a frame must have for the words the receive path reads back
/// (tx/rx timestamps, flow id, worker id).
pub const MEASURE_LEN: usize = OFFSET + (WORD_WORKER_ID + 1) * 8;

/// Octets a request frame must have to carry all six words. Below the
/// 102-octet mark the tail rides as Ethernet trailer padding past the IP
/// datagram.
pub const REQUEST_LEN: usize = OFFSET + WORDS * 8;

/// Read payload word `idx` of a full frame.
#[inline]
pub fn get(frame: &[u8], idx: usize) -> u64 {
    let at = OFFSET + idx * 8;
    LittleEndian::read_u64(&frame[at..at + 8])
}

/// Write payload word `idx` of a full frame.
#[inline]
pub fn set(frame: &mut [u8], idx: usize, value: u64) {
    let at = OFFSET + idx * 8;
    LittleEndian::write_u64(&mut frame[at..at + 8], value)
}
