/*! Low-level packet access and construction.

The `wire` module deals with the packet *representation*: functions to
extract fields from sequences of octets and to insert fields into sequences
of octets, through the `Packet` family of structures ([EthernetFrame],
[Ipv4Packet], [TcpPacket]).

The `Packet` family guarantees that, if `check_len()` returned `Ok(())`,
no accessor or setter method will panic. When parsing frames pulled off a
port it is *necessary* to use `new_checked()`; when emitting into a buffer
sized by the caller, `new_unchecked()` is used and the buffer length is the
caller's contract.

[EthernetFrame]: struct.EthernetFrame.html
[Ipv4Packet]: struct.Ipv4Packet.html
[TcpPacket]: struct.TcpPacket.html
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
    pub type Rest = ::core::ops::RangeFrom<usize>;
}

use core::fmt;

mod ethernet;
pub use self::ethernet::{
    Address as EthernetAddress, Frame as EthernetFrame, ETHERTYPE_IPV4,
    HEADER_LEN as ETHERNET_HEADER_LEN,
};

pub(crate) mod ipv4;
pub use self::ipv4::{
    Address as Ipv4Address, Packet as Ipv4Packet, HEADER_LEN as IPV4_HEADER_LEN, PROTO_TCP,
};

pub mod tcp;
pub use self::tcp::{
    Packet as TcpPacket, SeqNumber as TcpSeqNumber, HEADER_LEN as TCP_HEADER_LEN,
};

pub mod payload;

/// Parsing a packet failed.
///
/// Either it is malformed, or it is not supported by this generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;
