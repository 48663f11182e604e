use byteorder::{ByteOrder, NetworkEndian};

pub use core::net::Ipv4Addr as Address;

use super::{Error, Result};

/// Protocol number of TCP in the IPv4 header.
pub const PROTO_TCP: u8 = 6;

/// A read/write wrapper around an Internet Protocol version 4 packet buffer.
///
/// Only the 20-byte option-less header is supported on the emit side; the
/// parse side honors the IHL field.
#[derive(Debug, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    use crate::wire::field::*;

    pub const VER_IHL: usize = 0;
    pub const DSCP_ECN: usize = 1;
    pub const LENGTH: Field = 2..4;
    pub const IDENT: Field = 4..6;
    pub const FLG_OFF: Field = 6..8;
    pub const TTL: usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: Field = 10..12;
    pub const SRC_ADDR: Field = 12..16;
    pub const DST_ADDR: Field = 16..20;
}

pub const HEADER_LEN: usize = field::DST_ADDR.end;

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with IPv4 packet structure.
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    /// Returns `Err(Error)` if the buffer is shorter than the header the
    /// IHL field declares.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            Err(Error)
        } else if (self.header_len() as usize) < HEADER_LEN {
            Err(Error)
        } else if len < self.header_len() as usize {
            Err(Error)
        } else {
            Ok(())
        }
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the version field.
    pub fn version(&self) -> u8 {
        self.buffer.as_ref()[field::VER_IHL] >> 4
    }

    /// Return the header length, in octets.
    pub fn header_len(&self) -> u8 {
        (self.buffer.as_ref()[field::VER_IHL] & 0x0f) * 4
    }

    /// Return the total length field.
    pub fn total_len(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::LENGTH])
    }

    /// Return the time to live field.
    pub fn hop_limit(&self) -> u8 {
        self.buffer.as_ref()[field::TTL]
    }

    /// Return the next_header (protocol) field.
    pub fn next_header(&self) -> u8 {
        self.buffer.as_ref()[field::PROTOCOL]
    }

    /// Return the source address field.
    pub fn src_addr(&self) -> Address {
        let data = self.buffer.as_ref();
        Address::from_bits(NetworkEndian::read_u32(&data[field::SRC_ADDR]))
    }

    /// Return the destination address field.
    pub fn dst_addr(&self) -> Address {
        let data = self.buffer.as_ref();
        Address::from_bits(NetworkEndian::read_u32(&data[field::DST_ADDR]))
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// Return a pointer to the payload, honoring the IHL and total-length
    /// fields. A total length beyond the buffer (a damaged or lying
    /// header) is clamped rather than trusted.
    pub fn payload(&self) -> &'a [u8] {
        let data = self.buffer.as_ref();
        let start = self.header_len() as usize;
        let end = (self.total_len() as usize).clamp(start, data.len());
        &data[start..end]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the version and header length fields for an option-less header.
    pub fn set_ver_ihl_basic(&mut self) {
        self.buffer.as_mut()[field::VER_IHL] = 0x45;
        self.buffer.as_mut()[field::DSCP_ECN] = 0;
    }

    /// Set the total length field.
    pub fn set_total_len(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::LENGTH], value)
    }

    /// Set the fragment identification field.
    pub fn set_ident(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::IDENT], value)
    }

    /// Clear the fragmentation flags and offset.
    pub fn clear_flags(&mut self) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::FLG_OFF], 0)
    }

    /// Set the time to live field.
    pub fn set_hop_limit(&mut self, value: u8) {
        self.buffer.as_mut()[field::TTL] = value
    }

    /// Set the next_header (protocol) field.
    pub fn set_next_header(&mut self, value: u8) {
        self.buffer.as_mut()[field::PROTOCOL] = value
    }

    /// Zero the header checksum; it is filled in by the port's offload.
    pub fn clear_checksum(&mut self) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::CHECKSUM], 0)
    }

    /// Set the source address field.
    pub fn set_src_addr(&mut self, value: Address) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::SRC_ADDR], value.to_bits())
    }

    /// Set the destination address field.
    pub fn set_dst_addr(&mut self, value: Address) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::DST_ADDR], value.to_bits())
    }
}
