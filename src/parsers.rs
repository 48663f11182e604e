//! Text parsing for configuration values.
//!
//! Only the Ethernet address needs a parser of its own; IPv4 addresses
//! and port numbers in the profile ride the standard library's `FromStr`.

use core::result;
use core::str::FromStr;

use crate::wire::EthernetAddress;

type Result<T> = result::Result<T, ()>;

/// One or two hex digits, no sign, no whitespace.
fn parse_octet(part: &str) -> Result<u8> {
    if part.is_empty() || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(());
    }
    u8::from_str_radix(part, 16).map_err(|_| ())
}

impl FromStr for EthernetAddress {
    type Err = ();

    /// Parse `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff`. The separator
    /// may be either character but must be used consistently.
    fn from_str(s: &str) -> Result<EthernetAddress> {
        let separator = if s.contains(':') { ':' } else { '-' };
        let mut parts = s.split(separator);
        let mut octets = [0u8; 6];
        for octet in octets.iter_mut() {
            *octet = parse_octet(parts.next().ok_or(())?)?;
        }
        if parts.next().is_some() {
            return Err(());
        }
        Ok(EthernetAddress(octets))
    }
}
