//! Parsing and raw-form conversion of IPv4 socket addresses.
//!
//! Addresses travel through the public API as strings in `a.b.c.d:port`
//! form. Parsing is lenient about omitted parts: the port defaults to 0,
//! omitted octets default to 0 and the last octet written fills the lowest
//! byte, so `":80"` is `0.0.0.0:80` and `"1.2"` is `1.0.0.2`. Formatting
//! is [`SocketAddrV4`]'s own `Display`, which makes parsing and formatting
//! inverses of each other.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Scan a decimal digit run, returning its value and the rest of the
/// input. An empty run scans as 0; long runs saturate and are rejected by
/// the range checks in [`parse`].
fn scan_num(input: &str) -> (u32, &str) {
    let end = input.find(|c: char| !c.is_ascii_digit()).unwrap_or_else(|| input.len());
    let mut value: u32 = 0;
    for digit in input[..end].bytes() {
        value = value.saturating_mul(10).saturating_add(u32::from(digit - b'0'));
    }
    (value, &input[end..])
}

fn malformed(input: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput,
        format!("malformed IPv4 address: {:?}", input))
}

/// Parse `input` into an IPv4 socket address.
///
/// Accepted forms are `"a.b.c.d:port"`, `"a.b.c.d"` (port 0), `":port"`
/// (address 0.0.0.0) and anything in between; the empty string is
/// `0.0.0.0:0`. More than four octets, octets above 255, ports above
/// 65535 and trailing garbage are rejected.
pub fn parse(input: &str) -> io::Result<SocketAddrV4> {
    let mut octets = [0u32; 4];
    let mut count = 0;
    let mut port = 0;
    let mut rest = input;

    while !rest.is_empty() {
        if rest.starts_with(':') {
            let (value, after) = scan_num(&rest[1..]);
            if !after.is_empty() {
                return Err(malformed(input));
            }
            port = value;
            break;
        }

        if count >= octets.len() {
            return Err(malformed(input));
        }
        let (value, after) = scan_num(rest);
        octets[count] = value;
        count += 1;

        rest = if after.starts_with('.') {
            &after[1..]
        } else if after.is_empty() || after.starts_with(':') {
            after
        } else {
            return Err(malformed(input));
        };
    }

    if octets.iter().any(|&octet| octet > 255) || port > 65_535 {
        return Err(malformed(input));
    }

    // The last octet written is the low byte; the ones before it take
    // their positional byte.
    if count > 1 {
        octets[0] <<= 24;
    }
    if count > 2 {
        octets[1] <<= 16;
    }
    if count > 3 {
        octets[2] <<= 8;
    }
    let host = octets[0] | octets[1] | octets[2] | octets[3];

    Ok(SocketAddrV4::new(Ipv4Addr::from(host), port as u16))
}

/// Convert to the C form used by the socket calls. The structure is
/// zeroed first; some platforms require the unused fields to be zero.
pub(crate) fn to_raw(address: SocketAddrV4) -> libc::sockaddr_in {
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    raw.sin_family = libc::AF_INET as libc::sa_family_t;
    raw.sin_port = address.port().to_be();
    raw.sin_addr = libc::in_addr { s_addr: u32::from(*address.ip()).to_be() };
    raw
}

/// Convert a `sockaddr_in` filled in by the kernel back to the std form.
pub(crate) fn from_raw(raw: &libc::sockaddr_in) -> io::Result<SocketAddrV4> {
    if libc::c_int::from(raw.sin_family) != libc::AF_INET {
        return Err(io::Error::new(io::ErrorKind::InvalidInput,
            format!("unknown address family {}", raw.sin_family)));
    }
    let ip = Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr));
    Ok(SocketAddrV4::new(ip, u16::from_be(raw.sin_port)))
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::{from_raw, parse, to_raw};

    fn parsed(input: &str) -> SocketAddrV4 {
        parse(input).unwrap()
    }

    #[test]
    fn full_form() {
        assert_eq!(parsed("127.0.0.1:8080"),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080));
    }

    #[test]
    fn port_only() {
        assert_eq!(parsed(":123"), SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 123));
    }

    #[test]
    fn address_only() {
        assert_eq!(parsed("1.2.3.4"), SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 0));
    }

    #[test]
    fn partial_octets() {
        assert_eq!(parsed("1.2"), SocketAddrV4::new(Ipv4Addr::new(1, 0, 0, 2), 0));
        assert_eq!(parsed("1.2.3"), SocketAddrV4::new(Ipv4Addr::new(1, 2, 0, 3), 0));
        assert_eq!(parsed("1.2:80"), SocketAddrV4::new(Ipv4Addr::new(1, 0, 0, 2), 80));
        assert_eq!(parsed(""), SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    }

    #[test]
    fn network_order_packing() {
        let raw = to_raw(parsed("123.4.5.255:258"));
        assert_eq!(libc::c_int::from(raw.sin_family), libc::AF_INET);
        assert_eq!(raw.sin_port.to_ne_bytes(), [1, 2]);
        assert_eq!(raw.sin_addr.s_addr.to_ne_bytes(), [123, 4, 5, 255]);
    }

    #[test]
    fn round_trip() {
        let inputs = ["0.0.0.0:0", "127.0.0.1:65535", "10.0.0.1:22", "255.255.255.255:1"];
        for input in &inputs {
            let address = parsed(input);
            assert_eq!(parse(&address.to_string()).unwrap(), address);
            assert_eq!(from_raw(&to_raw(address)).unwrap(), address);
        }
    }

    #[test]
    fn rejects_malformed() {
        let inputs = ["1.2.3.4.5", "256.0.0.1", "1.2.3.4:65536", "hello",
            "1.2.3.4:80x", ":80:90", "1.2.3.4x"];
        for input in &inputs {
            assert!(parse(input).is_err(), "accepted {:?}", input);
        }
    }

    #[test]
    fn rejects_wrong_family() {
        let mut raw = to_raw(parsed("1.2.3.4:5"));
        raw.sin_family = libc::AF_INET6 as libc::sa_family_t;
        assert!(from_raw(&raw).is_err());
    }
}
