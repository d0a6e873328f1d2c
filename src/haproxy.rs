//! HAProxy PROXY protocol, versions 1 (text) and 2 (binary).
//!
//! See <https://haproxy.org/download/1.8/doc/proxy-protocol.txt>.
//!
//! On the client side the proxy can *accept* a header (both versions,
//! auto-detected) that carries the address of the original client one load
//! balancer upstream. On the server side it can *emit* a v1 header so the
//! next hop learns who the original client was.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// The v1 text prefix.
const V1_PREFIX: &[u8] = b"PROXY ";
/// The v2 binary signature.
const V2_SIGNATURE: &[u8] = b"\r\n\r\n\x00\r\nQUIT\n";
/// The maximum length of a v1 header in bytes, CRLF included.
const V1_MAX_LENGTH: usize = 107;

/// A decoded PROXY protocol header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyHeader {
    /// A proxied TCP connection with the original endpoint addresses.
    Tcp {
        /// Address of the original client.
        source: SocketAddr,
        /// Address the original client connected to.
        destination: SocketAddr,
    },
    /// The connection is not proxied (`UNKNOWN` / `LOCAL`); addresses, if
    /// any, are to be ignored.
    Unknown,
}

/// Outcome of a parse attempt over a growing buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// A complete header; `consumed` bytes belong to it.
    Complete {
        /// The decoded header.
        header: ProxyHeader,
        /// Number of bytes the header occupied.
        consumed: usize,
    },
    /// More bytes are needed.
    Partial,
}

/// PROXY protocol violations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProxyProtocolError {
    /// The bytes are neither a v1 nor a v2 header.
    #[error("missing proxy protocol header")]
    MissingHeader,
    /// The header is malformed.
    #[error("malformed proxy protocol header: {0}")]
    Malformed(&'static str),
}

/// Try to parse a PROXY protocol header at the start of `buf`.
pub fn parse(buf: &[u8]) -> Result<Parsed, ProxyProtocolError> {
    if buf.starts_with(V2_SIGNATURE) || (buf.len() < V2_SIGNATURE.len() && V2_SIGNATURE.starts_with(buf)) {
        if buf.len() < 16 {
            return Ok(Parsed::Partial);
        }
        return parse_v2(buf);
    }
    if buf.starts_with(V1_PREFIX) || (buf.len() < V1_PREFIX.len() && V1_PREFIX.starts_with(buf)) {
        return parse_v1(buf);
    }
    Err(ProxyProtocolError::MissingHeader)
}

fn parse_v1(buf: &[u8]) -> Result<Parsed, ProxyProtocolError> {
    let Some(line_end) = buf.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() > V1_MAX_LENGTH {
            return Err(ProxyProtocolError::Malformed("v1 header too long"));
        }
        return Ok(Parsed::Partial);
    };
    let consumed = line_end + 2;
    if consumed > V1_MAX_LENGTH {
        return Err(ProxyProtocolError::Malformed("v1 header too long"));
    }
    let line = std::str::from_utf8(&buf[..line_end])
        .map_err(|_| ProxyProtocolError::Malformed("v1 header is not ascii"))?;

    let mut parts = line.split(' ');
    if parts.next() != Some("PROXY") {
        return Err(ProxyProtocolError::Malformed("missing PROXY prefix"));
    }
    let header = match parts.next() {
        Some("UNKNOWN") => ProxyHeader::Unknown,
        Some(proto @ ("TCP4" | "TCP6")) => {
            let (source, destination) = parse_v1_addresses(proto, &mut parts)?;
            ProxyHeader::Tcp {
                source,
                destination,
            }
        }
        _ => return Err(ProxyProtocolError::Malformed("invalid protocol family")),
    };
    Ok(Parsed::Complete { header, consumed })
}

fn parse_v1_addresses<'a>(
    proto: &str,
    parts: &mut impl Iterator<Item = &'a str>,
) -> Result<(SocketAddr, SocketAddr), ProxyProtocolError> {
    let source_address = parts
        .next()
        .ok_or(ProxyProtocolError::Malformed("missing source address"))?;
    let destination_address = parts
        .next()
        .ok_or(ProxyProtocolError::Malformed("missing destination address"))?;
    let source_port = parse_v1_port(parts.next())?;
    let destination_port = parse_v1_port(parts.next())?;
    if parts.next().is_some() {
        return Err(ProxyProtocolError::Malformed("trailing header fields"));
    }

    let (source, destination) = if proto == "TCP4" {
        (
            IpAddr::V4(parse_v1_ip::<Ipv4Addr>(source_address)?),
            IpAddr::V4(parse_v1_ip::<Ipv4Addr>(destination_address)?),
        )
    } else {
        (
            IpAddr::V6(parse_v1_ip::<Ipv6Addr>(source_address)?),
            IpAddr::V6(parse_v1_ip::<Ipv6Addr>(destination_address)?),
        )
    };
    Ok((
        SocketAddr::new(source, source_port),
        SocketAddr::new(destination, destination_port),
    ))
}

fn parse_v1_ip<T: std::str::FromStr>(s: &str) -> Result<T, ProxyProtocolError> {
    s.parse()
        .map_err(|_| ProxyProtocolError::Malformed("invalid address"))
}

fn parse_v1_port(s: Option<&str>) -> Result<u16, ProxyProtocolError> {
    s.ok_or(ProxyProtocolError::Malformed("missing port"))?
        .parse()
        .map_err(|_| ProxyProtocolError::Malformed("invalid port"))
}

fn parse_v2(buf: &[u8]) -> Result<Parsed, ProxyProtocolError> {
    let ver_cmd = buf[12];
    if ver_cmd >> 4 != 0x2 {
        return Err(ProxyProtocolError::Malformed("unsupported v2 version"));
    }
    let family = buf[13];
    let len = usize::from(u16::from_be_bytes([buf[14], buf[15]]));
    let consumed = 16 + len;
    if buf.len() < consumed {
        return Ok(Parsed::Partial);
    }
    let addresses = &buf[16..consumed];

    // LOCAL command: addresses are to be ignored
    if ver_cmd & 0x0f == 0x0 {
        return Ok(Parsed::Complete {
            header: ProxyHeader::Unknown,
            consumed,
        });
    }
    if ver_cmd & 0x0f != 0x1 {
        return Err(ProxyProtocolError::Malformed("unsupported v2 command"));
    }

    let header = match family {
        // TCP over IPv4
        0x11 => {
            if addresses.len() < 12 {
                return Err(ProxyProtocolError::Malformed("short v2 ipv4 block"));
            }
            let source = Ipv4Addr::new(addresses[0], addresses[1], addresses[2], addresses[3]);
            let destination =
                Ipv4Addr::new(addresses[4], addresses[5], addresses[6], addresses[7]);
            let source_port = u16::from_be_bytes([addresses[8], addresses[9]]);
            let destination_port = u16::from_be_bytes([addresses[10], addresses[11]]);
            ProxyHeader::Tcp {
                source: SocketAddr::new(IpAddr::V4(source), source_port),
                destination: SocketAddr::new(IpAddr::V4(destination), destination_port),
            }
        }
        // TCP over IPv6
        0x21 => {
            if addresses.len() < 36 {
                return Err(ProxyProtocolError::Malformed("short v2 ipv6 block"));
            }
            let mut source = [0u8; 16];
            source.copy_from_slice(&addresses[..16]);
            let mut destination = [0u8; 16];
            destination.copy_from_slice(&addresses[16..32]);
            let source_port = u16::from_be_bytes([addresses[32], addresses[33]]);
            let destination_port = u16::from_be_bytes([addresses[34], addresses[35]]);
            ProxyHeader::Tcp {
                source: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(source)), source_port),
                destination: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(destination)), destination_port),
            }
        }
        // UDP, unix sockets, unspecified: carried but not interpreted
        _ => ProxyHeader::Unknown,
    };
    Ok(Parsed::Complete { header, consumed })
}

/// Encode a v1 header announcing the given endpoints to the next hop.
#[must_use]
pub fn encode_v1(source: SocketAddr, destination: SocketAddr) -> String {
    match (source, destination) {
        (SocketAddr::V4(s), SocketAddr::V4(d)) => format!(
            "PROXY TCP4 {} {} {} {}\r\n",
            s.ip(),
            d.ip(),
            s.port(),
            d.port()
        ),
        (SocketAddr::V6(s), SocketAddr::V6(d)) => format!(
            "PROXY TCP6 {} {} {} {}\r\n",
            s.ip(),
            d.ip(),
            s.port(),
            d.port()
        ),
        _ => "PROXY UNKNOWN\r\n".to_owned(),
    }
}
