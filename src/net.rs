//! Network address types used across the engine.
//!
//! [`HostAndPort`] is the key under which upstream connections are created,
//! reused and torn down. It intentionally keeps the distinction between a
//! named host and an IP address: named hosts still need resolution, IP
//! literals short-circuit it.

use crate::error::ProxyError;
use http::Uri;
use http::uri::Scheme;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// A host: either a (domain) name or an IP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// A host name, not yet resolved.
    Name(String),
    /// An IP address literal.
    Address(IpAddr),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Address(IpAddr::V4(ip)) => write!(f, "{ip}"),
            Self::Address(IpAddr::V6(ip)) => write!(f, "[{ip}]"),
        }
    }
}

/// A [`Host`] with an associated port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAndPort {
    host: Host,
    port: u16,
}

impl HostAndPort {
    /// Creates a new [`HostAndPort`].
    #[must_use]
    pub const fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }

    /// Gets the [`Host`] reference.
    #[must_use]
    pub const fn host(&self) -> &Host {
        &self.host
    }

    /// Gets the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The socket address, available without resolution only for IP literals.
    #[must_use]
    pub const fn socket_addr(&self) -> Option<SocketAddr> {
        match self.host {
            Host::Address(ip) => Some(SocketAddr::new(ip, self.port)),
            Host::Name(_) => None,
        }
    }

    /// Extract the target host and port from a request [`Uri`],
    /// falling back to the given default port when the URI carries none.
    ///
    /// Handles all three request-target forms the proxy deals with:
    /// absolute-form (`http://example.com/path`), authority-form
    /// (`example.com:443`, as used by CONNECT) and an explicit `Host` value.
    pub fn from_uri(uri: &Uri, default_port: u16) -> Result<Self, ProxyError> {
        let authority = uri
            .authority()
            .ok_or_else(|| ProxyError::ClientProtocol("request-target lacks a host".into()))?;
        let port = authority
            .port_u16()
            .unwrap_or_else(|| scheme_default_port(uri.scheme()).unwrap_or(default_port));
        parse_host(authority.host()).map(|host| Self::new(host, port))
    }

    /// Parse a `host[:port]` string, as carried by a `Host` header.
    pub fn from_header(value: &str, default_port: u16) -> Result<Self, ProxyError> {
        let value = value.trim();
        if let Some(rest) = value.strip_prefix('[') {
            // bracketed IPv6 literal, optionally followed by `:port`
            let end = rest.find(']').ok_or_else(|| {
                ProxyError::ClientProtocol(format!("unterminated ipv6 host {value:?}"))
            })?;
            let host = parse_host(&value[..end + 2])?;
            let port = match &rest[end + 1..] {
                "" => default_port,
                s => parse_port(s.strip_prefix(':'), value)?,
            };
            return Ok(Self::new(host, port));
        }
        // more than one colon means a bare IPv6 literal without a port
        if value.matches(':').count() > 1 {
            return Ok(Self::new(parse_host(value)?, default_port));
        }
        match value.split_once(':') {
            None => Ok(Self::new(parse_host(value)?, default_port)),
            Some((host, port)) => Ok(Self::new(
                parse_host(host)?,
                parse_port(Some(port), value)?,
            )),
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for HostAndPort {
    fn from(addr: SocketAddr) -> Self {
        Self::new(Host::Address(addr.ip()), addr.port())
    }
}

fn scheme_default_port(scheme: Option<&Scheme>) -> Option<u16> {
    let scheme = scheme?;
    if *scheme == Scheme::HTTP {
        Some(80)
    } else if *scheme == Scheme::HTTPS {
        Some(443)
    } else {
        None
    }
}

fn parse_port(port: Option<&str>, raw: &str) -> Result<u16, ProxyError> {
    port.and_then(|p| p.parse().ok())
        .ok_or_else(|| ProxyError::ClientProtocol(format!("invalid port in host {raw:?}")))
}

fn parse_host(s: &str) -> Result<Host, ProxyError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ProxyError::ClientProtocol("empty host".into()));
    }
    let host = if let Some(v6) = s.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        Host::Address(IpAddr::V6(Ipv6Addr::from_str(v6).map_err(|_| {
            ProxyError::ClientProtocol(format!("invalid ipv6 host {s:?}"))
        })?))
    } else if let Ok(ip) = IpAddr::from_str(s) {
        Host::Address(ip)
    } else {
        Host::Name(s.to_owned())
    };
    Ok(host)
}

/// Whether the peer qualifies as "local" for the `allow_local_only` gate:
/// loopback and link-local addresses do, anything else is remote.
#[must_use]
pub(crate) fn is_local_peer(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => ip.is_loopback() || ip.is_link_local(),
        IpAddr::V6(ip) => {
            ip.is_loopback()
                // fe80::/10
                || (ip.segments()[0] & 0xffc0) == 0xfe80
                || ip.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback() || v4.is_link_local())
        }
    }
}
