//! TLS integration points.
//!
//! Two mutually exclusive roles exist on the client-facing leg:
//!
//! - [`TlsSource`] encrypts the leg itself (clients speak TLS *to* the
//!   proxy, knowingly);
//! - [`MitmManager`] terminates the TLS a client tries to tunnel *through*
//!   the proxy with CONNECT, re-encrypts towards the origin, and exposes
//!   the decrypted exchange to the filter chain.
//!
//! The engine never builds certificates itself; both traits are the seam
//! where key material enters from the outside.

use crate::error::BoxError;
use crate::http::RequestHead;
use crate::net::{Host, HostAndPort};
use crate::stream::{BoxedStream, Stream};
use rustls_pki_types::{IpAddr as PkiIpAddr, ServerName};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Provides the server-side TLS configuration of an encrypted
/// client-facing leg.
pub trait TlsSource: Send + Sync + 'static {
    /// The rustls configuration to accept client connections with.
    ///
    /// `require_client_auth` reflects the proxy's
    /// `authenticate_ssl_clients` setting.
    fn server_config(&self, require_client_auth: bool) -> Result<Arc<rustls::ServerConfig>, BoxError>;
}

/// Drives TLS interception of CONNECT tunnels.
pub trait MitmManager: Send + Sync + 'static {
    /// Client configuration for the proxy-to-server TLS session towards
    /// the tunneled origin.
    fn upstream_config(&self, authority: &HostAndPort) -> Result<Arc<rustls::ClientConfig>, BoxError>;

    /// Server configuration for the client-facing TLS session, impersonating
    /// the origin named by the CONNECT `request`. `upstream` describes the
    /// established proxy-to-server session.
    fn client_config(
        &self,
        request: &RequestHead,
        upstream: &TlsInfo,
    ) -> Result<Arc<rustls::ServerConfig>, BoxError>;
}

/// Facts about an established TLS session, surfaced to flow contexts,
/// trackers and the [`MitmManager`].
#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
    /// Negotiated protocol version.
    pub protocol: Option<rustls::ProtocolVersion>,
    /// Negotiated ALPN protocol, if any.
    pub alpn: Option<Vec<u8>>,
    /// SNI server name sent by the client (server sessions only).
    pub server_name: Option<String>,
}

impl TlsInfo {
    fn from_common(conn: &rustls::CommonState) -> Self {
        Self {
            protocol: conn.protocol_version(),
            alpn: conn.alpn_protocol().map(<[u8]>::to_vec),
            server_name: None,
        }
    }
}

/// Accept a TLS session on an inbound stream.
pub(crate) async fn accept<S: Stream>(
    config: Arc<rustls::ServerConfig>,
    stream: S,
) -> Result<(BoxedStream, TlsInfo), BoxError> {
    let acceptor = TlsAcceptor::from(config);
    let tls = acceptor.accept(stream).await?;
    let (_, conn) = tls.get_ref();
    let mut info = TlsInfo::from_common(conn);
    info.server_name = conn.server_name().map(ToOwned::to_owned);
    Ok((Box::new(tls), info))
}

/// Open a TLS session over an outbound stream.
pub(crate) async fn connect<S: Stream>(
    config: Arc<rustls::ClientConfig>,
    host: &HostAndPort,
    stream: S,
) -> Result<(BoxedStream, TlsInfo), BoxError> {
    let connector = TlsConnector::from(config);
    let name = server_name(host)?;
    let tls = connector.connect(name, stream).await?;
    let (_, conn) = tls.get_ref();
    let info = TlsInfo::from_common(conn);
    Ok((Box::new(tls), info))
}

fn server_name(host: &HostAndPort) -> Result<ServerName<'static>, BoxError> {
    match host.host() {
        Host::Name(name) => Ok(ServerName::try_from(name.clone())?),
        Host::Address(ip) => Ok(ServerName::IpAddress(PkiIpAddr::from(*ip))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_from_host() {
        let host = HostAndPort::from_header("example.com:443", 443).unwrap();
        assert!(matches!(
            server_name(&host).unwrap(),
            ServerName::DnsName(_)
        ));

        let host = HostAndPort::from_header("127.0.0.1:443", 443).unwrap();
        assert!(matches!(
            server_name(&host).unwrap(),
            ServerName::IpAddress(_)
        ));
    }
}
