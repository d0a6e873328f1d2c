//! The proxy-to-server half: resolution, dialing, chain iteration,
//! optional TLS, and the connection object the client driver relays
//! through.

use super::{ConnectionState, StateMachine};
use crate::chain::{ChainCandidate, ChainedProxy};
use crate::dns::HostResolver;
use crate::error::ProxyError;
use crate::filter::HttpFilters;
use crate::http::codec::ClientCodec;
use crate::http::frame::RequestHead;
use crate::net::HostAndPort;
use crate::server::ProxyCore;
use crate::shaper::throttled::Throttled;
use crate::stream::{BoxedStream, IdleMeter, Instrumented, Prefixed};
use crate::tls::TlsInfo;
use crate::tracker::{FlowContext, FullFlowContext};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::codec::Framed;

/// An established proxy-to-server connection.
pub(crate) struct Upstream {
    pub(crate) framed: Framed<BoxedStream, ClientCodec>,
    pub(crate) host: HostAndPort,
    pub(crate) chained: Option<Arc<dyn ChainedProxy>>,
    pub(crate) full_flow: FullFlowContext,
    pub(crate) tls_info: Option<TlsInfo>,
    pub(crate) state: StateMachine,
    /// Cleared when the upstream told us (or we told it) to close.
    pub(crate) reusable: bool,
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("host", &self.host)
            .field("chained", &self.chained.as_ref().map(|c| c.chained_proxy_address()))
            .field("reusable", &self.reusable)
            .finish_non_exhaustive()
    }
}

impl Upstream {
    /// Whether requests to this upstream travel through a chained proxy
    /// (and therefore keep their absolute-form request-target).
    pub(crate) fn is_chained(&self) -> bool {
        self.chained.is_some()
    }

    /// Upgrade the established transport to TLS towards `host`, replaying
    /// any bytes the codec had already buffered.
    ///
    /// Used for the MITM re-encryption of CONNECT targets, both on direct
    /// hops and inside a chained proxy's tunnel.
    pub(crate) async fn start_tls(
        &mut self,
        config: Arc<rustls::ClientConfig>,
        host: &HostAndPort,
        limits: crate::http::CodecLimits,
    ) -> Result<(), ProxyError> {
        self.state.transition(ConnectionState::HandshakingTls);
        let parts = std::mem::replace(
            &mut self.framed,
            Framed::new(Box::new(tokio::io::empty()) as BoxedStream, ClientCodec::new(limits)),
        )
        .into_parts();
        let stream = Prefixed::new(parts.read_buf.freeze(), parts.io);
        let (tls, info) = crate::tls::connect(config, host, stream)
            .await
            .map_err(ProxyError::TlsHandshake)?;
        self.tls_info = Some(info);
        self.framed = Framed::new(tls, ClientCodec::new(limits));
        self.state.transition(ConnectionState::AwaitingInitial);
        Ok(())
    }
}

/// Establish an upstream connection for the given request, walking the
/// chain candidates in order and falling back as they fail.
pub(crate) async fn connect(
    core: &Arc<ProxyCore>,
    flow: &FlowContext,
    head: &RequestHead,
    authority: &HostAndPort,
    filters: &mut dyn HttpFilters,
    meter: &Arc<IdleMeter>,
) -> Result<Upstream, ProxyError> {
    let mut candidates = core.config.chain_manager.lookup(head, flow);
    if candidates.is_empty() {
        candidates.push(ChainCandidate::Direct);
    }
    filters.proxy_to_server_connection_queued();

    let mut last_error = ProxyError::Connection {
        host: authority.to_string(),
        reason: "no chain candidate available".to_owned(),
    };

    for candidate in candidates {
        match try_candidate(core, flow, authority, &candidate, filters, meter).await {
            Ok(upstream) => {
                if let ChainCandidate::Proxied(proxied) = &candidate {
                    proxied.connection_succeeded();
                }
                filters.proxy_to_server_connection_succeeded();
                return Ok(upstream);
            }
            Err(err) => {
                tracing::debug!(
                    connection = flow.connection_id,
                    candidate = ?candidate,
                    "upstream candidate failed: {err}"
                );
                if let ChainCandidate::Proxied(proxied) = &candidate {
                    proxied.connection_failed(&err);
                }
                filters.proxy_to_server_connection_failed();
                last_error = err;
            }
        }
    }
    Err(last_error)
}

async fn try_candidate(
    core: &Arc<ProxyCore>,
    flow: &FlowContext,
    authority: &HostAndPort,
    candidate: &ChainCandidate,
    filters: &mut dyn HttpFilters,
    meter: &Arc<IdleMeter>,
) -> Result<Upstream, ProxyError> {
    // resolve
    let (address, chained) = match candidate {
        ChainCandidate::Direct => {
            let address = match filters.proxy_to_server_resolution_started(authority) {
                Some(resolved) => resolved,
                None => match core.config.resolver.resolve(authority.clone()).await {
                    Ok(resolved) => resolved,
                    Err(source) => {
                        filters.proxy_to_server_resolution_failed(authority);
                        return Err(ProxyError::Resolution {
                            host: authority.to_string(),
                            source,
                        });
                    }
                },
            };
            filters.proxy_to_server_resolution_succeeded(authority, address);
            (address, None)
        }
        ChainCandidate::Proxied(proxied) => {
            let address = proxied.chained_proxy_address();
            filters.proxy_to_server_resolution_succeeded(authority, address);
            (address, Some(proxied.clone()))
        }
    };

    // dial, on the proxy-to-server worker pool
    filters.proxy_to_server_connection_started(address);
    let tcp = dial(core, address).await?;

    let full_flow = FullFlowContext {
        flow: flow.clone(),
        server_host_and_port: authority.clone(),
        chained_proxy: chained.as_ref().map(|c| c.chained_proxy_address()),
    };

    // instrument and shape the raw transport
    let trackers = core.trackers.clone();
    let ff = full_flow.clone();
    let on_read: crate::stream::ByteSink = Arc::new(move |n| {
        for tracker in trackers.iter() {
            tracker.bytes_received_from_server(&ff, n);
        }
    });
    let trackers = core.trackers.clone();
    let ff = full_flow.clone();
    let on_write: crate::stream::ByteSink = Arc::new(move |n| {
        for tracker in trackers.iter() {
            tracker.bytes_sent_to_server(&ff, n);
        }
    });
    let mut stream: BoxedStream = Box::new(Instrumented::new(
        Throttled::new(tcp, core.shaper.clone()),
        meter.clone(),
        on_read,
        on_write,
    ));

    // announce the original client to the next hop, before anything else
    if core.config.send_proxy_protocol {
        let header = crate::haproxy::encode_v1(flow.client_address, address);
        stream.write_all(header.as_bytes()).await?;
    }

    // encrypted chain hop
    if let Some(proxied) = &chained
        && proxied.requires_encryption()
    {
        filters.proxy_to_server_connection_ssl_handshake_started();
        let config = proxied.tls_config().ok_or_else(|| ProxyError::Connection {
            host: authority.to_string(),
            reason: "chained proxy requires encryption but provides no tls config".to_owned(),
        })?;
        let hop = HostAndPort::from(address);
        let (tls, _) = crate::tls::connect(config, &hop, stream)
            .await
            .map_err(|err| ProxyError::Connection {
                host: authority.to_string(),
                reason: format!("tls handshake with chained proxy failed: {err}"),
            })?;
        stream = tls;
    }

    let mut state = StateMachine::new(flow.connection_id, "proxy-to-server", ConnectionState::Connecting);
    state.transition(ConnectionState::AwaitingInitial);

    Ok(Upstream {
        framed: Framed::new(stream, ClientCodec::new(core.config.limits)),
        host: authority.clone(),
        chained,
        full_flow,
        tls_info: None,
        state,
        reusable: true,
    })
}

async fn dial(core: &Arc<ProxyCore>, address: SocketAddr) -> Result<TcpStream, ProxyError> {
    let interface = core.config.network_interface;
    let connect = core.group.server_handle().spawn(async move {
        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(ip) = interface {
            socket.bind(SocketAddr::new(ip, 0))?;
        }
        socket.connect(address).await
    });

    let tcp = tokio::time::timeout(core.config.connect_timeout, connect)
        .await
        .map_err(|_| ProxyError::Connection {
            host: address.to_string(),
            reason: "connect timed out".to_owned(),
        })?
        .map_err(|err| ProxyError::Fatal(format!("dial task failed: {err}")))?
        .map_err(|err| ProxyError::Connection {
            host: address.to_string(),
            reason: err.to_string(),
        })?;
    let _ = tcp.set_nodelay(true);
    Ok(tcp)
}
