//! Activity tracking: passive observation hooks over everything the proxy
//! does, invoked synchronously on the owning connection's driver task.
//!
//! Trackers must tolerate out-of-order teardown: on an aborted exchange
//! `client_disconnected` may arrive before `response_sent_to_client`.

use crate::http::{RequestHead, ResponseHead};
use crate::net::HostAndPort;
use crate::tls::TlsInfo;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

/// Identity and transport facts of one client connection.
#[derive(Debug, Clone)]
pub struct FlowContext {
    /// Address the client connected from (or the address carried by an
    /// accepted PROXY protocol header).
    pub client_address: SocketAddr,
    /// TLS session on the client leg, when encrypted.
    pub client_tls: Option<TlsInfo>,
    /// Monotonic identifier of the client connection within its proxy.
    pub connection_id: u64,
}

impl PartialEq for FlowContext {
    fn eq(&self, other: &Self) -> bool {
        self.connection_id == other.connection_id
    }
}

impl Eq for FlowContext {}

impl Hash for FlowContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.connection_id.hash(state);
    }
}

/// [`FlowContext`] plus the upstream half, once one exists.
#[derive(Debug, Clone)]
pub struct FullFlowContext {
    /// The client-side flow.
    pub flow: FlowContext,
    /// Upstream target of the exchange.
    pub server_host_and_port: HostAndPort,
    /// Address of the chained proxy in use, when not dialing direct.
    pub chained_proxy: Option<SocketAddr>,
}

impl PartialEq for FullFlowContext {
    fn eq(&self, other: &Self) -> bool {
        self.flow == other.flow
    }
}

impl Eq for FullFlowContext {}

impl Hash for FullFlowContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.flow.hash(state);
    }
}

/// Observation hooks over the proxy's activity.
///
/// All methods default to no-ops; implement the ones you care about.
/// Hooks run synchronously on driver tasks and must not block.
#[allow(unused_variables)]
pub trait ActivityTracker: Send + Sync + 'static {
    /// A client connected.
    fn client_connected(&self, flow: &FlowContext) {}
    /// The client-leg TLS handshake completed.
    fn client_ssl_handshake_succeeded(&self, flow: &FlowContext) {}
    /// A full request head was read from the client.
    fn request_received_from_client(&self, flow: &FlowContext, request: &RequestHead) {}
    /// A request head was written upstream.
    fn request_sent_to_server(&self, flow: &FullFlowContext, request: &RequestHead) {}
    /// A response head arrived from upstream.
    fn response_received_from_server(&self, flow: &FullFlowContext, response: &ResponseHead) {}
    /// A response head was written to the client.
    fn response_sent_to_client(&self, flow: &FlowContext, response: &ResponseHead) {}
    /// The client connection went away.
    fn client_disconnected(&self, flow: &FlowContext) {}
    /// Raw bytes read from the client socket.
    fn bytes_received_from_client(&self, flow: &FlowContext, count: usize) {}
    /// Raw bytes written to an upstream socket.
    fn bytes_sent_to_server(&self, flow: &FullFlowContext, count: usize) {}
    /// Raw bytes read from an upstream socket.
    fn bytes_received_from_server(&self, flow: &FullFlowContext, count: usize) {}
    /// Raw bytes written to the client socket.
    fn bytes_sent_to_client(&self, flow: &FlowContext, count: usize) {}
}

/// The fan-out set of trackers registered on a proxy instance.
pub(crate) type TrackerSet = Arc<Vec<Arc<dyn ActivityTracker>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn flow_identity_is_the_connection_id() {
        let a = FlowContext {
            client_address: "127.0.0.1:1111".parse().unwrap(),
            client_tls: None,
            connection_id: 7,
        };
        let b = FlowContext {
            client_address: "127.0.0.1:2222".parse().unwrap(),
            client_tls: None,
            connection_id: 7,
        };
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }
}
