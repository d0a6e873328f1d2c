//! Upstream proxy chaining.
//!
//! For every request the configured [`ChainedProxyManager`] produces an
//! ordered list of [`ChainCandidate`]s. The upstream connector walks the
//! list: resolve, dial, optionally handshake TLS; the first candidate that
//! comes up wins. [`ChainCandidate::Direct`] is the fallback-to-direct
//! sentinel, letting a chain degrade to a direct origin connection after
//! its proxies failed. An empty list means "no chain, dial direct".

use crate::error::ProxyError;
use crate::http::RequestHead;
use crate::tracker::FlowContext;
use std::net::SocketAddr;
use std::sync::Arc;

/// One upstream proxy endpoint the engine may chain through.
#[allow(unused_variables)]
pub trait ChainedProxy: Send + Sync + 'static {
    /// Address of the chained proxy.
    fn chained_proxy_address(&self) -> SocketAddr;

    /// Whether the hop to this proxy itself must be TLS encrypted.
    fn requires_encryption(&self) -> bool {
        false
    }

    /// The TLS client configuration for an encrypted hop.
    /// Required when [`Self::requires_encryption`] returns `true`.
    fn tls_config(&self) -> Option<Arc<rustls::ClientConfig>> {
        None
    }

    /// Hook invoked right before a request head is sent through this proxy;
    /// may rewrite it (e.g. to inject per-hop credentials).
    fn filter_request(&self, request: &mut RequestHead) {}

    /// This candidate served a connection successfully.
    fn connection_succeeded(&self) {}

    /// Connecting through this candidate failed; the next one is tried.
    fn connection_failed(&self, error: &ProxyError) {}
}

/// An entry of the candidate list produced by a [`ChainedProxyManager`].
#[derive(Clone)]
pub enum ChainCandidate {
    /// Chain through the given upstream proxy.
    Proxied(Arc<dyn ChainedProxy>),
    /// Connect straight to the origin.
    Direct,
}

impl std::fmt::Debug for ChainCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proxied(proxied) => f
                .debug_tuple("Proxied")
                .field(&proxied.chained_proxy_address())
                .finish(),
            Self::Direct => f.write_str("Direct"),
        }
    }
}

/// Produces the ordered chain candidates for a request.
pub trait ChainedProxyManager: Send + Sync + 'static {
    /// The candidates to try, in order. Return an empty list to force a
    /// direct connection.
    fn lookup(&self, request: &RequestHead, flow: &FlowContext) -> Vec<ChainCandidate>;
}

/// Chain manager forcing direct connections; the default when none is
/// configured.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct DirectOnly;

impl ChainedProxyManager for DirectOnly {
    fn lookup(&self, _: &RequestHead, _: &FlowContext) -> Vec<ChainCandidate> {
        Vec::new()
    }
}
