//! The filter chain: per-request observation and mutation hooks.
//!
//! A [`HttpFiltersSource`] is consulted once per original client request and
//! hands out one [`HttpFilters`] instance bound to exactly that request.
//! Follow-up requests on the same connection get fresh instances; the
//! response hooks of a request are guaranteed to run on the same instance
//! that saw the request.
//!
//! All hooks run on the client connection's driver task and must not block.

use crate::http::{LocalResponse, RequestFrame, RequestHead, ResponseFrame};
use crate::net::HostAndPort;
use crate::tracker::FlowContext;
use std::net::SocketAddr;

/// Lifecycle hooks over one proxied request/response exchange.
///
/// Frame hooks receive mutable frames: mutate in place (or replace the
/// frame wholesale) to rewrite traffic. The two request-side hooks may
/// short-circuit by returning a [`LocalResponse`], which is delivered to
/// the client instead of anything the upstream would have said.
#[allow(unused_variables)]
pub trait HttpFilters: Send + 'static {
    /// A request frame arrived from the client.
    /// Return a response to short-circuit the exchange.
    fn client_to_proxy_request(&mut self, frame: &mut RequestFrame) -> Option<LocalResponse> {
        None
    }

    /// A request frame is about to be written upstream.
    /// Return a response to short-circuit the exchange.
    fn proxy_to_server_request(&mut self, frame: &mut RequestFrame) -> Option<LocalResponse> {
        None
    }

    /// The request head is being handed to the transport.
    fn proxy_to_server_request_sending(&mut self) {}

    /// The full request has been written to the transport.
    fn proxy_to_server_request_sent(&mut self) {}

    /// A response frame arrived from the upstream.
    fn server_to_proxy_response(&mut self, frame: &mut ResponseFrame) {}

    /// A response frame is about to be written to the client.
    fn proxy_to_client_response(&mut self, frame: &mut ResponseFrame) {}

    /// Host resolution is starting. Return an address to override it.
    fn proxy_to_server_resolution_started(&mut self, host: &HostAndPort) -> Option<SocketAddr> {
        None
    }

    /// Host resolution succeeded.
    fn proxy_to_server_resolution_succeeded(&mut self, host: &HostAndPort, address: SocketAddr) {}

    /// Host resolution failed; a `502` follows.
    fn proxy_to_server_resolution_failed(&mut self, host: &HostAndPort) {}

    /// An upstream connection is needed and has been queued for dialing.
    fn proxy_to_server_connection_queued(&mut self) {}

    /// Dialing the given address has started.
    fn proxy_to_server_connection_started(&mut self, address: SocketAddr) {}

    /// The upstream TLS handshake has started.
    fn proxy_to_server_connection_ssl_handshake_started(&mut self) {}

    /// The upstream connection (including TLS, when required) is up.
    fn proxy_to_server_connection_succeeded(&mut self) {}

    /// An upstream connection attempt failed. Called once per failed
    /// chain candidate; the engine moves on to the next candidate.
    fn proxy_to_server_connection_failed(&mut self) {}

    /// No response head arrived in time; a `504` follows.
    fn server_to_proxy_response_timed_out(&mut self) {}

    /// The first bytes of the response are being received.
    fn server_to_proxy_response_receiving(&mut self) {}

    /// The response has been received in full.
    fn server_to_proxy_response_received(&mut self) {}

    /// Whether a CONNECT to this destination may be intercepted (MITM).
    /// Returning `false` forces an opaque tunnel.
    fn proxy_to_server_allow_mitm(&mut self) -> bool {
        true
    }
}

/// Filters that never observe nor mutate anything.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct NoopFilters;

impl HttpFilters for NoopFilters {}

/// Produces the [`HttpFilters`] instance bound to each original request.
pub trait HttpFiltersSource: Send + Sync + 'static {
    /// Create the filter instance for this request.
    fn filter_request(&self, request: &RequestHead, flow: &FlowContext) -> Box<dyn HttpFilters>;

    /// When nonzero, request bodies are aggregated up to this many bytes
    /// and presented to the filters as a single full message.
    fn max_request_buffer_size(&self) -> usize {
        0
    }

    /// When nonzero, response bodies are aggregated up to this many bytes
    /// and presented to the filters as a single full message.
    fn max_response_buffer_size(&self) -> usize {
        0
    }
}

/// Source of [`NoopFilters`]; the default when none is configured.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct NoopFiltersSource;

impl HttpFiltersSource for NoopFiltersSource {
    fn filter_request(&self, _: &RequestHead, _: &FlowContext) -> Box<dyn HttpFilters> {
        Box::new(NoopFilters)
    }
}
