//! The dual-channel connection engine.
//!
//! Every accepted client socket is driven by exactly one task running
//! [`client::run`], which owns both halves of the pair: it reads and writes
//! the client-to-proxy connection directly, and it creates, reuses and
//! retires [`upstream::Upstream`] connections for the proxy-to-server half.
//! All state transitions, filter hooks and tracker hooks for a connection
//! happen on that task.

pub(crate) mod client;
pub(crate) mod upstream;

use std::fmt;

/// Protocol state of one connection half.
///
/// The same state set serves both halves; each half only visits the subset
/// that makes sense for its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the head of the next message.
    AwaitingInitial,
    /// Reading body chunks of the current inbound message.
    AwaitingChunk,
    /// Relaying body chunks of the proxied response.
    AwaitingProxyChunk,
    /// The transport is being established.
    Connecting,
    /// A TLS handshake is in flight.
    HandshakingTls,
    /// A CONNECT request is being negotiated with the upstream.
    NegotiatingConnect,
    /// A CONNECT was forwarded to a chained proxy; awaiting its verdict.
    AwaitingConnectOk,
    /// Opaque byte relay; nothing is parsed as HTTP.
    Tunneling,
    /// The connection is gone.
    Disconnected,
    /// Teardown has been requested and is in progress.
    DisconnectRequested,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracked state of one connection half, mostly a tracing aid: every
/// transition is logged at trace level against the owning connection.
#[derive(Debug)]
pub(crate) struct StateMachine {
    connection_id: u64,
    half: &'static str,
    state: ConnectionState,
}

impl StateMachine {
    pub(crate) fn new(connection_id: u64, half: &'static str, state: ConnectionState) -> Self {
        Self {
            connection_id,
            half,
            state,
        }
    }

    pub(crate) fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        tracing::trace!(
            connection = self.connection_id,
            half = self.half,
            "state {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }

    pub(crate) fn current(&self) -> ConnectionState {
        self.state
    }
}

/// How an exchange left the client connection behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExchangeEnd {
    /// The connection can serve another request.
    KeepAlive,
    /// The connection must be closed.
    Close,
}
