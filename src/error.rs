//! Error taxonomy of the proxy engine.
//!
//! Errors are always confined to the connection that produced them: a failed
//! exchange synthesizes a response (or resets the socket) and tears the owning
//! connection down, it never propagates into the worker runtimes or takes the
//! proxy down with it.
//!
//! At trait boundaries (resolvers, TLS sources, filters sources) the engine
//! accepts any error type erased as a [`BoxError`], mirroring how middleware
//! stacks keep wrapped error types opaque.

use http::StatusCode;

/// Type-erased error, used at the seams where the concrete type is not
/// important, only the fact that an error occurred.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The error taxonomy of the connection engine.
///
/// Each variant maps to a well-defined recovery strategy, see
/// [`ProxyError::response_status`] for the client-visible half of it.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProxyError {
    /// Malformed request, oversized head, or an origin-form request-target
    /// while not acting as an origin gateway. Answered with `400` and a close.
    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    /// Credentials missing or rejected by the configured authenticator.
    /// Answered with `407`; the connection is kept open.
    #[error("proxy authentication required")]
    AuthenticationRequired,

    /// The target host could not be resolved. Answered with `502`.
    #[error("failed to resolve {host}: {source}")]
    Resolution {
        /// host that failed to resolve
        host: String,
        /// underlying resolver error
        source: BoxError,
    },

    /// All routes to the upstream (chained candidates and, when allowed,
    /// the direct hop) failed. Answered with `502`.
    #[error("failed to connect to {host}: {reason}")]
    Connection {
        /// upstream that could not be reached
        host: String,
        /// human readable cause of the last attempt
        reason: String,
    },

    /// TLS handshake failure. On the upstream leg this is treated as a
    /// connection failure; on the client leg the socket is reset without
    /// an HTTP response.
    #[error("tls handshake failed: {0}")]
    TlsHandshake(BoxError),

    /// No response head arrived within the idle window. Answered with `504`
    /// when it strikes before the response head, aborts the exchange when
    /// it strikes mid-body.
    #[error("timed out waiting for the upstream response")]
    Timeout,

    /// The upstream response could not be parsed. Answered with `502`.
    #[error("unparsable upstream response: {0}")]
    UpstreamProtocol(String),

    /// Starting or registering against a stopped [`ServerGroup`].
    ///
    /// [`ServerGroup`]: crate::ServerGroup
    #[error("server group has already been stopped")]
    GroupStopped,

    /// Transport failure on either half of the connection pair.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation: both halves are closed, nothing is sent.
    #[error("internal proxy failure: {0}")]
    Fatal(String),
}

impl ProxyError {
    /// The status of the response synthesized towards the client for this
    /// error, or `None` when the policy is to close without responding.
    #[must_use]
    pub fn response_status(&self) -> Option<StatusCode> {
        match self {
            Self::ClientProtocol(_) => Some(StatusCode::BAD_REQUEST),
            Self::AuthenticationRequired => Some(StatusCode::PROXY_AUTHENTICATION_REQUIRED),
            Self::Resolution { .. } | Self::Connection { .. } | Self::UpstreamProtocol(_) => {
                Some(StatusCode::BAD_GATEWAY)
            }
            Self::Timeout => Some(StatusCode::GATEWAY_TIMEOUT),
            Self::TlsHandshake(_) | Self::GroupStopped | Self::Io(_) | Self::Fatal(_) => None,
        }
    }

    /// Whether the client connection must be closed once the synthesized
    /// response (if any) has been written.
    #[must_use]
    pub fn closes_client_connection(&self) -> bool {
        !matches!(self, Self::AuthenticationRequired)
    }
}
