//! An intercepting HTTP/1.x proxy engine.
//!
//! `interpose` mediates traffic between clients and origin servers with
//! four layerable modes: transparent forwarding, explicit forward proxy
//! (with optional Basic authentication), TLS man-in-the-middle interception
//! of CONNECT tunnels, and upstream proxy chaining with optional TLS on the
//! chained hop. It brokers WebSocket (and any `Upgrade`) handshakes and the
//! HAProxy PROXY protocol, and exposes every request and response to
//! user-supplied [filter chains](crate::filter).
//!
//! # Quick start
//!
//! ```no_run
//! use interpose::{ProxyConfig, ProxyServer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let proxy = ProxyServer::start(
//!     ProxyConfig::builder()
//!         .with_port(8080)
//!         .build()?,
//! )?;
//! println!("proxying on {}", proxy.address());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! The engine is built around one driver task per client connection, owning
//! both halves of the proxied pair:
//!
//! - the **client-to-proxy** half parses requests, applies filters, guards
//!   authentication and delivers responses;
//! - the **proxy-to-server** half resolves, dials (walking the configured
//!   [chain](crate::chain) of upstream proxies), forwards requests and
//!   streams responses back, reusing connections per `host:port`.
//!
//! Byte streams pass through a reconfigurable pipeline: PROXY protocol
//! consumption, TLS, HTTP framing with configurable limits, idle
//! supervision and a proxy-wide [traffic shaper](crate::shaper). CONNECT
//! converts the pair into an opaque byte pipe, or, under a configured
//! [`MitmManager`], into two TLS sessions with HTTP framing resumed
//! in between.
//!
//! Worker pools (acceptors, client workers, server workers) live in a
//! [`ServerGroup`] that can be shared by several proxy instances and tears
//! itself down when the last one stops.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod auth;
pub mod chain;
pub mod config;
pub mod conn;
pub mod dns;
pub mod error;
pub mod filter;
pub mod haproxy;
pub mod http;
pub mod net;
pub mod shaper;
pub mod tls;
pub mod tracker;

mod group;
mod server;
mod stream;

#[doc(inline)]
pub use auth::ProxyAuthenticator;
#[doc(inline)]
pub use chain::{ChainCandidate, ChainedProxy, ChainedProxyManager};
#[doc(inline)]
pub use config::{ClientSecurity, ConfigError, ProxyConfig, ProxyConfigBuilder, ThreadPoolConfig};
#[doc(inline)]
pub use conn::ConnectionState;
#[doc(inline)]
pub use dns::{BoxHostResolver, HickoryResolver, HostResolver, SystemResolver};
#[doc(inline)]
pub use error::{BoxError, ProxyError};
#[doc(inline)]
pub use filter::{HttpFilters, HttpFiltersSource};
#[doc(inline)]
pub use group::ServerGroup;
#[doc(inline)]
pub use crate::http::{Frame, LocalResponse, RequestHead, ResponseHead};
#[doc(inline)]
pub use server::ProxyServer;
#[doc(inline)]
pub use shaper::TrafficShaper;
#[doc(inline)]
pub use tls::{MitmManager, TlsInfo, TlsSource};
#[doc(inline)]
pub use tracker::{ActivityTracker, FlowContext, FullFlowContext};
