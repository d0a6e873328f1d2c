//! Proxy configuration.
//!
//! A [`ProxyConfig`] is immutable: it is produced by the validating
//! [`ProxyConfigBuilder`], which is also where cross-option rules live.
//! Most notably, client-leg TLS and MITM interception are mutually
//! exclusive, enforced structurally through the [`ClientSecurity`] variant
//! the builder selects.

use crate::auth::ProxyAuthenticator;
use crate::chain::{ChainedProxyManager, DirectOnly};
use crate::dns::{BoxHostResolver, HickoryResolver, HostResolver, SystemResolver};
use crate::filter::{HttpFiltersSource, NoopFiltersSource};
use crate::group::ServerGroup;
use crate::http::CodecLimits;
use crate::tls::{MitmManager, TlsSource};
use crate::tracker::ActivityTracker;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Error produced when a configuration fails validation.
#[derive(Debug, thiserror::Error)]
#[error("invalid proxy configuration: {0}")]
pub struct ConfigError(pub(crate) String);

/// Security mode of the client-facing leg.
#[derive(Clone)]
pub enum ClientSecurity {
    /// Plain TCP.
    Plain,
    /// The leg itself is TLS encrypted.
    Tls(Arc<dyn TlsSource>),
    /// CONNECT tunnels are intercepted and decrypted.
    Mitm(Arc<dyn MitmManager>),
}

impl std::fmt::Debug for ClientSecurity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain => f.write_str("Plain"),
            Self::Tls(_) => f.write_str("Tls(..)"),
            Self::Mitm(_) => f.write_str("Mitm(..)"),
        }
    }
}

/// Worker thread counts of a [`ServerGroup`].
#[derive(Debug, Clone, Copy)]
pub struct ThreadPoolConfig {
    /// Threads accepting inbound connections.
    pub acceptor_threads: usize,
    /// Threads driving client-to-proxy connections.
    pub client_worker_threads: usize,
    /// Threads dialing and resolving proxy-to-server connections.
    pub server_worker_threads: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            acceptor_threads: 2,
            client_worker_threads: 8,
            server_worker_threads: 8,
        }
    }
}

impl ThreadPoolConfig {
    /// A single thread per role; useful for deterministic tests.
    #[must_use]
    pub const fn single_threaded() -> Self {
        Self {
            acceptor_threads: 1,
            client_worker_threads: 1,
            server_worker_threads: 1,
        }
    }
}

/// Immutable configuration of a proxy instance.
#[derive(Clone)]
pub struct ProxyConfig {
    pub(crate) name: String,
    pub(crate) address: SocketAddr,
    pub(crate) allow_local_only: bool,
    pub(crate) client_security: ClientSecurity,
    pub(crate) authenticate_ssl_clients: bool,
    pub(crate) authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    pub(crate) chain_manager: Arc<dyn ChainedProxyManager>,
    pub(crate) filters_source: Arc<dyn HttpFiltersSource>,
    pub(crate) resolver: BoxHostResolver,
    pub(crate) transparent: bool,
    pub(crate) idle_connection_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) throttling: (u64, u64),
    pub(crate) network_interface: Option<IpAddr>,
    pub(crate) limits: CodecLimits,
    pub(crate) allow_requests_to_origin_server: bool,
    pub(crate) proxy_alias: String,
    pub(crate) accept_proxy_protocol: bool,
    pub(crate) send_proxy_protocol: bool,
    pub(crate) thread_pools: ThreadPoolConfig,
    pub(crate) trackers: Vec<Arc<dyn ActivityTracker>>,
    pub(crate) server_group: Option<ServerGroup>,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("allow_local_only", &self.allow_local_only)
            .field("client_security", &self.client_security)
            .field("transparent", &self.transparent)
            .field("idle_connection_timeout", &self.idle_connection_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("proxy_alias", &self.proxy_alias)
            .finish_non_exhaustive()
    }
}

impl ProxyConfig {
    /// Start building a configuration with the documented defaults.
    #[must_use]
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::default()
    }

    /// The listen address this proxy was configured with.
    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }
}

/// Builder of [`ProxyConfig`] values.
///
/// Every option has a sensible default; only call what you need.
pub struct ProxyConfigBuilder {
    name: String,
    address: SocketAddr,
    allow_local_only: bool,
    tls_source: Option<Arc<dyn TlsSource>>,
    mitm_manager: Option<Arc<dyn MitmManager>>,
    authenticate_ssl_clients: bool,
    authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    chain_manager: Option<Arc<dyn ChainedProxyManager>>,
    filters_source: Option<Arc<dyn HttpFiltersSource>>,
    resolver: Option<BoxHostResolver>,
    use_dns_sec: bool,
    transparent: bool,
    idle_connection_timeout: Duration,
    connect_timeout: Duration,
    throttling: (u64, u64),
    network_interface: Option<IpAddr>,
    limits: CodecLimits,
    allow_requests_to_origin_server: bool,
    proxy_alias: Option<String>,
    accept_proxy_protocol: bool,
    send_proxy_protocol: bool,
    thread_pools: ThreadPoolConfig,
    trackers: Vec<Arc<dyn ActivityTracker>>,
    server_group: Option<ServerGroup>,
}

impl Default for ProxyConfigBuilder {
    fn default() -> Self {
        Self {
            name: "interpose".to_owned(),
            address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            allow_local_only: true,
            tls_source: None,
            mitm_manager: None,
            authenticate_ssl_clients: true,
            authenticator: None,
            chain_manager: None,
            filters_source: None,
            resolver: None,
            use_dns_sec: false,
            transparent: false,
            idle_connection_timeout: Duration::from_secs(70),
            connect_timeout: Duration::from_secs(40),
            throttling: (0, 0),
            network_interface: None,
            limits: CodecLimits::default(),
            allow_requests_to_origin_server: false,
            proxy_alias: None,
            accept_proxy_protocol: false,
            send_proxy_protocol: false,
            thread_pools: ThreadPoolConfig::default(),
            trackers: Vec::new(),
            server_group: None,
        }
    }
}

impl ProxyConfigBuilder {
    /// Name of this proxy: used as thread-name prefix of its worker pools.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The address to listen on.
    #[must_use]
    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    /// Listen on the given port on all interfaces.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.address.set_port(port);
        self
    }

    /// Whether non-loopback clients are rejected at accept time.
    #[must_use]
    pub fn with_allow_local_only(mut self, allow_local_only: bool) -> Self {
        self.allow_local_only = allow_local_only;
        self
    }

    /// Encrypt the client-facing leg with the given TLS source.
    /// Mutually exclusive with [`Self::with_mitm_manager`].
    #[must_use]
    pub fn with_tls_source(mut self, source: Arc<dyn TlsSource>) -> Self {
        self.tls_source = Some(source);
        self
    }

    /// Whether an encrypted client leg requires client certificates.
    #[must_use]
    pub fn with_authenticate_ssl_clients(mut self, authenticate: bool) -> Self {
        self.authenticate_ssl_clients = authenticate;
        self
    }

    /// Intercept CONNECT tunnels with the given MITM manager.
    /// Mutually exclusive with [`Self::with_tls_source`].
    #[must_use]
    pub fn with_mitm_manager(mut self, manager: Arc<dyn MitmManager>) -> Self {
        self.mitm_manager = Some(manager);
        self
    }

    /// Gate requests behind Basic proxy authentication.
    #[must_use]
    pub fn with_proxy_authenticator(mut self, authenticator: Arc<dyn ProxyAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Route upstream connections through chained proxies.
    #[must_use]
    pub fn with_chain_proxy_manager(mut self, manager: Arc<dyn ChainedProxyManager>) -> Self {
        self.chain_manager = Some(manager);
        self
    }

    /// Attach a filters source; one filter instance is created per request.
    #[must_use]
    pub fn with_filters_source(mut self, source: Arc<dyn HttpFiltersSource>) -> Self {
        self.filters_source = Some(source);
        self
    }

    /// Use a custom host resolver for direct upstream hops.
    #[must_use]
    pub fn with_host_resolver<R: HostResolver>(mut self, resolver: R) -> Self {
        self.resolver = Some(resolver.boxed());
        self
    }

    /// Resolve through the in-process (validating) resolver instead of the
    /// operating system. Ignored when an explicit resolver is set.
    #[must_use]
    pub fn with_dns_sec(mut self, use_dns_sec: bool) -> Self {
        self.use_dns_sec = use_dns_sec;
        self
    }

    /// Do not rewrite request-targets or `Host` when acting as a gateway.
    #[must_use]
    pub fn with_transparent(mut self, transparent: bool) -> Self {
        self.transparent = transparent;
        self
    }

    /// Idle window after which a quiet connection is forcefully closed.
    /// Zero disables idle supervision.
    #[must_use]
    pub fn with_idle_connection_timeout(mut self, timeout: Duration) -> Self {
        self.idle_connection_timeout = timeout;
        self
    }

    /// Dial timeout for upstream connections.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Read/write throughput ceilings in bytes per second (0 = unlimited).
    #[must_use]
    pub fn with_throttling(mut self, read_bytes_per_second: u64, write_bytes_per_second: u64) -> Self {
        self.throttling = (read_bytes_per_second, write_bytes_per_second);
        self
    }

    /// Local address outbound connections are bound to.
    #[must_use]
    pub fn with_network_interface(mut self, address: IpAddr) -> Self {
        self.network_interface = Some(address);
        self
    }

    /// Parser limits of both codecs.
    #[must_use]
    pub fn with_codec_limits(mut self, limits: CodecLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Accept origin-form request-targets addressed to the proxy itself.
    #[must_use]
    pub fn with_allow_requests_to_origin_server(mut self, allow: bool) -> Self {
        self.allow_requests_to_origin_server = allow;
        self
    }

    /// Pseudonym stamped into `Via` headers.
    #[must_use]
    pub fn with_proxy_alias(mut self, alias: impl Into<String>) -> Self {
        self.proxy_alias = Some(alias.into());
        self
    }

    /// Expect a HAProxy PROXY protocol header on every inbound connection.
    #[must_use]
    pub fn with_accept_proxy_protocol(mut self, accept: bool) -> Self {
        self.accept_proxy_protocol = accept;
        self
    }

    /// Emit a HAProxy PROXY protocol v1 header on every upstream connection.
    #[must_use]
    pub fn with_send_proxy_protocol(mut self, send: bool) -> Self {
        self.send_proxy_protocol = send;
        self
    }

    /// Worker thread counts for the (implicitly created) [`ServerGroup`].
    #[must_use]
    pub fn with_thread_pool_config(mut self, thread_pools: ThreadPoolConfig) -> Self {
        self.thread_pools = thread_pools;
        self
    }

    /// Register an activity tracker; may be called multiple times.
    #[must_use]
    pub fn with_activity_tracker(mut self, tracker: Arc<dyn ActivityTracker>) -> Self {
        self.trackers.push(tracker);
        self
    }

    /// Share the worker pools of an existing [`ServerGroup`] instead of
    /// creating a private one at start.
    #[must_use]
    pub fn with_server_group(mut self, group: ServerGroup) -> Self {
        self.server_group = Some(group);
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<ProxyConfig, ConfigError> {
        let client_security = match (self.tls_source, self.mitm_manager) {
            (Some(_), Some(_)) => {
                return Err(ConfigError(
                    "tls_source and mitm_manager are mutually exclusive".into(),
                ));
            }
            (Some(source), None) => ClientSecurity::Tls(source),
            (None, Some(manager)) => ClientSecurity::Mitm(manager),
            (None, None) => ClientSecurity::Plain,
        };

        if self.thread_pools.acceptor_threads == 0
            || self.thread_pools.client_worker_threads == 0
            || self.thread_pools.server_worker_threads == 0
        {
            return Err(ConfigError("thread pool sizes must be nonzero".into()));
        }

        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None if self.use_dns_sec => HickoryResolver::new().boxed(),
            None => SystemResolver::new().boxed(),
        };

        let proxy_alias = self.proxy_alias.unwrap_or_else(|| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "interpose".to_owned())
        });

        Ok(ProxyConfig {
            name: self.name,
            address: self.address,
            allow_local_only: self.allow_local_only,
            client_security,
            authenticate_ssl_clients: self.authenticate_ssl_clients,
            authenticator: self.authenticator,
            chain_manager: self
                .chain_manager
                .unwrap_or_else(|| Arc::new(DirectOnly)),
            filters_source: self
                .filters_source
                .unwrap_or_else(|| Arc::new(NoopFiltersSource)),
            resolver,
            transparent: self.transparent,
            idle_connection_timeout: self.idle_connection_timeout,
            connect_timeout: self.connect_timeout,
            throttling: self.throttling,
            network_interface: self.network_interface,
            limits: self.limits,
            allow_requests_to_origin_server: self.allow_requests_to_origin_server,
            proxy_alias,
            accept_proxy_protocol: self.accept_proxy_protocol,
            send_proxy_protocol: self.send_proxy_protocol,
            thread_pools: self.thread_pools,
            trackers: self.trackers,
            server_group: self.server_group,
        })
    }
}
