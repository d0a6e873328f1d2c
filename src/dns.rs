//! Host resolution for outbound connections.
//!
//! The engine resolves every direct upstream hop through a [`HostResolver`].
//! The [`SystemResolver`] (the default) delegates to the operating system
//! through tokio's built-in lookup. [`HickoryResolver`] is the
//! in-process alternative, and the seam where a validating (DNSSEC)
//! resolver plugs in without the engine knowing.
//!
//! IP literals never hit the resolver.

use crate::error::BoxError;
use crate::net::{Host, HostAndPort};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::rdata::A;
use hickory_resolver::{Name, TokioResolver, config::ResolverConfig};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::lookup_host;

/// A resolver of `host:port` pairs into socket addresses.
pub trait HostResolver: Sized + Send + Sync + 'static {
    /// Resolve the given host and port into a dialable address.
    fn resolve(
        &self,
        host: HostAndPort,
    ) -> impl Future<Output = Result<SocketAddr, BoxError>> + Send + '_;

    /// Box this resolver to allow for dynamic dispatch.
    fn boxed(self) -> BoxHostResolver {
        BoxHostResolver::new(self)
    }
}

impl<R: HostResolver> HostResolver for Arc<R> {
    fn resolve(
        &self,
        host: HostAndPort,
    ) -> impl Future<Output = Result<SocketAddr, BoxError>> + Send + '_ {
        (**self).resolve(host)
    }
}

trait DynHostResolver: Send + Sync + 'static {
    fn resolve_box<'a>(
        &'a self,
        host: HostAndPort,
    ) -> Pin<Box<dyn Future<Output = Result<SocketAddr, BoxError>> + Send + 'a>>;
}

impl<R: HostResolver> DynHostResolver for R {
    fn resolve_box<'a>(
        &'a self,
        host: HostAndPort,
    ) -> Pin<Box<dyn Future<Output = Result<SocketAddr, BoxError>> + Send + 'a>> {
        Box::pin(self.resolve(host))
    }
}

/// A boxed [`HostResolver`], for where you require dynamic dispatch.
pub struct BoxHostResolver {
    inner: Arc<dyn DynHostResolver>,
}

impl BoxHostResolver {
    /// Create a new [`BoxHostResolver`] from the given resolver.
    pub fn new<R: HostResolver>(resolver: R) -> Self {
        Self {
            inner: Arc::new(resolver),
        }
    }
}

impl Clone for BoxHostResolver {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for BoxHostResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxHostResolver").finish()
    }
}

impl HostResolver for BoxHostResolver {
    fn resolve(
        &self,
        host: HostAndPort,
    ) -> impl Future<Output = Result<SocketAddr, BoxError>> + Send + '_ {
        self.inner.resolve_box(host)
    }
}

/// Resolver delegating to the operating system.
///
/// Blocking OS lookups are offloaded to the runtime's blocking pool, the
/// driver task itself never blocks.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct SystemResolver;

impl SystemResolver {
    /// Create a new [`SystemResolver`].
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl HostResolver for SystemResolver {
    async fn resolve(&self, host: HostAndPort) -> Result<SocketAddr, BoxError> {
        if let Some(addr) = host.socket_addr() {
            return Ok(addr);
        }
        let mut addrs = lookup_host(host.to_string()).await?;
        addrs
            .next()
            .ok_or_else(|| format!("no address found for {host}").into())
    }
}

/// In-process resolver built on the `hickory_resolver` crate.
#[derive(Debug, Clone)]
pub struct HickoryResolver(Arc<TokioResolver>);

impl HickoryResolver {
    /// Construct a [`HickoryResolver`] from the system configuration
    /// (`/etc/resolv.conf` on Unix, the registry on Windows).
    pub fn try_new_system() -> Result<Self, BoxError> {
        tracing::trace!("create hickory resolver using system config");
        Ok(TokioResolver::builder_tokio()?.build().into())
    }

    /// Construct a [`HickoryResolver`] using Cloudflare's public resolvers.
    #[must_use]
    pub fn new_cloudflare() -> Self {
        tracing::trace!("create hickory resolver using cloudflare config");
        TokioResolver::builder_with_config(
            ResolverConfig::cloudflare(),
            TokioConnectionProvider::default(),
        )
        .build()
        .into()
    }

    /// The system configuration when available, Cloudflare otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self::try_new_system().unwrap_or_else(|_| Self::new_cloudflare())
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl From<TokioResolver> for HickoryResolver {
    fn from(value: TokioResolver) -> Self {
        Self(Arc::new(value))
    }
}

impl HostResolver for HickoryResolver {
    async fn resolve(&self, host: HostAndPort) -> Result<SocketAddr, BoxError> {
        if let Some(addr) = host.socket_addr() {
            return Ok(addr);
        }
        let Host::Name(name) = host.host() else {
            return Err(format!("cannot resolve {host}").into());
        };
        let mut name = Name::from_utf8(name)?;
        name.set_fqdn(true);
        let lookup = self.0.ipv4_lookup(name).await?;
        let A(ip) = lookup
            .into_iter()
            .next()
            .ok_or_else(|| format!("no A record found for {host}"))?;
        Ok(SocketAddr::new(ip.into(), host.port()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_literals_bypass_resolution() {
        let resolver = SystemResolver::new();
        let addr = resolver
            .resolve(HostAndPort::from_header("127.0.0.1:8080", 80).unwrap())
            .await
            .unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[tokio::test]
    async fn boxed_resolver_delegates() {
        let resolver = SystemResolver::new().boxed();
        let addr = resolver
            .resolve(HostAndPort::from_header("[::1]:9", 80).unwrap())
            .await
            .unwrap();
        assert_eq!(addr, "[::1]:9".parse().unwrap());
    }
}
