//! The proxy instance: listener, accept loop and lifecycle.
//!
//! [`ProxyServer::start`] binds the listen socket synchronously, registers
//! against its [`ServerGroup`] (creating a private one when none is shared)
//! and spawns the accept loop on the group's acceptor pool. Every accepted
//! connection is handed to a driver task on the client-worker pool, holding
//! a shutdown guard: the guard set *is* the connection registry that
//! [`ProxyServer::stop`] drains.

use crate::config::ProxyConfig;
use crate::conn;
use crate::error::ProxyError;
use crate::group::ServerGroup;
use crate::net::is_local_peer;
use crate::shaper::TrafficShaper;
use crate::tracker::{ActivityTracker, TrackerSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_graceful::Shutdown;

/// Bound on the graceful connection drain performed by [`ProxyServer::stop`].
const GRACEFUL_DRAIN_LIMIT: Duration = Duration::from_secs(10);

/// Shared, immutable state of a running proxy, threaded through every
/// connection driver.
pub(crate) struct ProxyCore {
    pub(crate) config: ProxyConfig,
    pub(crate) shaper: Arc<TrafficShaper>,
    pub(crate) trackers: TrackerSet,
    pub(crate) group: ServerGroup,
}

impl ProxyCore {
    pub(crate) fn each_tracker(&self, f: impl Fn(&dyn ActivityTracker)) {
        for tracker in self.trackers.iter() {
            f(&**tracker);
        }
    }
}

struct ProxyInner {
    core: Arc<ProxyCore>,
    bound: SocketAddr,
    registration: u64,
    stop_requested: AtomicBool,
    stopped: AtomicBool,
    stop_tx: watch::Sender<bool>,
    abort_tx: watch::Sender<bool>,
    done_rx: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
}

/// A running proxy instance.
///
/// Cheap to clone-by-handle ([`Clone`] shares the instance); use
/// [`Self::try_clone`] for an independent instance sharing the worker
/// pools.
#[derive(Clone)]
pub struct ProxyServer {
    inner: Arc<ProxyInner>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("address", &self.inner.bound)
            .field("stopped", &self.inner.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ProxyServer {
    /// Bind and start serving.
    ///
    /// Callable from any thread; the listener is bound synchronously so a
    /// successful return means the proxy is reachable.
    pub fn start(config: ProxyConfig) -> Result<Self, ProxyError> {
        let group = match &config.server_group {
            Some(group) => group.clone(),
            None => ServerGroup::new(config.name.clone(), config.thread_pools)?,
        };
        let registration = group.register()?;

        let listener = match bind(config.address) {
            Ok(listener) => listener,
            Err(err) => {
                group.unregister(registration, true);
                return Err(err);
            }
        };
        let bound = listener.local_addr()?;

        let shaper = TrafficShaper::new(config.throttling.0, config.throttling.1);
        let trackers: TrackerSet = Arc::new(config.trackers.clone());
        let core = Arc::new(ProxyCore {
            config,
            shaper,
            trackers,
            group: group.clone(),
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let (abort_tx, abort_rx) = watch::channel(false);
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let inner = Arc::new(ProxyInner {
            core: core.clone(),
            bound,
            registration,
            stop_requested: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_tx,
            abort_tx,
            done_rx: Mutex::new(Some(done_rx)),
        });

        // the accept loop owns the listener and the connection registry
        group.acceptor_handle().spawn(accept_loop(
            core.clone(),
            listener,
            registration,
            stop_rx.clone(),
            abort_rx,
            done_tx,
        ));

        // process-signal hook: Ctrl-C stops gracefully while the proxy
        // runs; an explicit stop disarms it by firing the same watch
        let signal_stop = inner.stop_tx.clone();
        let mut signal_stop_rx = stop_rx;
        group.acceptor_handle().spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupt received, stopping proxy gracefully");
                    let _ = signal_stop.send(true);
                }
                _ = signal_stop_rx.changed() => {}
            }
        });

        tracing::info!(address = %bound, "proxy started");
        Ok(Self { inner })
    }

    /// The address the listener is actually bound to.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.inner.bound
    }

    /// The server group this instance runs on.
    #[must_use]
    pub fn server_group(&self) -> &ServerGroup {
        &self.inner.core.group
    }

    /// Adjust the traffic-shaping rates at runtime.
    pub fn set_throttle(&self, read_bytes_per_second: u64, write_bytes_per_second: u64) {
        self.inner
            .core
            .shaper
            .set_rates(read_bytes_per_second, write_bytes_per_second);
    }

    /// Whether this instance has stopped serving.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop serving. With `graceful`, open connections get a bounded
    /// window to drain; without, they are closed immediately.
    ///
    /// Blocks until the accept loop has wound down; call it from a
    /// blocking-friendly context.
    pub fn stop(&self, graceful: bool) {
        if self.inner.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(address = %self.inner.bound, graceful, "stopping proxy");
        if !graceful {
            let _ = self.inner.abort_tx.send(true);
        }
        let _ = self.inner.stop_tx.send(true);

        let receiver = self.inner.done_rx.lock().ok().and_then(|mut rx| rx.take());
        if let Some(receiver) = receiver {
            let _ = receiver.recv_timeout(GRACEFUL_DRAIN_LIMIT + Duration::from_secs(5));
        }
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner
            .core
            .group
            .unregister(self.inner.registration, graceful);
    }

    /// Stop immediately, closing every open connection.
    pub fn abort(&self) {
        self.stop(false);
    }

    /// Start an independent proxy instance with the same configuration,
    /// sharing this instance's [`ServerGroup`], listening one port up.
    ///
    /// No atomic port allocation is attempted; racing clones can collide
    /// and the loser fails to bind.
    pub fn try_clone(&self) -> Result<Self, ProxyError> {
        let mut config = self.inner.core.config.clone();
        config.server_group = Some(self.inner.core.group.clone());
        if self.inner.bound.port() != 0 {
            let mut address = self.inner.bound;
            address.set_port(self.inner.bound.port() + 1);
            config.address = address;
        }
        Self::start(config)
    }
}

fn bind(address: SocketAddr) -> Result<std::net::TcpListener, ProxyError> {
    let listener = std::net::TcpListener::bind(address)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

async fn accept_loop(
    core: Arc<ProxyCore>,
    listener: std::net::TcpListener,
    registration: u64,
    mut stop_rx: watch::Receiver<bool>,
    abort_rx: watch::Receiver<bool>,
    done_tx: std::sync::mpsc::Sender<()>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::warn!("failed to adopt listener: {err}");
            let _ = done_tx.send(());
            return;
        }
    };

    let mut shutdown_rx = stop_rx.clone();
    let shutdown = Shutdown::new(async move {
        let _ = shutdown_rx.changed().await;
    });
    let connection_ids = AtomicU64::new(0);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (tcp, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!("accept failed: {err}");
                        continue;
                    }
                };
                if core.config.allow_local_only && !is_local_peer(&peer) {
                    tracing::debug!(%peer, "rejecting non-local client");
                    drop(tcp);
                    continue;
                }
                let connection_id = connection_ids.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%peer, connection = connection_id, "client accepted");
                let guard = shutdown.guard();
                core.group.client_handle().spawn(conn::client::run(
                    core.clone(),
                    guard,
                    abort_rx.clone(),
                    tcp,
                    peer,
                    connection_id,
                ));
            }
            _ = stop_rx.changed() => break,
        }
    }

    // stop accepting, then drain the registered connections
    tracing::debug!(registration, "accept loop stopped, draining connections");
    let aborting = *abort_rx.borrow();
    let limit = if aborting {
        Duration::from_millis(50)
    } else {
        GRACEFUL_DRAIN_LIMIT
    };
    if let Err(err) = shutdown.shutdown_with_limit(limit).await {
        tracing::debug!("connection drain hit the limit: {err}");
    }
    let _ = done_tx.send(());
}
