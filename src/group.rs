//! Shared worker pools.
//!
//! A [`ServerGroup`] owns three runtimes, one per role: accepting inbound
//! connections, driving client-to-proxy connections, and resolving/dialing
//! proxy-to-server connections. Multiple proxy instances can share one
//! group; by default the group tears its pools down when the last
//! registered proxy unregisters.

use crate::config::ThreadPoolConfig;
use crate::error::ProxyError;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};

/// How long a graceful pool teardown waits for runtime tasks.
const POOL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// The role a worker pool plays; used for thread naming.
#[derive(Debug, Clone, Copy)]
enum Role {
    Acceptor,
    ClientToProxy,
    ProxyToServer,
}

impl Role {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Acceptor => "acceptor",
            Self::ClientToProxy => "client-worker",
            Self::ProxyToServer => "server-worker",
        }
    }
}

struct Pools {
    acceptor: Runtime,
    client_workers: Runtime,
    server_workers: Runtime,
}

struct GroupInner {
    name: String,
    pools: Mutex<Option<Pools>>,
    acceptor_handle: Handle,
    client_handle: Handle,
    server_handle: Handle,
    registered: Mutex<HashSet<u64>>,
    next_proxy_id: AtomicU64,
    stopped: AtomicBool,
    auto_stop: bool,
}

/// A shareable set of worker pools, the process-wide resource holder of
/// one or more proxy instances.
#[derive(Clone)]
pub struct ServerGroup {
    inner: Arc<GroupInner>,
}

impl std::fmt::Debug for ServerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerGroup")
            .field("name", &self.inner.name)
            .field("stopped", &self.inner.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ServerGroup {
    /// Create a group that stops itself once its last proxy unregisters.
    pub fn new(name: impl Into<String>, pools: ThreadPoolConfig) -> Result<Self, ProxyError> {
        Self::build(name.into(), pools, true)
    }

    /// Create a group that lives until [`Self::shutdown`] is called
    /// explicitly, regardless of registered proxies.
    pub fn with_manual_lifetime(
        name: impl Into<String>,
        pools: ThreadPoolConfig,
    ) -> Result<Self, ProxyError> {
        Self::build(name.into(), pools, false)
    }

    fn build(name: String, pools: ThreadPoolConfig, auto_stop: bool) -> Result<Self, ProxyError> {
        let acceptor = build_runtime(&name, Role::Acceptor, pools.acceptor_threads)?;
        let client_workers = build_runtime(&name, Role::ClientToProxy, pools.client_worker_threads)?;
        let server_workers = build_runtime(&name, Role::ProxyToServer, pools.server_worker_threads)?;
        let inner = GroupInner {
            name,
            acceptor_handle: acceptor.handle().clone(),
            client_handle: client_workers.handle().clone(),
            server_handle: server_workers.handle().clone(),
            pools: Mutex::new(Some(Pools {
                acceptor,
                client_workers,
                server_workers,
            })),
            registered: Mutex::new(HashSet::new()),
            next_proxy_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            auto_stop,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// The name worker threads of this group are prefixed with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether [`Self::shutdown`] has run.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Register a starting proxy instance; fails once the group stopped.
    pub(crate) fn register(&self) -> Result<u64, ProxyError> {
        if self.is_stopped() {
            return Err(ProxyError::GroupStopped);
        }
        let id = self.inner.next_proxy_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut registered) = self.inner.registered.lock() {
            registered.insert(id);
        }
        // raced with a concurrent shutdown
        if self.is_stopped() {
            return Err(ProxyError::GroupStopped);
        }
        Ok(id)
    }

    /// Unregister a stopped proxy instance. With auto-stop semantics the
    /// pools are torn down when the set becomes empty.
    pub(crate) fn unregister(&self, id: u64, graceful: bool) {
        let empty = match self.inner.registered.lock() {
            Ok(mut registered) => {
                registered.remove(&id);
                registered.is_empty()
            }
            Err(_) => return,
        };
        if empty && self.inner.auto_stop {
            self.shutdown(graceful);
        }
    }

    /// Tear the worker pools down. Idempotent; concurrent callers after the
    /// first are no-ops. When `graceful`, runtime tasks get a bounded drain
    /// window before their threads are stopped.
    pub fn shutdown(&self, graceful: bool) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(pools) = self.inner.pools.lock().ok().and_then(|mut p| p.take()) else {
            return;
        };
        tracing::debug!(group = %self.inner.name, graceful, "shutting down server group pools");

        let timeout = if graceful {
            POOL_SHUTDOWN_TIMEOUT
        } else {
            Duration::ZERO
        };
        let teardown = move || {
            pools.acceptor.shutdown_timeout(timeout);
            pools.client_workers.shutdown_timeout(timeout);
            pools.server_workers.shutdown_timeout(timeout);
        };

        // A runtime cannot be dropped from one of its own worker threads;
        // those are named after the group, which gives us a reliable probe.
        let on_own_worker = std::thread::current()
            .name()
            .is_some_and(|name| name.starts_with(&self.inner.name));
        match std::thread::Builder::new()
            .name(format!("{}-teardown", self.inner.name))
            .spawn(teardown)
        {
            Ok(handle) if !on_own_worker && Handle::try_current().is_err() => {
                let _ = handle.join();
            }
            Ok(_) => {} // detached teardown
            Err(err) => tracing::warn!("failed to spawn pool teardown thread: {err}"),
        }
    }

    pub(crate) fn acceptor_handle(&self) -> Handle {
        self.inner.acceptor_handle.clone()
    }

    pub(crate) fn client_handle(&self) -> Handle {
        self.inner.client_handle.clone()
    }

    pub(crate) fn server_handle(&self) -> Handle {
        self.inner.server_handle.clone()
    }
}

fn build_runtime(name: &str, role: Role, threads: usize) -> Result<Runtime, ProxyError> {
    let prefix = format!("{name}-{}", role.as_str());
    let counter = AtomicUsize::new(0);
    let runtime = Builder::new_multi_thread()
        .worker_threads(threads)
        .thread_name_fn(move || {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            format!("{prefix}-{n}")
        })
        .enable_all()
        .build()?;
    Ok(runtime)
}
