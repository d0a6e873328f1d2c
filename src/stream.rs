//! Byte-stream building blocks of the codec pipeline.
//!
//! Pipeline reconfiguration (HAProxy header consumption, TLS insertion,
//! tunnel conversion) is expressed by re-binding: a stage consumes what it
//! needs, then hands the remaining buffered bytes forward wrapped in a
//! [`Prefixed`] stream, and the driver rebuilds the codec on top. The result
//! is always erased into a [`BoxedStream`], so the drivers do not grow a
//! type parameter per possible stage combination.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

/// Any bidirectional byte stream the engine can drive.
pub(crate) trait Stream: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static> Stream for T {}

/// A type-erased [`Stream`].
pub(crate) type BoxedStream = Box<dyn Stream>;

/// A stream that first replays a buffered prefix before reading from the
/// inner stream. Writes pass straight through.
#[derive(Debug)]
pub(crate) struct Prefixed<S> {
    prefix: bytes::Bytes,
    inner: S,
}

impl<S> Prefixed<S> {
    /// Create a new [`Prefixed`] stream.
    pub fn new(prefix: bytes::Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Read/write activity clock of one connection, shared between the stream
/// wrapper that stamps it and the driver that supervises idleness.
#[derive(Debug)]
pub(crate) struct IdleMeter {
    epoch: Instant,
    last_read: AtomicU64,
    last_write: AtomicU64,
    /// When cleared (tunnel mode), reads no longer defer the idle deadline.
    read_counts: AtomicBool,
}

impl IdleMeter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
            last_read: AtomicU64::new(0),
            last_write: AtomicU64::new(0),
            read_counts: AtomicBool::new(true),
        })
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub(crate) fn touch_read(&self) {
        self.last_read.store(self.now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn touch_write(&self) {
        self.last_write.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Disable read participation: a tunnel may idle on reads by design,
    /// write idleness still applies.
    pub(crate) fn disable_read_idle(&self) {
        self.read_counts.store(false, Ordering::Relaxed);
    }

    fn deadline(&self, window: Duration) -> Instant {
        let last_write = self.last_write.load(Ordering::Relaxed);
        let last = if self.read_counts.load(Ordering::Relaxed) {
            // idle only once *both* directions have been quiet for the window
            self.last_read.load(Ordering::Relaxed).max(last_write)
        } else {
            last_write
        };
        self.epoch + Duration::from_millis(last) + window
    }

    /// Resolves once the connection has been idle for the full window.
    /// A zero window disables idle supervision.
    pub(crate) async fn idle(&self, window: Duration) {
        if window.is_zero() {
            std::future::pending::<()>().await;
        }
        loop {
            let deadline = self.deadline(window);
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

/// Byte-level observer invoked from the instrumented stream, used to fan
/// out `bytes_*` activity-tracker events from the owning driver task.
pub(crate) type ByteSink = Arc<dyn Fn(usize) + Send + Sync>;

/// Stream wrapper stamping the [`IdleMeter`] and feeding byte counts to the
/// activity trackers on every successful read and write.
pub(crate) struct Instrumented<S> {
    inner: S,
    meter: Arc<IdleMeter>,
    on_read: ByteSink,
    on_write: ByteSink,
}

impl<S> Instrumented<S> {
    pub(crate) fn new(inner: S, meter: Arc<IdleMeter>, on_read: ByteSink, on_write: ByteSink) -> Self {
        Self {
            inner,
            meter,
            on_read,
            on_write,
        }
    }
}

impl<S> std::fmt::Debug for Instrumented<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumented").finish_non_exhaustive()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Instrumented<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    this.meter.touch_read();
                    (this.on_read)(n);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Instrumented<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.meter.touch_write();
                    (this.on_write)(n);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn prefixed_replays_before_inner() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b" world").await.unwrap();
        drop(server);

        let mut stream = Prefixed::new(bytes::Bytes::from_static(b"hello"), client);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_meter_waits_for_both_directions() {
        let meter = IdleMeter::new();
        let window = Duration::from_secs(2);

        let idle = meter.idle(window);
        tokio::pin!(idle);

        tokio::time::advance(Duration::from_secs(1)).await;
        meter.touch_read();
        // read activity defers the deadline
        assert!(
            tokio::time::timeout(Duration::from_millis(1500), idle.as_mut())
                .await
                .is_err()
        );
        // and now the full window elapses without further traffic
        tokio::time::timeout(Duration::from_secs(3), idle)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_meter_ignores_reads_in_tunnel_mode() {
        let meter = IdleMeter::new();
        meter.disable_read_idle();
        let window = Duration::from_secs(2);

        let idle = meter.idle(window);
        tokio::pin!(idle);

        tokio::time::advance(Duration::from_secs(1)).await;
        meter.touch_read();
        // reads no longer defer: fires one window after the last write
        tokio::time::timeout(Duration::from_millis(1100), idle)
            .await
            .unwrap();
    }
}
