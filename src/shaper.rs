//! Global traffic shaping.
//!
//! One [`TrafficShaper`] is shared by every connection of a proxy instance.
//! Each direction runs a token bucket replenished every 250 ms; connections
//! record the bytes they moved and, once the budget of the current interval
//! is overdrawn, delay their next operation until the bucket has caught up.
//! Rates may be adjusted at runtime and are read atomically.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Replenish interval of the token buckets.
pub const SHAPING_INTERVAL: Duration = Duration::from_millis(250);

/// Byte-rate limiter for both directions of a proxy instance.
///
/// A rate of `0` disables shaping for that direction.
#[derive(Debug)]
pub struct TrafficShaper {
    read: Limiter,
    write: Limiter,
}

impl TrafficShaper {
    /// Create a shaper with the given rates in bytes per second.
    #[must_use]
    pub fn new(read_bytes_per_second: u64, write_bytes_per_second: u64) -> Arc<Self> {
        Arc::new(Self {
            read: Limiter::new(read_bytes_per_second),
            write: Limiter::new(write_bytes_per_second),
        })
    }

    /// Adjust both rates. Takes effect from the next replenish interval.
    pub fn set_rates(&self, read_bytes_per_second: u64, write_bytes_per_second: u64) {
        self.read.rate.store(read_bytes_per_second, Ordering::Relaxed);
        self.write.rate.store(write_bytes_per_second, Ordering::Relaxed);
    }

    /// Current `(read, write)` rates in bytes per second.
    #[must_use]
    pub fn rates(&self) -> (u64, u64) {
        (
            self.read.rate.load(Ordering::Relaxed),
            self.write.rate.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn record_read(&self, n: usize) -> Option<Instant> {
        self.read.record(n as u64)
    }

    pub(crate) fn record_write(&self, n: usize) -> Option<Instant> {
        self.write.record(n as u64)
    }
}

#[derive(Debug)]
struct Limiter {
    rate: AtomicU64,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    /// Remaining budget of the current interval; goes negative on overdraft.
    balance: i64,
    /// Start of the next replenish interval.
    replenish_at: Instant,
}

impl Limiter {
    fn new(rate: u64) -> Self {
        Self {
            rate: AtomicU64::new(rate),
            state: Mutex::new(Bucket {
                balance: interval_budget(rate),
                replenish_at: Instant::now() + SHAPING_INTERVAL,
            }),
        }
    }

    /// Record `n` transferred bytes; returns the instant until which the
    /// caller must pause before its next operation, if the bucket is
    /// overdrawn.
    fn record(&self, n: u64) -> Option<Instant> {
        let rate = self.rate.load(Ordering::Relaxed);
        if rate == 0 {
            return None;
        }
        let budget = interval_budget(rate);
        let Ok(mut bucket) = self.state.lock() else {
            return None;
        };

        // replenish every interval that elapsed since the last record
        let now = Instant::now();
        if now >= bucket.replenish_at {
            let elapsed = now.duration_since(bucket.replenish_at);
            let intervals = 1 + elapsed.as_millis() / SHAPING_INTERVAL.as_millis();
            let gained = i64::try_from(intervals).unwrap_or(i64::MAX).saturating_mul(budget);
            bucket.balance = bucket.balance.saturating_add(gained).min(budget);
            bucket.replenish_at += SHAPING_INTERVAL * u32::try_from(intervals).unwrap_or(u32::MAX);
        }

        bucket.balance = bucket
            .balance
            .saturating_sub(i64::try_from(n).unwrap_or(i64::MAX));
        if bucket.balance >= 0 {
            return None;
        }

        // overdrawn: pause until enough future intervals have replenished
        let deficit = bucket.balance.unsigned_abs();
        let intervals = deficit.div_ceil(budget.unsigned_abs().max(1));
        let wait_until = bucket.replenish_at
            + SHAPING_INTERVAL * u32::try_from(intervals.saturating_sub(1)).unwrap_or(u32::MAX);
        Some(wait_until)
    }
}

fn interval_budget(rate: u64) -> i64 {
    let per_interval = rate.saturating_mul(SHAPING_INTERVAL.as_millis() as u64) / 1000;
    i64::try_from(per_interval.max(1)).unwrap_or(i64::MAX)
}

pub(crate) mod throttled {
    use super::TrafficShaper;
    use std::io;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll, ready};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio::time::Sleep;

    /// Stream wrapper enforcing the delays handed out by the shared
    /// [`TrafficShaper`].
    pub(crate) struct Throttled<S> {
        inner: S,
        shaper: Arc<TrafficShaper>,
        read_delay: Option<Pin<Box<Sleep>>>,
        write_delay: Option<Pin<Box<Sleep>>>,
    }

    impl<S> Throttled<S> {
        pub(crate) fn new(inner: S, shaper: Arc<TrafficShaper>) -> Self {
            Self {
                inner,
                shaper,
                read_delay: None,
                write_delay: None,
            }
        }
    }

    impl<S: AsyncRead + Unpin> AsyncRead for Throttled<S> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = &mut *self;
            if let Some(delay) = &mut this.read_delay {
                ready!(delay.as_mut().poll(cx));
                this.read_delay = None;
            }
            let before = buf.filled().len();
            ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
            let n = buf.filled().len() - before;
            if n > 0
                && let Some(until) = this.shaper.record_read(n)
            {
                this.read_delay = Some(Box::pin(tokio::time::sleep_until(until)));
            }
            Poll::Ready(Ok(()))
        }
    }

    impl<S: AsyncWrite + Unpin> AsyncWrite for Throttled<S> {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = &mut *self;
            if let Some(delay) = &mut this.write_delay {
                ready!(delay.as_mut().poll(cx));
                this.write_delay = None;
            }
            let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
            if n > 0
                && let Some(until) = this.shaper.record_write(n)
            {
                this.write_delay = Some(Box::pin(tokio::time::sleep_until(until)));
            }
            Poll::Ready(Ok(n))
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unlimited_rate_never_delays() {
        let shaper = TrafficShaper::new(0, 0);
        assert!(shaper.record_read(usize::MAX / 2).is_none());
        assert!(shaper.record_write(1024).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn overdraft_schedules_catchup_delay() {
        // 1000 B/s -> 250 bytes per interval
        let shaper = TrafficShaper::new(1000, 0);
        // first interval budget absorbs 250 bytes
        assert!(shaper.record_read(250).is_none());
        // the next kilobyte overdraws four intervals worth of budget
        let until = shaper.record_read(1000).unwrap();
        let wait = until.duration_since(Instant::now());
        assert!(
            wait >= Duration::from_millis(900) && wait <= Duration::from_millis(1100),
            "unexpected wait: {wait:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn budget_replenishes_over_time() {
        let shaper = TrafficShaper::new(1000, 0);
        assert!(shaper.record_read(250).is_none());
        let _ = shaper.record_read(250);
        tokio::time::advance(Duration::from_secs(2)).await;
        // long quiet period restores (at most) one interval of budget
        assert!(shaper.record_read(200).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rates_adjustable_at_runtime() {
        let shaper = TrafficShaper::new(1000, 2000);
        assert_eq!(shaper.rates(), (1000, 2000));
        shaper.set_rates(0, 0);
        assert_eq!(shaper.rates(), (0, 0));
        assert!(shaper.record_read(1 << 20).is_none());
    }
}
