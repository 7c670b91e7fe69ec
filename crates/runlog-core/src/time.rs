//! Clock abstraction shared by every time-dependent part of the shipper.
//!
//! Breaker cooldowns, retry backoff, worker sleeps and record timestamps all
//! read time through [`Clock`], so tests can drive them with [`TestClock`]
//! instead of waiting on the wall clock.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Source of monotonic time, wall-clock time and sleeping.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant used for cooldowns and elapsed-time measurement.
    fn now(&self) -> Instant;

    /// Wall-clock time used for record timestamps.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Suspends the caller for `duration`.
    ///
    /// [`RealClock`] maps this to `tokio::time::sleep`; [`TestClock`]
    /// advances virtual time and yields.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production clock backed by the operating system and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying time, so a test can hand one clone to
/// the shipper and advance another.
#[derive(Debug, Clone)]
pub struct TestClock {
    elapsed_ns: Arc<AtomicU64>,
    wall_start_ns: u64,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock whose wall time starts at the current time.
    pub fn new() -> Self {
        Self::starting_at(SystemTime::now())
    }

    /// Creates a test clock whose wall time starts at `start`.
    pub fn starting_at(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            wall_start_ns: saturating_nanos(since_epoch),
            base_instant: Instant::now(),
        }
    }

    /// Moves both monotonic and wall time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.elapsed_ns.fetch_add(saturating_nanos(duration), Ordering::AcqRel);
    }

    /// Total virtual time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let wall_ns = self.wall_start_ns.saturating_add(self.elapsed_ns.load(Ordering::Acquire));
        DateTime::<Utc>::from(UNIX_EPOCH + Duration::from_nanos(wall_ns))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
