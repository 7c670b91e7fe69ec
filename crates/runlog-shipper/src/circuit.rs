//! Circuit breaker gating sink writes.
//!
//! One breaker is shared by every worker of a shipper. It trips after
//! `failure_threshold` consecutive batch failures and then short-circuits
//! flush cycles until `cooldown` has elapsed since the last failure.
//!
//! # State Machine
//!
//! ```text
//!   ┌──────────────────┐   failure_count >= threshold   ┌──────────────────┐
//!   │      CLOSED      │ ─────────────────────────────▶ │       OPEN       │
//!   │ writes admitted  │                                │ writes rejected  │
//!   └──────────────────┘ ◀───────────────────────────── └──────────────────┘
//!            ▲                 probe succeeded                 │    ▲
//!            │                                    cooldown     │    │ probe failed
//!            │                                    elapsed      ▼    │ (cooldown re-armed)
//!            │                                      ┌──────────────────┐
//!            └───────────────────────────────────── │  one probe write │
//!                                                   └──────────────────┘
//! ```
//!
//! There is no separate half-open state: once the cooldown elapses exactly
//! one caller is admitted as a probe, and the breaker only closes when that
//! probe reports success.
//!
//! The probe slot is leased, not owned. It is freed when the probe reports
//! back, when its [`ProbeGuard`] is dropped (cancelled or panicked flush),
//! or when the lease of one `cooldown` runs out (hung write).

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use runlog_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time after the last failure before a probe is admitted.
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown: Duration::from_secs(60) }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Writes flow normally.
    Closed,
    /// Writes are short-circuited until the cooldown elapses.
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Identifies one claim of the probe slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTicket(u64);

/// Outcome of asking the breaker for permission to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; write normally.
    Admitted,
    /// Circuit open but cooled down; this caller holds the single probe
    /// slot and must report the outcome, or release the slot if it ends up
    /// not writing.
    Probe(ProbeTicket),
    /// Circuit open; do not write.
    Rejected,
}

impl Admission {
    /// Whether the caller may write.
    pub fn is_allowed(self) -> bool {
        !matches!(self, Self::Rejected)
    }

    /// Whether this admission is the probe.
    pub fn is_probe(self) -> bool {
        matches!(self, Self::Probe(_))
    }
}

/// Point-in-time view of the breaker for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    /// Time left before a probe is admitted, when open.
    pub cooldown_remaining_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    probe_claimed_at: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            probe_claimed_at: None,
        }
    }

    fn cooldown_remaining(&self, now: Instant, cooldown: Duration) -> Duration {
        self.last_failure_time
            .map_or(Duration::ZERO, |failed_at| cooldown.saturating_sub(now.duration_since(failed_at)))
    }
}

/// Thread-safe consecutive-failure circuit breaker.
///
/// State transitions happen behind one mutex, so concurrent workers observe
/// and update state atomically. The active probe ticket lives in an atomic
/// so a [`ProbeGuard`] can free it from `Drop`.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    state: Mutex<BreakerState>,
    /// Ticket holding the probe slot, `0` when free.
    active_probe: AtomicU64,
    next_ticket: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::new()),
            active_probe: AtomicU64::new(0),
            next_ticket: AtomicU64::new(1),
            clock,
        }
    }

    /// Whether a claimed probe still holds its lease at `now`.
    fn probe_held(&self, breaker: &BreakerState, now: Instant) -> bool {
        if self.active_probe.load(Ordering::Acquire) == 0 {
            return false;
        }
        breaker
            .probe_claimed_at
            .is_some_and(|claimed_at| now.duration_since(claimed_at) < self.config.cooldown)
    }

    /// Asks whether a write may proceed.
    ///
    /// While open and cooled down, exactly one caller receives
    /// [`Admission::Probe`]; everyone else is rejected until that probe
    /// reports back, releases its slot, or outlives its lease.
    #[allow(clippy::significant_drop_tightening)] // Check and claim must be atomic
    pub async fn admit(&self) -> Admission {
        let mut breaker = self.state.lock().await;
        let now = self.clock.now();

        match breaker.state {
            CircuitState::Closed => Admission::Admitted,
            CircuitState::Open => {
                if self.probe_held(&breaker, now) {
                    return Admission::Rejected;
                }
                if !breaker.cooldown_remaining(now, self.config.cooldown).is_zero() {
                    return Admission::Rejected;
                }

                let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                let previous = self.active_probe.swap(ticket, Ordering::AcqRel);
                if previous != 0 {
                    warn!(
                        lease_ms = duration_ms(self.config.cooldown),
                        "circuit probe lease expired without a result, admitting a new probe"
                    );
                }
                breaker.probe_claimed_at = Some(now);
                info!(failure_count = breaker.failure_count, "circuit cooldown elapsed, admitting probe");
                Admission::Probe(ProbeTicket(ticket))
            },
        }
    }

    /// `true` when [`CircuitBreaker::admit`] would currently allow a write.
    /// Does not claim the probe slot.
    pub async fn can_execute(&self) -> bool {
        let breaker = self.state.lock().await;
        let now = self.clock.now();
        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                !self.probe_held(&breaker, now)
                    && breaker.cooldown_remaining(now, self.config.cooldown).is_zero()
            },
        }
    }

    /// Gives back a probe slot that was never used for a write. Returns
    /// `false` for a stale ticket, which is ignored.
    pub fn release_probe(&self, ticket: ProbeTicket) -> bool {
        self.active_probe.compare_exchange(ticket.0, 0, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Holds the probe slot for `ticket` until the guard is dropped.
    pub fn hold_probe(&self, ticket: ProbeTicket) -> ProbeGuard<'_> {
        ProbeGuard { breaker: self, ticket }
    }

    /// Records a successful write: resets the failure count and closes the
    /// circuit.
    #[allow(clippy::significant_drop_tightening)] // Atomic state transition required
    pub async fn record_success(&self) {
        let mut breaker = self.state.lock().await;
        let was_open = breaker.state == CircuitState::Open;

        breaker.state = CircuitState::Closed;
        breaker.failure_count = 0;
        breaker.last_failure_time = None;
        breaker.probe_claimed_at = None;
        self.active_probe.store(0, Ordering::Release);

        if was_open {
            info!("circuit closed after successful probe");
        }
    }

    /// Records a failed write. Opens the circuit once the threshold is
    /// reached; while already open, re-arms the cooldown.
    #[allow(clippy::significant_drop_tightening)] // Atomic state transition required
    pub async fn record_failure(&self) {
        let mut breaker = self.state.lock().await;

        breaker.failure_count = breaker.failure_count.saturating_add(1);
        breaker.last_failure_time = Some(self.clock.now());
        breaker.probe_claimed_at = None;
        self.active_probe.store(0, Ordering::Release);

        match breaker.state {
            CircuitState::Closed if breaker.failure_count >= self.config.failure_threshold => {
                breaker.state = CircuitState::Open;
                warn!(
                    failure_count = breaker.failure_count,
                    cooldown_ms = duration_ms(self.config.cooldown),
                    "circuit opened, sink writes suspended"
                );
            },
            CircuitState::Closed => {},
            CircuitState::Open => {
                warn!(
                    failure_count = breaker.failure_count,
                    cooldown_ms = duration_ms(self.config.cooldown),
                    "circuit probe failed, cooldown re-armed"
                );
            },
        }
    }

    /// Current state.
    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Consecutive failures since the last success.
    pub async fn failure_count(&self) -> u32 {
        self.state.lock().await.failure_count
    }

    /// Snapshot for introspection.
    pub async fn snapshot(&self) -> CircuitSnapshot {
        let breaker = self.state.lock().await;
        let cooldown_remaining_ms = (breaker.state == CircuitState::Open).then(|| {
            duration_ms(breaker.cooldown_remaining(self.clock.now(), self.config.cooldown))
        });
        CircuitSnapshot { state: breaker.state, failure_count: breaker.failure_count, cooldown_remaining_ms }
    }
}

/// Frees the probe slot on drop unless the probe already reported back.
///
/// Held across the probe write so a cancelled or panicking flush cannot
/// keep the slot.
#[derive(Debug)]
pub struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    ticket: ProbeTicket,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.breaker.release_probe(self.ticket);
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
