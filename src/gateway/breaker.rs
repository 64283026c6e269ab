//! Circuit breaker shared by every caller of one external dependency.
//!
//! State lives in atomics so concurrent jobs probing the same service never race through a
//! read-then-write window: failure counting is `fetch_add` and every state change is a
//! compare-and-swap from the expected prior state.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Millisecond clock injected into breakers so tests can drive cool-downs by hand.
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed since an arbitrary, fixed origin.
    fn now_ms(&self) -> u64;
}

/// Monotonic clock backed by [`Instant`].
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Start a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast until the cool-down elapses.
    Open,
    /// A bounded number of trial calls are admitted.
    HalfOpen,
}

impl BreakerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            OPEN => Self::Open,
            HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Tuning for a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Failures within `window` that open the breaker.
    pub failure_threshold: u32,
    /// Rolling window over which failures accumulate.
    pub window: Duration,
    /// Time spent open before trial calls are admitted.
    pub cooldown: Duration,
    /// Trial calls admitted while half-open.
    pub half_open_trials: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(30),
            cooldown: Duration::from_secs(15),
            half_open_trials: 1,
        }
    }
}

/// Kind of admission a [`Permit`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitKind {
    /// Regular call while closed.
    Normal,
    /// Trial call while half-open.
    Trial,
}

/// Admission granted by [`CircuitBreaker::try_acquire`]. Settle it with the call outcome.
///
/// A trial permit dropped without an outcome (the caller's future was cancelled) hands its
/// half-open slot back, so the breaker can still admit the next trial.
#[must_use = "settle the permit with record_success or record_failure"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    kind: PermitKind,
    epoch: u64,
    settled: bool,
}

impl Permit<'_> {
    /// Kind of admission.
    pub fn kind(&self) -> PermitKind {
        self.kind
    }

    /// Report that the admitted call succeeded.
    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.kind);
    }

    /// Report that the admitted call failed.
    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.kind);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.kind == PermitKind::Trial {
            self.breaker.release_trial(self.epoch);
        }
    }
}

/// Point-in-time view of a breaker for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    /// Dependency guarded by the breaker.
    pub service: String,
    /// Current state.
    pub state: BreakerState,
    /// Failures counted in the current window.
    pub failures: u32,
}

/// Fail-fast guard for one external dependency.
pub struct CircuitBreaker {
    service: String,
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    state: AtomicU8,
    failures: AtomicU32,
    window_started_ms: AtomicU64,
    opened_at_ms: AtomicU64,
    trials_in_flight: AtomicU32,
    /// Bumped whenever the trial budget is reset; stale trial permits must not release slots.
    epoch: AtomicU64,
}

impl CircuitBreaker {
    /// Build a breaker using the system clock.
    pub fn new(service: impl Into<String>, settings: BreakerSettings) -> Self {
        Self::with_clock(service, settings, Arc::new(SystemClock::new()))
    }

    /// Build a breaker reading time from `clock`.
    pub fn with_clock(
        service: impl Into<String>,
        settings: BreakerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_ms();
        Self {
            service: service.into(),
            settings,
            clock,
            state: AtomicU8::new(CLOSED),
            failures: AtomicU32::new(0),
            window_started_ms: AtomicU64::new(now),
            opened_at_ms: AtomicU64::new(0),
            trials_in_flight: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    /// Name of the guarded dependency.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current state. An open breaker whose cool-down has elapsed reports `Open` until the
    /// next call attempts admission.
    pub fn state(&self) -> BreakerState {
        BreakerState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Diagnostics snapshot.
    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            service: self.service.clone(),
            state: self.state(),
            failures: self.failures.load(Ordering::Acquire),
        }
    }

    /// Ask to place a call. `None` means the breaker is open and the call must not be made.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        loop {
            match self.state.load(Ordering::Acquire) {
                CLOSED => return Some(self.permit(PermitKind::Normal, 0)),
                OPEN => {
                    let opened_at = self.opened_at_ms.load(Ordering::Acquire);
                    let elapsed = self.clock.now_ms().saturating_sub(opened_at);
                    if elapsed < self.settings.cooldown.as_millis() as u64 {
                        return None;
                    }
                    if self
                        .state
                        .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        tracing::info!(
                            service = %self.service,
                            trials = self.settings.half_open_trials,
                            "Circuit breaker half-open"
                        );
                    }
                }
                _ => {
                    let epoch = self.epoch.load(Ordering::Acquire);
                    let taken = self.trials_in_flight.fetch_add(1, Ordering::AcqRel);
                    if taken < self.settings.half_open_trials {
                        return Some(self.permit(PermitKind::Trial, epoch));
                    }
                    self.trials_in_flight.fetch_sub(1, Ordering::AcqRel);
                    return None;
                }
            }
        }
    }

    fn permit(&self, kind: PermitKind, epoch: u64) -> Permit<'_> {
        Permit {
            breaker: self,
            kind,
            epoch,
            settled: false,
        }
    }

    fn on_success(&self, kind: PermitKind) {
        match kind {
            PermitKind::Normal => self.failures.store(0, Ordering::Release),
            PermitKind::Trial => {
                if self
                    .state
                    .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.reset_trials();
                    self.failures.store(0, Ordering::Release);
                    self.window_started_ms
                        .store(self.clock.now_ms(), Ordering::Release);
                    tracing::info!(service = %self.service, "Circuit breaker closed");
                }
            }
        }
    }

    fn on_failure(&self, kind: PermitKind) {
        match kind {
            PermitKind::Trial => self.trip(HALF_OPEN),
            PermitKind::Normal => {
                let now = self.clock.now_ms();
                let started = self.window_started_ms.load(Ordering::Acquire);
                if now.saturating_sub(started) > self.settings.window.as_millis() as u64
                    && self
                        .window_started_ms
                        .compare_exchange(started, now, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.failures.store(0, Ordering::Release);
                }
                let count = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if count >= self.settings.failure_threshold {
                    self.trip(CLOSED);
                }
            }
        }
    }

    /// Give back the slot of a trial that ended without an outcome.
    fn release_trial(&self, epoch: u64) {
        if self.epoch.load(Ordering::Acquire) != epoch {
            return;
        }
        let released = self
            .trials_in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                taken.checked_sub(1)
            })
            .is_ok();
        if released {
            tracing::debug!(service = %self.service, "Abandoned trial call released its slot");
        }
    }

    fn reset_trials(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.trials_in_flight.store(0, Ordering::Release);
    }

    fn trip(&self, from: u8) {
        if self.state.load(Ordering::Acquire) != from {
            return;
        }
        self.opened_at_ms
            .store(self.clock.now_ms(), Ordering::Release);
        self.reset_trials();
        if self
            .state
            .compare_exchange(from, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::warn!(
                service = %self.service,
                from = ?BreakerState::from_raw(from),
                failures = self.failures.load(Ordering::Acquire),
                cooldown_ms = self.settings.cooldown.as_millis() as u64,
                "Circuit breaker opened"
            );
        }
    }
}
