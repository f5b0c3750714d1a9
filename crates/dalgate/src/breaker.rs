//! Per-connector circuit breaker
//!
//! States: CLOSED (normal) → OPEN (failing, calls rejected immediately) →
//! HALF_OPEN (one trial call) → CLOSED or back to OPEN. Every connector gets
//! its own instance; the gateway reacts to transitions via the state-change
//! callback.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{Error, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CircuitState {
    /// Normal operation — calls pass through
    Closed = 0,
    /// Tripped — calls fail immediately without touching the store
    Open = 1,
    /// Probation — a single trial call is allowed
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

/// Callback invoked on every state transition: `(old, new)`.
pub type StateChangeFn = dyn Fn(CircuitState, CircuitState) + Send + Sync;

/// Point-in-time breaker reading, exposed through gateway metrics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failure count
    pub failure_count: u32,
    /// Calls attempted through this breaker (rejections excluded)
    pub total_calls: u64,
    /// Calls that failed
    pub failed_calls: u64,
    /// failed_calls / total_calls, 0.0 when idle
    pub failure_ratio: f64,
    /// Time until an open breaker allows a trial call
    pub time_to_next_attempt: Option<Duration>,
    /// When the most recent failure was recorded
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Failure-tracking state machine gating calls to one connector.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU32,
    total_calls: AtomicU64,
    failed_calls: AtomicU64,
    half_open_inflight: AtomicBool,
    last_failure: RwLock<Option<Instant>>,
    last_failure_at: RwLock<Option<DateTime<Utc>>>,
    opened_at: RwLock<Option<Instant>>,
    on_state_change: Option<Arc<StateChangeFn>>,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            name: String::new(),
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            total_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            half_open_inflight: AtomicBool::new(false),
            last_failure: RwLock::new(None),
            last_failure_at: RwLock::new(None),
            opened_at: RwLock::new(None),
            on_state_change: None,
        }
    }

    /// Name the breaker after the connector it guards; shows up in
    /// [`Error::BreakerOpen`] and log lines.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attach a state-change callback, invoked as `(old, new)` on every
    /// transition. The gateway uses this hook to fail over when the active
    /// connector's breaker opens.
    pub fn with_state_change(mut self, callback: Arc<StateChangeFn>) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.state.load(Ordering::SeqCst).into()
    }

    /// Consecutive failure count
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Non-mutating check: would a call be allowed right now?
    pub fn is_call_allowed(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => self.reset_elapsed(),
            CircuitState::HalfOpen => !self.half_open_inflight.load(Ordering::SeqCst),
        }
    }

    fn reset_elapsed(&self) -> bool {
        self.opened_at
            .read()
            .map(|t| t.elapsed() >= self.config.reset_timeout)
            .unwrap_or(true)
    }

    /// Run one operation through the breaker.
    ///
    /// Open + reset timeout not elapsed: rejects with [`Error::BreakerOpen`]
    /// without attempting the call. Open + timeout elapsed: transitions to
    /// half-open and attempts a single trial. Success in any non-open state
    /// zeroes the failure counter; half-open success closes the breaker.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.state() {
            CircuitState::Open => {
                if !self.reset_elapsed() {
                    return Err(Error::BreakerOpen {
                        connector: self.name.clone(),
                    });
                }
                // Claim the single trial slot before transitioning so parallel
                // callers racing out of OPEN cannot both be admitted
                if self
                    .half_open_inflight
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return Err(Error::BreakerOpen {
                        connector: self.name.clone(),
                    });
                }
                self.transition_to(CircuitState::HalfOpen);
            }
            CircuitState::HalfOpen => {
                // Only one trial call at a time during probation
                if self
                    .half_open_inflight
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return Err(Error::BreakerOpen {
                        connector: self.name.clone(),
                    });
                }
            }
            CircuitState::Closed => {}
        }

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let result = operation().await;
        self.half_open_inflight.store(false, Ordering::SeqCst);

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        if self.state() == CircuitState::HalfOpen {
            self.transition_to(CircuitState::Closed);
        }
    }

    fn record_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);

        // Failures further apart than the monitoring period restart the count
        let stale = self
            .last_failure
            .read()
            .map(|t| t.elapsed() > self.config.monitoring_period)
            .unwrap_or(false);

        *self.last_failure.write() = Some(Instant::now());
        *self.last_failure_at.write() = Some(Utc::now());

        match self.state() {
            CircuitState::HalfOpen => {
                // The trial call failed: straight back to open
                self.failure_count.fetch_add(1, Ordering::SeqCst);
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Closed => {
                let count = if stale {
                    self.failure_count.store(1, Ordering::SeqCst);
                    1
                } else {
                    self.failure_count.fetch_add(1, Ordering::SeqCst) + 1
                };
                if count >= self.config.failure_threshold {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed and zero the failure counter (ops hook).
    pub fn reset(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        self.transition_to(CircuitState::Closed);
    }

    /// Force the breaker open (test/ops hook).
    pub fn force_open(&self) {
        self.transition_to(CircuitState::Open);
    }

    /// Snapshot for metrics.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let total = self.total_calls.load(Ordering::Relaxed);
        let failed = self.failed_calls.load(Ordering::Relaxed);
        let time_to_next_attempt = if self.state() == CircuitState::Open {
            self.opened_at
                .read()
                .map(|t| self.config.reset_timeout.saturating_sub(t.elapsed()))
        } else {
            None
        };
        BreakerSnapshot {
            state: self.state(),
            failure_count: self.failure_count(),
            total_calls: total,
            failed_calls: failed,
            failure_ratio: if total == 0 {
                0.0
            } else {
                failed as f64 / total as f64
            },
            time_to_next_attempt,
            last_failure_at: *self.last_failure_at.read(),
        }
    }

    fn transition_to(&self, new_state: CircuitState) {
        let old = self.state.swap(new_state as u8, Ordering::SeqCst);
        let old_state = CircuitState::from(old);
        if old_state == new_state {
            return;
        }

        match new_state {
            CircuitState::Open => {
                *self.opened_at.write() = Some(Instant::now());
                warn!(breaker = %self.name, from = %old_state, "circuit breaker opened");
            }
            CircuitState::Closed => {
                *self.opened_at.write() = None;
                self.half_open_inflight.store(false, Ordering::SeqCst);
                debug!(breaker = %self.name, from = %old_state, "circuit breaker closed");
            }
            CircuitState::HalfOpen => {
                debug!("circuit breaker half-open, allowing trial call");
            }
        }

        if let Some(callback) = &self.on_state_change {
            callback(old_state, new_state);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_threshold(3)
            .with_reset_timeout(Duration::from_millis(50))
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(|| async { Err::<(), _>(Error::connection("down")) })
            .await;
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(fast_config());

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.is_call_allowed());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(fast_config());

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.failure_count(), 2);

        breaker
            .execute(|| async { Ok::<_, Error>(1) })
            .await
            .unwrap();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_rejects_without_calling() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }

        let invoked = AtomicUsize::new(0);
        let result = breaker
            .execute(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Error>(1) }
            })
            .await;

        assert!(matches!(result, Err(Error::BreakerOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_half_open_after_reset_timeout_then_closes() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.is_call_allowed());

        breaker
            .execute(|| async { Ok::<_, Error>(1) })
            .await
            .unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_stale_failures_restart_count() {
        let breaker = CircuitBreaker::new(
            fast_config().with_monitoring_period(Duration::from_millis(30)),
        );

        fail(&breaker).await;
        assert_eq!(breaker.failure_count(), 1);

        // A failure arriving after the window restarts the count at 1
        tokio::time::sleep(Duration::from_millis(40)).await;
        fail(&breaker).await;
        assert_eq!(breaker.failure_count(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Two rapid follow-ups reach the threshold of 3 from that restart
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_admits_single_trial() {
        let breaker = Arc::new(CircuitBreaker::new(fast_config()));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Hold the trial call open while a second caller arrives
        let gate = Arc::new(tokio::sync::Notify::new());
        let trial_breaker = breaker.clone();
        let trial_gate = gate.clone();
        let trial = tokio::spawn(async move {
            trial_breaker
                .execute(move || async move {
                    trial_gate.notified().await;
                    Ok::<_, Error>(1)
                })
                .await
        });

        while breaker.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }

        let invoked = AtomicUsize::new(0);
        let second = breaker
            .execute(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Error>(2) }
            })
            .await;
        assert!(matches!(second, Err(Error::BreakerOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        gate.notify_one();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_manual_reset_and_force_open() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.is_call_allowed());
    }

    #[tokio::test]
    async fn test_state_change_callback() {
        let transitions = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = transitions.clone();
        let breaker = CircuitBreaker::new(fast_config()).with_state_change(Arc::new(
            move |old, new| {
                seen.lock().push((old, new));
            },
        ));

        for _ in 0..3 {
            fail(&breaker).await;
        }
        breaker.reset();

        let transitions = transitions.lock();
        assert_eq!(
            transitions.as_slice(),
            &[
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_snapshot_metrics() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker
            .execute(|| async { Ok::<_, Error>(1) })
            .await
            .unwrap();
        fail(&breaker).await;

        let snap = breaker.snapshot();
        assert_eq!(snap.total_calls, 2);
        assert_eq!(snap.failed_calls, 1);
        assert!((snap.failure_ratio - 0.5).abs() < f64::EPSILON);
        assert!(snap.last_failure_at.is_some());
        assert!(snap.time_to_next_attempt.is_none());

        breaker.force_open();
        assert!(breaker.snapshot().time_to_next_attempt.is_some());
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).unwrap(),
            "\"HALF_OPEN\""
        );
        assert_eq!(serde_json::to_string(&CircuitState::Open).unwrap(), "\"OPEN\"");
    }
}
