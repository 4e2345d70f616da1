//! # Resilience Core
//!
//! Circuit breaker state machine, retry executor with exponential backoff and
//! jitter, and the named breaker registry that assigns every external
//! dependency its own protection profile.
//!
//! ## Composition Rule
//!
//! Resilient clients compose these primitives as retry(breaker(timeout(op))).
//! A [`BackupForgeError::CircuitOpen`] rejection is never retried: retrying
//! would hammer a breaker that is already shedding load. Rejections never
//! reach the wrapped operation and never count as dependency failures.
//!
//! ## State Machine
//!
//! - **Closed**: requests pass, failures counted; a success resets the streak
//! - **Open**: all requests rejected without invoking the operation; after
//!   `recovery_delay` the first arriving caller performs the Open→HalfOpen
//!   transition exactly once
//! - **HalfOpen**: a bounded number of probe requests allowed; any probe
//!   failure reopens, `success_threshold_to_close` consecutive successes
//!   close and reset the counters

use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::logging::{log_info, log_warn, LogCategory};
use crate::{BackupForgeError, Result};

/// Well-known breaker names for the external dependencies
pub const DEP_OBJECT_STORE: &str = "object-store";
pub const DEP_CLUSTER_API: &str = "cluster-api";
pub const DEP_GIT: &str = "git";
pub const DEP_HTTP_GENERIC: &str = "http-generic";
pub const DEP_SECURITY_POLICY: &str = "security-policy";

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, failures counted
    Closed,
    /// Failing, reject requests without invoking the operation
    Open,
    /// Bounded probing to test recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Concurrent probe budget while half-open
    pub half_open_max_concurrent: u32,
    /// Consecutive probe successes required to close
    pub success_threshold_to_close: u32,
    /// Time to wait in Open before allowing a probe
    pub recovery_delay: Duration,
    /// Deadline applied to every wrapped operation
    pub operation_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            half_open_max_concurrent: 1,
            success_threshold_to_close: 3,
            recovery_delay: Duration::from_secs(120),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

/// Monotonic call counters kept outside the state mutex
#[derive(Debug, Default)]
struct BreakerCounters {
    total: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    rejected: AtomicU64,
}

/// Serializable snapshot of a breaker for health and status reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_streak: u32,
    pub success_streak_half_open: u32,
    pub open_for_ms: Option<u64>,
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub rejected: u64,
}

/// Mutable transition state, guarded by a mutex
struct BreakerInner {
    state: CircuitState,
    failure_streak: u32,
    success_streak_half_open: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    last_transition_at: Instant,
}

type FailurePredicate = Arc<dyn Fn(&BackupForgeError) -> bool + Send + Sync>;

/// Per-dependency circuit breaker
///
/// Only one Open→HalfOpen→Closed probe train is live at a time: the
/// transition happens under the state mutex, so exactly one caller wins the
/// race after `recovery_delay` elapses.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    is_failure: FailurePredicate,
    inner: Mutex<BreakerInner>,
    counters: BreakerCounters,
}

impl CircuitBreaker {
    /// Create a breaker with the given name and configuration
    ///
    /// The default failure predicate counts transient causes and timeouts;
    /// permanent refusals, validation failures, and cancellation do not mark
    /// the dependency unhealthy.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            is_failure: Arc::new(|e| {
                matches!(
                    e,
                    BackupForgeError::TransientRemote { .. } | BackupForgeError::Timeout { .. }
                )
            }),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_streak: 0,
                success_streak_half_open: 0,
                half_open_in_flight: 0,
                opened_at: None,
                last_transition_at: Instant::now(),
            }),
            counters: BreakerCounters::default(),
        }
    }

    /// Override the failure predicate
    pub fn with_failure_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&BackupForgeError) -> bool + Send + Sync + 'static,
    {
        self.is_failure = Arc::new(predicate);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Execute an operation under breaker protection and the operation timeout
    ///
    /// Returns [`BackupForgeError::CircuitOpen`] without invoking `op` when
    /// the breaker is Open and not yet eligible to probe, or when the
    /// half-open probe budget is exhausted.
    pub async fn execute<T, Fut, Op>(&self, op: Op) -> Result<T>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let entered_half_open = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => false,
                CircuitState::Open => {
                    let eligible = inner
                        .opened_at
                        .map(|at| at.elapsed() >= self.config.recovery_delay)
                        .unwrap_or(true);
                    if !eligible {
                        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                        counter!("circuit_breaker_rejections_total", 1, "breaker" => self.name.clone());
                        return Err(self.open_error(&inner));
                    }
                    // First caller past the recovery delay performs the
                    // transition; the mutex makes this atomic.
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.success_streak_half_open = 0;
                    inner.half_open_in_flight = 1;
                    true
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight >= self.config.half_open_max_concurrent {
                        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                        counter!("circuit_breaker_rejections_total", 1, "breaker" => self.name.clone());
                        return Err(self.open_error(&inner));
                    }
                    inner.half_open_in_flight += 1;
                    true
                }
            }
        };

        let timeout = self.config.operation_timeout;
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(BackupForgeError::Timeout {
                operation: self.name.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        let failed = match &result {
            Ok(_) => false,
            Err(e) => (self.is_failure)(e),
        };

        {
            let mut inner = self.inner.lock();
            if entered_half_open {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }

            match &result {
                Ok(_) => {
                    self.counters.success.fetch_add(1, Ordering::Relaxed);
                    self.on_success(&mut inner);
                }
                Err(_) if failed => {
                    self.counters.failure.fetch_add(1, Ordering::Relaxed);
                    self.on_failure(&mut inner);
                }
                Err(_) => {
                    // Judged non-failure (permanent refusal, validation,
                    // cancellation): leaves streaks untouched.
                }
            }
        }

        result
    }

    fn on_success(&self, inner: &mut BreakerInner) {
        match inner.state {
            CircuitState::Closed => {
                inner.failure_streak = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_streak_half_open += 1;
                if inner.success_streak_half_open >= self.config.success_threshold_to_close {
                    self.transition(inner, CircuitState::Closed);
                    inner.failure_streak = 0;
                    inner.success_streak_half_open = 0;
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut BreakerInner) {
        inner.failure_streak += 1;
        match inner.state {
            CircuitState::Closed => {
                if inner.failure_streak >= self.config.failure_threshold {
                    self.transition(inner, CircuitState::Open);
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                // Any probe failure reopens
                self.transition(inner, CircuitState::Open);
                inner.opened_at = Some(Instant::now());
                inner.success_streak_half_open = 0;
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.last_transition_at = Instant::now();
        counter!("circuit_breaker_transitions_total", 1,
            "breaker" => self.name.clone(), "to" => to.to_string());
        gauge!("circuit_breaker_state", state_gauge(to), "breaker" => self.name.clone());
        match to {
            CircuitState::Open => log_warn(
                LogCategory::Error,
                &format!("Circuit breaker '{}' {from} -> open", self.name),
            ),
            _ => log_info(
                LogCategory::System,
                &format!("Circuit breaker '{}' {from} -> {to}", self.name),
            ),
        }
    }

    fn open_error(&self, inner: &BreakerInner) -> BackupForgeError {
        BackupForgeError::CircuitOpen {
            dependency: self.name.clone(),
            failure_count: inner.failure_streak as u64,
        }
    }

    /// Manually close the breaker and reset all streaks
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.failure_streak = 0;
        inner.success_streak_half_open = 0;
        inner.half_open_in_flight = 0;
        inner.opened_at = None;
    }

    /// Manually open the breaker (maintenance or manual intervention)
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Open);
        inner.opened_at = Some(Instant::now());
    }

    /// Snapshot for health and status reporting
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_streak: inner.failure_streak,
            success_streak_half_open: inner.success_streak_half_open,
            open_for_ms: inner.opened_at.map(|at| at.elapsed().as_millis() as u64),
            total: self.counters.total.load(Ordering::Relaxed),
            success: self.counters.success.load(Ordering::Relaxed),
            failure: self.counters.failure.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

fn state_gauge(state: CircuitState) -> f64 {
    match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("CircuitBreaker")
            .field("name", &snapshot.name)
            .field("state", &snapshot.state)
            .field("failure_streak", &snapshot.failure_streak)
            .field("total", &snapshot.total)
            .field("rejected", &snapshot.rejected)
            .finish()
    }
}

/// Retry configuration
///
/// Delay for attempt k (1-indexed, k >= 2) is
/// `min(max_delay, initial_delay * multiplier^(k-1))`, then jitter widens the
/// effective wait to a uniform sample from `[delay*(1-j), delay*(1+j)]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (1 = no retry)
    pub max_attempts: u32,
    /// Base delay fed into the backoff curve
    pub initial_delay: Duration,
    /// Ceiling applied before jitter
    pub max_delay: Duration,
    /// Exponential multiplier
    pub multiplier: f64,
    /// Jitter fraction (0.0 to 1.0)
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::medium()
    }
}

impl RetryConfig {
    /// Profile for critical-priority kinds (priority >= 90)
    pub fn critical() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_pct: 0.1,
        }
    }

    /// Profile for high-priority kinds (priority >= 70)
    pub fn high() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_pct: 0.1,
        }
    }

    /// Profile for medium-priority kinds (priority >= 50)
    pub fn medium() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_pct: 0.1,
        }
    }

    /// Profile for low-priority kinds (priority < 50)
    pub fn low() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_pct: 0.1,
        }
    }

    /// Select the built-in profile for a priority band
    pub fn for_priority(priority: u8) -> Self {
        match priority {
            p if p >= 90 => Self::critical(),
            p if p >= 70 => Self::high(),
            p if p >= 50 => Self::medium(),
            _ => Self::low(),
        }
    }

    /// Name of the band this configuration came from
    pub fn band_for_priority(priority: u8) -> &'static str {
        match priority {
            p if p >= 90 => "critical",
            p if p >= 70 => "high",
            p if p >= 50 => "medium",
            _ => "low",
        }
    }
}

type RetryPredicate = Arc<dyn Fn(&BackupForgeError) -> bool + Send + Sync>;

/// Retry executor with exponential backoff and jitter
///
/// Repeats the operation until success, cancellation, attempt exhaustion, or
/// a non-retryable error. Cancellation during a backoff sleep surfaces
/// immediately as [`BackupForgeError::Cancelled`].
#[derive(Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    should_retry: RetryPredicate,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            should_retry: Arc::new(BackupForgeError::is_retryable),
        }
    }

    /// Override the retryable-error predicate
    ///
    /// Circuit-open rejections and cancellation short-circuit regardless of
    /// the predicate.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&BackupForgeError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `op` until it succeeds or the retry budget is spent
    pub async fn execute<T, Fut, Op>(&self, cancel: &CancellationToken, mut op: Op) -> Result<T>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_cause: Option<BackupForgeError> = None;

        for attempt in 1..=self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(BackupForgeError::Cancelled);
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if e.is_circuit_open() || e.is_cancelled() || !(self.should_retry)(&e) {
                        return Err(e);
                    }

                    counter!("retry_attempts_total", 1);
                    last_cause = Some(e);

                    if attempt == self.config.max_attempts {
                        break;
                    }

                    // Delay before attempt k is computed with k 1-indexed
                    let delay = self.delay_for_attempt(attempt + 1);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(BackupForgeError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        Err(BackupForgeError::RetryExhausted {
            attempts: self.config.max_attempts,
            last: last_cause
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    /// Backoff delay for attempt `k` (k >= 2), jitter applied
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base_ms =
            self.config.initial_delay.as_secs_f64() * 1000.0 * self.config.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.config.max_delay.as_secs_f64() * 1000.0);

        let jittered_ms = if self.config.jitter_pct > 0.0 {
            let low = capped_ms * (1.0 - self.config.jitter_pct);
            let high = capped_ms * (1.0 + self.config.jitter_pct);
            rand::thread_rng().gen_range(low..=high)
        } else {
            capped_ms
        };

        Duration::from_secs_f64((jittered_ms / 1000.0).max(0.0))
    }
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("config", &self.config)
            .finish()
    }
}

/// Named registry of circuit breakers, one per external dependency
///
/// Known dependency names receive the tuned default profile below; HTTP
/// breakers for specific logical endpoints are created on demand with the
/// generic HTTP profile.
///
/// | dependency | failure threshold | recovery delay | operation timeout |
/// |---|---|---|---|
/// | object-store | 10 | 5 min | 2 min |
/// | cluster-api | 8 | 3 min | 1 min |
/// | git | 3 | 10 min | 5 min |
/// | http-generic | 5 | 2 min | 30 s |
/// | security-policy | 3 | 1 min | 30 s |
pub struct BreakerManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerManager {
    pub fn new() -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Default protection profile for a dependency name
    pub fn default_profile(name: &str) -> CircuitBreakerConfig {
        match name {
            DEP_OBJECT_STORE => CircuitBreakerConfig {
                failure_threshold: 10,
                recovery_delay: Duration::from_secs(300),
                operation_timeout: Duration::from_secs(120),
                ..CircuitBreakerConfig::default()
            },
            DEP_CLUSTER_API => CircuitBreakerConfig {
                failure_threshold: 8,
                recovery_delay: Duration::from_secs(180),
                operation_timeout: Duration::from_secs(60),
                ..CircuitBreakerConfig::default()
            },
            DEP_GIT => CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_delay: Duration::from_secs(600),
                operation_timeout: Duration::from_secs(300),
                ..CircuitBreakerConfig::default()
            },
            DEP_SECURITY_POLICY => CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_delay: Duration::from_secs(60),
                operation_timeout: Duration::from_secs(30),
                ..CircuitBreakerConfig::default()
            },
            // http-generic and per-endpoint HTTP breakers
            _ => CircuitBreakerConfig {
                failure_threshold: 5,
                recovery_delay: Duration::from_secs(120),
                operation_timeout: Duration::from_secs(30),
                ..CircuitBreakerConfig::default()
            },
        }
    }

    /// Return the existing breaker for `name`, creating it with the default
    /// profile if needed
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(name) {
            return existing.clone();
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, Self::default_profile(name)))
            })
            .clone()
    }

    /// Register a breaker with an explicit configuration, replacing any
    /// default-profile instance
    pub fn register(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        self.breakers
            .write()
            .insert(name.to_string(), breaker.clone());
        breaker
    }

    /// Percentage of registered breakers currently not Open
    pub fn overall_health_percent(&self) -> f64 {
        let breakers = self.breakers.read();
        if breakers.is_empty() {
            return 100.0;
        }
        let healthy = breakers
            .values()
            .filter(|b| b.state() != CircuitState::Open)
            .count();
        (healthy as f64 / breakers.len() as f64) * 100.0
    }

    /// Snapshots of every registered breaker
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .read()
            .values()
            .map(|b| b.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Reset every breaker to Closed
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }
}

impl Default for BreakerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BreakerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerManager")
            .field("breakers", &self.snapshots())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn transient(msg: &str) -> BackupForgeError {
        BackupForgeError::TransientRemote {
            dependency: "test".to_string(),
            message: msg.to_string(),
        }
    }

    fn fast_breaker(failure_threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold,
                half_open_max_concurrent: 1,
                success_threshold_to_close: 2,
                recovery_delay: Duration::from_millis(recovery_ms),
                operation_timeout: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn test_breaker_passes_while_closed() {
        let breaker = fast_breaker(3, 50);

        let result: Result<u32> = breaker.execute(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::Closed);

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.success, 1);
        assert_eq!(snapshot.rejected, 0);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_threshold() {
        let breaker = fast_breaker(3, 10_000);

        for _ in 0..3 {
            let result: Result<u32> = breaker.execute(|| async { Err(transient("boom")) }).await;
            assert!(result.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Rejections must not reach the operation
        let calls = AtomicU32::new(0);
        let result: Result<u32> = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;
        assert!(matches!(result, Err(BackupForgeError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_single_failure_when_threshold_is_one() {
        let breaker = fast_breaker(1, 10_000);
        let result: Result<u32> = breaker.execute(|| async { Err(transient("boom")) }).await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_breaker_success_resets_failure_streak_while_closed() {
        let breaker = fast_breaker(3, 10_000);

        for _ in 0..2 {
            let _: Result<u32> = breaker.execute(|| async { Err(transient("boom")) }).await;
        }
        let _: Result<u32> = breaker.execute(|| async { Ok(1) }).await;
        for _ in 0..2 {
            let _: Result<u32> = breaker.execute(|| async { Err(transient("boom")) }).await;
        }
        // Streak was reset by the success, so two more failures do not open
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_breaker_recovers_through_half_open() {
        let breaker = fast_breaker(1, 20);

        let _: Result<u32> = breaker.execute(|| async { Err(transient("boom")) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;

        // First probe succeeds, breaker is half-open until the close threshold
        let result: Result<u32> = breaker.execute(|| async { Ok(1) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Second success closes (success_threshold_to_close == 2)
        let result: Result<u32> = breaker.execute(|| async { Ok(2) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens() {
        let breaker = fast_breaker(1, 20);

        let _: Result<u32> = breaker.execute(|| async { Err(transient("boom")) }).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let result: Result<u32> = breaker.execute(|| async { Err(transient("again")) }).await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_probe_budget_rejects_concurrent_callers() {
        let breaker = Arc::new(fast_breaker(1, 20));

        let _: Result<u32> = breaker.execute(|| async { Err(transient("boom")) }).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Occupy the single probe slot with a slow operation
        let slow = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<u32, BackupForgeError>(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result: Result<u32> = breaker.execute(|| async { Ok(2) }).await;
        assert!(matches!(result, Err(BackupForgeError::CircuitOpen { .. })));

        assert!(slow.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_operation_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 1,
                operation_timeout: Duration::from_millis(20),
                recovery_delay: Duration::from_secs(60),
                ..CircuitBreakerConfig::default()
            },
        );

        let result: Result<u32> = breaker
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(1)
            })
            .await;
        assert!(matches!(result, Err(BackupForgeError::Timeout { .. })));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_permanent_errors_do_not_trip_breaker() {
        let breaker = fast_breaker(1, 10_000);

        let result: Result<u32> = breaker
            .execute(|| async {
                Err(BackupForgeError::PermanentRemote {
                    dependency: "test".to_string(),
                    message: "404".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_manual_reset_and_force_open() {
        let breaker = fast_breaker(1, 10_000);

        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);

        let result: Result<u32> = breaker.execute(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            jitter_pct: 0.0,
        });

        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result = executor
            .execute(&cancel, || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 5 {
                    Err(transient("flaky"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 5);
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_wraps_last_cause() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
            jitter_pct: 0.0,
        });

        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<u32> = executor
            .execute(&cancel, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(transient("always down"))
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match result {
            Err(BackupForgeError::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.contains("always down"));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_runs_exactly_once_when_max_attempts_is_one() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
            jitter_pct: 0.0,
        });

        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<u32> = executor
            .execute(&cancel, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(transient("down"))
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result,
            Err(BackupForgeError::RetryExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_circuit_open_is_not_retried() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
            jitter_pct: 0.0,
        });

        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<u32> = executor
            .execute(&cancel, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(BackupForgeError::CircuitOpen {
                    dependency: "object-store".to_string(),
                    failure_count: 10,
                })
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(BackupForgeError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let executor = RetryExecutor::new(RetryConfig::medium());
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<u32> = executor
            .execute(&cancel, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(BackupForgeError::PermanentRemote {
                    dependency: "cluster-api".to_string(),
                    message: "403 forbidden".to_string(),
                })
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result,
            Err(BackupForgeError::PermanentRemote { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancellation_surfaces_during_backoff() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_pct: 0.0,
        });

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let start = Instant::now();
        let result: Result<u32> = executor
            .execute(&cancel, || async { Err(transient("down")) })
            .await;

        assert!(matches!(result, Err(BackupForgeError::Cancelled)));
        // Must not have waited out the 10s backoff
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_curve_doubles_and_caps() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter_pct: 0.0,
        });

        assert_eq!(executor.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(executor.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(executor.delay_for_attempt(4), Duration::from_millis(800));
        // Capped at max_delay
        assert_eq!(executor.delay_for_attempt(5), Duration::from_millis(1000));
        assert_eq!(executor.delay_for_attempt(8), Duration::from_millis(1000));
    }

    #[test]
    fn test_profile_selection_by_band() {
        assert_eq!(RetryConfig::for_priority(95).max_attempts, 5);
        assert_eq!(RetryConfig::for_priority(90).max_attempts, 5);
        assert_eq!(RetryConfig::for_priority(75).max_attempts, 4);
        assert_eq!(RetryConfig::for_priority(50).max_attempts, 3);
        assert_eq!(RetryConfig::for_priority(10).max_attempts, 2);
        assert_eq!(RetryConfig::band_for_priority(95), "critical");
        assert_eq!(RetryConfig::band_for_priority(49), "low");
    }

    #[tokio::test]
    async fn test_manager_returns_same_breaker_for_name() {
        let manager = BreakerManager::new();
        let a = manager.breaker(DEP_OBJECT_STORE);
        let b = manager.breaker(DEP_OBJECT_STORE);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_manager_default_profiles() {
        let object_store = BreakerManager::default_profile(DEP_OBJECT_STORE);
        assert_eq!(object_store.failure_threshold, 10);
        assert_eq!(object_store.recovery_delay, Duration::from_secs(300));
        assert_eq!(object_store.operation_timeout, Duration::from_secs(120));

        let git = BreakerManager::default_profile(DEP_GIT);
        assert_eq!(git.failure_threshold, 3);
        assert_eq!(git.recovery_delay, Duration::from_secs(600));

        // Per-endpoint HTTP breakers fall back to the generic profile
        let endpoint = BreakerManager::default_profile("http:gitops-generator");
        assert_eq!(endpoint.failure_threshold, 5);
        assert_eq!(endpoint.operation_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_manager_aggregate_health() {
        let manager = BreakerManager::new();
        assert_eq!(manager.overall_health_percent(), 100.0);

        let a = manager.breaker(DEP_OBJECT_STORE);
        let _b = manager.breaker(DEP_CLUSTER_API);
        let _c = manager.breaker(DEP_GIT);
        let _d = manager.breaker(DEP_HTTP_GENERIC);
        a.force_open();

        assert_eq!(manager.overall_health_percent(), 75.0);

        manager.reset_all();
        assert_eq!(manager.overall_health_percent(), 100.0);
    }

    mod jitter_properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn jitter_stays_within_bounds(attempt in 2u32..12, jitter in 0.0f64..0.5) {
                let config = RetryConfig {
                    max_attempts: 12,
                    initial_delay: Duration::from_millis(100),
                    max_delay: Duration::from_secs(30),
                    multiplier: 2.0,
                    jitter_pct: jitter,
                };
                let executor = RetryExecutor::new(config.clone());

                let base_ms = (100.0 * config.multiplier.powi(attempt as i32 - 1))
                    .min(30_000.0);
                let delay = executor.delay_for_attempt(attempt).as_secs_f64() * 1000.0;

                prop_assert!(delay >= base_ms * (1.0 - jitter) - 1e-6);
                prop_assert!(delay <= base_ms * (1.0 + jitter) + 1e-6);
            }
        }
    }
}
