//! Circuit Breaker State Machine
//!
//! ```text
//! CLOSED ──(failures >= threshold)──▶ OPEN
//!   ▲                                  │
//!   │                      (now >= next_attempt, next call)
//!   │                                  ▼
//!   └────────(trial succeeds)──── HALF_OPEN ──(trial fails)──▶ OPEN
//! ```
//!
//! All state lives behind one mutex; transitions and metric snapshots are
//! taken under it, listeners are notified after it is released.
//!
//! Every transition bumps an epoch. A call remembers the epoch it was
//! admitted in, and its outcome only moves the state machine if no transition
//! happened in between. A slow call admitted while CLOSED therefore cannot
//! decide a HALF_OPEN trial it was never part of.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::listener::BreakerListener;
use super::CircuitState;

// =============================================================================
// Configuration
// =============================================================================

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,
    /// Time spent OPEN before a trial call is let through
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl BreakerConfig {
    /// Create a configuration with the given threshold and recovery timeout
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
        }
    }
}

// =============================================================================
// Errors and Fallbacks
// =============================================================================

/// Outcome of a rejected or failed protected call
#[derive(Debug)]
pub enum BreakerError<E> {
    /// Breaker short-circuited the call
    Open { name: String },
    /// The wrapped operation failed; carries its error unchanged
    Failed(E),
}

impl<E> BreakerError<E> {
    /// True when the call was short-circuited
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// The downstream error, if the operation actually ran and failed
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Failed(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open { name } => write!(f, "Circuit breaker '{}' is open", name),
            BreakerError::Failed(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BreakerError::Failed(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

impl From<BreakerError<crate::error::Error>> for crate::error::Error {
    fn from(err: BreakerError<crate::error::Error>) -> Self {
        match err {
            BreakerError::Open { name } => crate::error::Error::CircuitOpen { name },
            BreakerError::Failed(e) => e,
        }
    }
}

/// Value served instead of the primary operation
pub enum Fallback<T> {
    /// Static value
    Value(T),
    /// Deferred computation, only run when the fallback is needed
    Call(Box<dyn FnOnce() -> BoxFuture<'static, T> + Send>),
}

impl<T: Send + 'static> Fallback<T> {
    /// Static fallback value
    pub fn value(value: T) -> Self {
        Fallback::Value(value)
    }

    /// Fallback computed lazily by an async closure
    pub fn call<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Fallback::Call(Box::new(move || f().boxed()))
    }

    async fn resolve(self) -> T {
        match self {
            Fallback::Value(v) => v,
            Fallback::Call(f) => f().await,
        }
    }
}

impl<T> fmt::Debug for Fallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fallback::Value(_) => f.write_str("Fallback::Value"),
            Fallback::Call(_) => f.write_str("Fallback::Call"),
        }
    }
}

// =============================================================================
// Metrics Snapshot
// =============================================================================

/// Point-in-time view of a breaker, taken under its lock
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures since the last success or reset
    pub failure_count: u32,
    /// Successful calls
    pub success_count: u64,
    /// All `execute` calls, including short-circuited ones
    pub request_count: u64,
    /// (request_count - success_count) / request_count, 0 with no requests
    pub failure_rate: f64,
    /// Milliseconds since monitoring started (creation or last reset)
    pub uptime_ms: u64,
    /// Wall-clock time of the most recent failure
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Wall-clock time after which a trial call is allowed
    pub next_attempt_time: Option<DateTime<Utc>>,
    /// Configured failure threshold
    pub failure_threshold: u32,
    /// Configured recovery timeout in milliseconds
    pub recovery_timeout_ms: u64,
}

// =============================================================================
// Circuit Breaker
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Primary,
    Trial,
    Rejected,
}

/// Admission decision plus the epoch it was made in
#[derive(Debug, Clone, Copy)]
struct Ticket {
    admission: Admission,
    epoch: u64,
}

type Transition = Option<(CircuitState, CircuitState)>;

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    request_count: u64,
    success_count: u64,
    last_failure_time: Option<DateTime<Utc>>,
    next_attempt: Option<Instant>,
    next_attempt_time: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    monitoring_since: Instant,
    last_activity: Instant,
    epoch: u64,
}

impl BreakerState {
    fn new(epoch: u64) -> Self {
        let now = Instant::now();
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            request_count: 0,
            success_count: 0,
            last_failure_time: None,
            next_attempt: None,
            next_attempt_time: None,
            trial_in_flight: false,
            monitoring_since: now,
            last_activity: now,
            epoch,
        }
    }

    fn transition_to(&mut self, state: CircuitState) {
        self.state = state;
        self.epoch = self.epoch.wrapping_add(1);
    }

    fn open(&mut self, recovery_timeout: Duration) {
        self.transition_to(CircuitState::Open);
        self.next_attempt = Some(Instant::now() + recovery_timeout);
        let recovery = chrono::Duration::from_std(recovery_timeout)
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.next_attempt_time = Some(Utc::now() + recovery);
    }

    fn close(&mut self) {
        self.transition_to(CircuitState::Closed);
        self.failure_count = 0;
        self.next_attempt = None;
        self.next_attempt_time = None;
    }
}

/// Circuit breaker guarding calls to an unreliable operation
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
    listeners: Vec<Arc<dyn BreakerListener>>,
}

impl CircuitBreaker {
    /// Create a new breaker in the CLOSED state
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new(0)),
            listeners: Vec::new(),
        }
    }

    /// Create with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BreakerConfig::default())
    }

    /// Attach a notification listener
    pub fn with_listener(mut self, listener: Arc<dyn BreakerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Attach several listeners
    pub fn with_listeners(
        mut self,
        listeners: impl IntoIterator<Item = Arc<dyn BreakerListener>>,
    ) -> Self {
        self.listeners.extend(listeners);
        self
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state (OPEN is not lazily promoted to HALF_OPEN here)
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failure count
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// CLOSED with no failures pending
    pub fn is_settled(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == CircuitState::Closed && inner.failure_count == 0
    }

    /// Time since the last call was admitted or rejected
    pub fn idle_for(&self) -> Duration {
        self.inner.lock().last_activity.elapsed()
    }

    /// Run `operation` through the breaker
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        T: Send + 'static,
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(operation, None).await
    }

    /// Run `operation` through the breaker, serving `fallback` when the
    /// breaker is (or becomes) OPEN
    pub async fn execute_with_fallback<T, E, F, Fut>(
        &self,
        operation: F,
        fallback: Fallback<T>,
    ) -> Result<T, BreakerError<E>>
    where
        T: Send + 'static,
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(operation, Some(fallback)).await
    }

    async fn run<T, E, F, Fut>(
        &self,
        operation: F,
        fallback: Option<Fallback<T>>,
    ) -> Result<T, BreakerError<E>>
    where
        T: Send + 'static,
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (ticket, transition) = self.admit();
        self.notify_transition(transition);

        if ticket.admission == Admission::Rejected {
            debug!(breaker = %self.name, "Circuit open, short-circuiting call");
            return match fallback {
                Some(fallback) => Ok(fallback.resolve().await),
                None => Err(BreakerError::Open {
                    name: self.name.clone(),
                }),
            };
        }

        let mut trial = TrialGuard {
            breaker: self,
            epoch: ticket.epoch,
            armed: ticket.admission == Admission::Trial,
        };
        let outcome = operation().await;
        trial.armed = false;

        match outcome {
            Ok(value) => {
                let transition = self.record_success(ticket);
                self.notify(|l| l.on_success(&self.name));
                self.notify_transition(transition);
                Ok(value)
            }
            Err(err) => {
                let (state, transition) = self.record_failure(ticket);
                let message = err.to_string();
                self.notify(|l| l.on_failure(&self.name, &message));
                self.notify_transition(transition);

                match fallback {
                    Some(fallback) if state == CircuitState::Open => {
                        debug!(breaker = %self.name, error = %message, "Serving fallback after failure");
                        Ok(fallback.resolve().await)
                    }
                    _ => Err(BreakerError::Failed(err)),
                }
            }
        }
    }

    fn admit(&self) -> (Ticket, Transition) {
        let mut inner = self.inner.lock();
        inner.request_count += 1;
        inner.last_activity = Instant::now();

        let (admission, transition) = match inner.state {
            CircuitState::Closed => (Admission::Primary, None),
            CircuitState::Open => match inner.next_attempt {
                Some(at) if Instant::now() >= at => {
                    inner.transition_to(CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    (
                        Admission::Trial,
                        Some((CircuitState::Open, CircuitState::HalfOpen)),
                    )
                }
                _ => (Admission::Rejected, None),
            },
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    (Admission::Rejected, None)
                } else {
                    inner.trial_in_flight = true;
                    (Admission::Trial, None)
                }
            }
        };

        let ticket = Ticket {
            admission,
            epoch: inner.epoch,
        };
        (ticket, transition)
    }

    fn record_success(&self, ticket: Ticket) -> Transition {
        let mut inner = self.inner.lock();
        inner.success_count += 1;
        if inner.epoch != ticket.epoch {
            return None;
        }

        match (ticket.admission, inner.state) {
            (Admission::Trial, CircuitState::HalfOpen) => {
                inner.trial_in_flight = false;
                inner.close();
                Some((CircuitState::HalfOpen, CircuitState::Closed))
            }
            (Admission::Primary, CircuitState::Closed) => {
                inner.failure_count = 0;
                None
            }
            _ => None,
        }
    }

    fn record_failure(&self, ticket: Ticket) -> (CircuitState, Transition) {
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(Utc::now());
        if inner.epoch != ticket.epoch {
            return (inner.state, None);
        }

        let transition = match (ticket.admission, inner.state) {
            (Admission::Trial, CircuitState::HalfOpen) => {
                inner.trial_in_flight = false;
                inner.failure_count = inner.failure_count.saturating_add(1);
                inner.open(self.config.recovery_timeout);
                Some((CircuitState::HalfOpen, CircuitState::Open))
            }
            (Admission::Primary, CircuitState::Closed) => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                if inner.failure_count >= self.config.failure_threshold {
                    inner.open(self.config.recovery_timeout);
                    Some((CircuitState::Closed, CircuitState::Open))
                } else {
                    None
                }
            }
            _ => None,
        };

        (inner.state, transition)
    }

    /// Consistent snapshot of counters and state
    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock();
        let failure_rate = if inner.request_count == 0 {
            0.0
        } else {
            (inner.request_count - inner.success_count) as f64 / inner.request_count as f64
        };

        BreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            request_count: inner.request_count,
            failure_rate,
            uptime_ms: inner.monitoring_since.elapsed().as_millis() as u64,
            last_failure_time: inner.last_failure_time,
            next_attempt_time: inner.next_attempt_time,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_ms: self.config.recovery_timeout.as_millis() as u64,
        }
    }

    /// Return to the initial CLOSED state and restart monitoring
    pub fn reset(&self) {
        let from = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            let epoch = inner.epoch.wrapping_add(1);
            *inner = BreakerState::new(epoch);
            from
        };
        if from != CircuitState::Closed {
            self.notify_transition(Some((from, CircuitState::Closed)));
        }
    }

    /// Open the breaker regardless of failures; the recovery timeout still applies
    pub fn force_open(&self) {
        let from = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            inner.trial_in_flight = false;
            inner.open(self.config.recovery_timeout);
            from
        };
        if from != CircuitState::Open {
            self.notify_transition(Some((from, CircuitState::Open)));
        }
    }

    /// Close the breaker and clear the failure count
    pub fn force_close(&self) {
        let from = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            inner.trial_in_flight = false;
            inner.close();
            from
        };
        if from != CircuitState::Closed {
            self.notify_transition(Some((from, CircuitState::Closed)));
        }
    }

    fn notify_transition(&self, transition: Transition) {
        if let Some((from, to)) = transition {
            self.notify(|l| l.on_state_change(&self.name, from, to));
        }
    }

    fn notify<F>(&self, f: F)
    where
        F: Fn(&dyn BreakerListener),
    {
        for listener in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                warn!(breaker = %self.name, "Breaker listener panicked, ignoring");
            }
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Releases the HALF_OPEN trial slot if the trial future is dropped mid-call
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.inner.lock();
            if inner.epoch == self.epoch {
                inner.trial_in_flight = false;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig::new(threshold, Duration::from_millis(recovery_ms)),
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<u32, BreakerError<String>> {
        cb.execute(|| async { Err::<u32, String>("downstream error".to_string()) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker, value: u32) -> Result<u32, BreakerError<String>> {
        cb.execute(|| async move { Ok::<u32, String>(value) }).await
    }

    #[derive(Default)]
    struct Recorder {
        transitions: Mutex<Vec<(CircuitState, CircuitState)>>,
        failures: AtomicUsize,
        successes: AtomicUsize,
    }

    impl BreakerListener for Recorder {
        fn on_state_change(&self, _breaker: &str, from: CircuitState, to: CircuitState) {
            self.transitions.lock().push((from, to));
        }

        fn on_failure(&self, _breaker: &str, _error: &str) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }

        fn on_success(&self, _breaker: &str) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicker;

    impl BreakerListener for Panicker {
        fn on_failure(&self, _breaker: &str, _error: &str) {
            panic!("listener exploded");
        }
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let cb = breaker(3, 1000);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(succeed(&cb, 7).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_failure_propagates_verbatim() {
        let cb = breaker(3, 1000);
        let err = fail(&cb).await.unwrap_err();
        assert_eq!(err.into_inner().as_deref(), Some("downstream error"));
        assert_eq!(cb.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 1000);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.failure_count(), 2);

        succeed(&cb, 1).await.unwrap();
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_open_exactly_once() {
        let recorder = Arc::new(Recorder::default());
        let cb = breaker(3, 1000).with_listener(recorder.clone());

        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Further calls short-circuit without re-opening
        for _ in 0..5 {
            let err = succeed(&cb, 1).await.unwrap_err();
            assert!(err.is_open());
        }

        let transitions = recorder.transitions.lock().clone();
        assert_eq!(
            transitions,
            vec![(CircuitState::Closed, CircuitState::Open)]
        );
        assert_eq!(recorder.failures.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_does_not_run_operation() {
        let cb = breaker(1, 1000);
        let _ = fail(&cb).await;

        let calls = AtomicUsize::new(0);
        let result = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(1)
            })
            .await;

        assert!(result.unwrap_err().is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_example_scenario() {
        let recorder = Arc::new(Recorder::default());
        let cb = breaker(3, 1000).with_listener(recorder.clone());

        // Calls 1-3 fail
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        // Call 4 short-circuits
        assert!(succeed(&cb, 4).await.unwrap_err().is_open());

        tokio::time::advance(Duration::from_millis(1000)).await;

        // Call 5 is the trial and closes the breaker
        assert_eq!(succeed(&cb, 5).await.unwrap(), 5);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);

        // Call 6 proceeds normally
        assert_eq!(succeed(&cb, 6).await.unwrap(), 6);

        let transitions = recorder.transitions.lock().clone();
        assert_eq!(
            transitions,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_allowed_regardless_of_blocked_calls() {
        let cb = breaker(2, 500);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        for _ in 0..100 {
            assert!(succeed(&cb, 0).await.unwrap_err().is_open());
        }

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(succeed(&cb, 9).await.unwrap(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_new_deadline() {
        let cb = breaker(1, 1000);
        let _ = fail(&cb).await;
        let first_deadline = cb.metrics().next_attempt_time.unwrap();

        tokio::time::advance(Duration::from_millis(1000)).await;
        let err = fail(&cb).await.unwrap_err();
        assert!(!err.is_open());
        assert_eq!(cb.state(), CircuitState::Open);

        let second_deadline = cb.metrics().next_attempt_time.unwrap();
        assert!(second_deadline >= first_deadline);

        // Still blocked until the fresh recovery window passes
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(succeed(&cb, 1).await.unwrap_err().is_open());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(succeed(&cb, 1).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let cb = Arc::new(breaker(1, 100));
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(100)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_cb = cb.clone();
        let trial = tokio::spawn(async move {
            trial_cb
                .execute(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, String>(1)
                })
                .await
        });

        tokio::task::yield_now().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(succeed(&cb, 2).await.unwrap_err().is_open());

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_served_when_open() {
        let cb = breaker(2, 1000);
        let _ = fail(&cb).await;

        let result = cb
            .execute_with_fallback(
                || async { Err::<u32, String>("nope".into()) },
                Fallback::value(0),
            )
            .await;
        // Second failure trips the breaker, so the fallback is served
        assert_eq!(result.unwrap(), 0);
        assert_eq!(cb.state(), CircuitState::Open);

        let result = cb
            .execute_with_fallback(
                || async { Ok::<u32, String>(5) },
                Fallback::call(|| async { 42 }),
            )
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_fallback_not_used_while_closed() {
        let cb = breaker(5, 1000);
        let result = cb
            .execute_with_fallback(
                || async { Err::<u32, String>("first failure".into()) },
                Fallback::value(0),
            )
            .await;
        assert_eq!(result.unwrap_err().into_inner().unwrap(), "first failure");
    }

    #[tokio::test]
    async fn test_metrics_failure_rate() {
        let cb = breaker(10, 1000);
        let metrics = cb.metrics();
        assert_eq!(metrics.request_count, 0);
        assert_eq!(metrics.failure_rate, 0.0);

        succeed(&cb, 1).await.unwrap();
        let _ = fail(&cb).await;
        succeed(&cb, 1).await.unwrap();
        let _ = fail(&cb).await;

        let metrics = cb.metrics();
        assert_eq!(metrics.request_count, 4);
        assert_eq!(metrics.success_count, 2);
        assert_eq!(metrics.failure_rate, 0.5);
        assert!(metrics.last_failure_time.is_some());
        assert!(metrics.next_attempt_time.is_none());
    }

    #[tokio::test]
    async fn test_manual_overrides() {
        let recorder = Arc::new(Recorder::default());
        let cb = breaker(3, 60_000).with_listener(recorder.clone());

        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(succeed(&cb, 1).await.unwrap_err().is_open());

        cb.force_close();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb, 1).await.unwrap(), 1);

        let _ = fail(&cb).await;
        cb.reset();
        let metrics = cb.metrics();
        assert_eq!(metrics.request_count, 0);
        assert_eq!(metrics.failure_count, 0);
        assert_eq!(metrics.state, CircuitState::Closed);

        let transitions = recorder.transitions.lock().clone();
        assert_eq!(
            transitions,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_panicking_listener_is_swallowed() {
        let recorder = Arc::new(Recorder::default());
        let cb = breaker(1, 1000)
            .with_listener(Arc::new(Panicker))
            .with_listener(recorder.clone());

        let err = fail(&cb).await.unwrap_err();
        assert!(!err.is_open());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(recorder.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_breaker_error_into_crate_error() {
        let cb = breaker(1, 60_000);
        let _ = cb
            .execute(|| async { Err::<(), _>(crate::error::Error::Internal("x".into())) })
            .await;
        let err: crate::error::Error = cb
            .execute(|| async { Ok::<(), crate::error::Error>(()) })
            .await
            .unwrap_err()
            .into();
        assert!(err.is_circuit_open());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_open_once() {
        let recorder = Arc::new(Recorder::default());
        let cb = Arc::new(breaker(5, 60_000).with_listener(recorder.clone()));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cb = cb.clone();
            handles.push(tokio::spawn(async move {
                let _ = cb
                    .execute(|| async { Err::<(), String>("fail".into()) })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cb.state(), CircuitState::Open);
        let opened = recorder
            .transitions
            .lock()
            .iter()
            .filter(|(_, to)| *to == CircuitState::Open)
            .count();
        assert_eq!(opened, 1);
    }

    /// Holds a call admitted now, finishing it with `outcome` once released
    fn held_call(
        cb: &CircuitBreaker,
        outcome: Result<u32, String>,
    ) -> (
        tokio::sync::oneshot::Sender<()>,
        futures::future::LocalBoxFuture<'_, Result<u32, BreakerError<String>>>,
    ) {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let call = cb
            .execute(move || async move {
                let _ = rx.await;
                outcome
            })
            .boxed_local();
        (tx, call)
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_from_closed_does_not_decide_trial() {
        let recorder = Arc::new(Recorder::default());
        let cb = breaker(1, 100).with_listener(recorder.clone());

        // A is admitted while CLOSED and stays in flight
        let (release_a, mut a) = held_call(&cb, Err("late".to_string()));
        assert!(futures::poll!(&mut a).is_pending());

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(100)).await;
        let (release_trial, mut trial) = held_call(&cb, Ok(7));
        assert!(futures::poll!(&mut trial).is_pending());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        release_a.send(()).unwrap();
        assert_eq!(a.await.unwrap_err().into_inner().as_deref(), Some("late"));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(succeed(&cb, 0).await.unwrap_err().is_open());

        release_trial.send(()).unwrap();
        assert_eq!(trial.await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(
            recorder.transitions.lock().clone(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_from_closed_does_not_close_during_trial() {
        let cb = breaker(1, 100);

        let (release_a, mut a) = held_call(&cb, Ok(1));
        assert!(futures::poll!(&mut a).is_pending());

        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(100)).await;
        let (release_trial, mut trial) = held_call(&cb, Err("still down".to_string()));
        assert!(futures::poll!(&mut trial).is_pending());

        release_a.send(()).unwrap();
        assert_eq!(a.await.unwrap(), 1);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        release_trial.send(()).unwrap();
        assert!(!trial.await.unwrap_err().is_open());
        assert_eq!(cb.state(), CircuitState::Open);

        let metrics = cb.metrics();
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.request_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_after_force_close_is_counted_only() {
        let cb = breaker(1, 100);
        let (release, mut call) = held_call(&cb, Err("late".to_string()));
        assert!(futures::poll!(&mut call).is_pending());

        cb.force_open();
        cb.force_close();
        release.send(()).unwrap();
        let _ = call.await;

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.metrics().last_failure_time.is_some());
    }
}
