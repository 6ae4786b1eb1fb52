// Three-state circuit breaker for outbound calls

//! # Circuit Breaker
//!
//! One [`CircuitBreaker`] guards one named peer. It moves between three states:
//!
//! ```text
//!            trip predicate holds
//!   Closed ─────────────────────────▶ Open
//!     ▲                                 │ open_timeout elapsed
//!     │ max_half_open_requests          ▼
//!     └────── consecutive successes ── HalfOpen ── any failure ──▶ Open
//! ```
//!
//! ## Generations
//!
//! Every transition, and every rollover of the Closed interval, starts a new
//! *generation* with zeroed [`Counts`]. A call remembers the generation it was
//! admitted in; if the breaker has moved on by the time the call finishes, its
//! outcome is discarded. That keeps a slow call from an old window from
//! tripping or closing the breaker after the fact.
//!
//! ## Locking
//!
//! The state lives behind one `std::sync::Mutex`. The lock is only held for
//! counter updates and transitions, never across an `.await`. The state-change
//! observer is invoked after the lock is released.
//!
//! ## Rust Learning Notes:
//!
//! ### Why `std::sync::Mutex` in async code?
//! A tokio mutex is needed only when the guard must live across an `.await`.
//! Here the critical section is a handful of integer updates, so the std
//! mutex is cheaper and cannot be held over a suspension point by accident.
//!
//! ### Drop guards
//! If the future returned by [`CircuitBreaker::call`] is dropped halfway (for
//! example by `tokio::time::timeout`), the in-flight call must still be
//! accounted for. `CallGuard` reports a failure from its `Drop` impl unless
//! the call completed normally.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::KainosError;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum State {
    Closed,
    HalfOpen,
    Open,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Closed => "closed",
            State::HalfOpen => "half-open",
            State::Open => "open",
        };
        f.write_str(s)
    }
}

/// Request and outcome counters for the current generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

/// Decides whether a failure while Closed should open the breaker
pub type TripPolicy = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;

/// Called with `(name, from, to)` on every transition
pub type StateObserver = Arc<dyn Fn(&str, State, State) + Send + Sync>;

/// Breaker configuration
#[derive(Clone)]
pub struct BreakerSettings {
    pub name: String,
    /// Probes admitted per HalfOpen generation, and successes needed to close
    pub max_half_open_requests: u32,
    /// Closed-state counter window; zero never rolls
    pub interval: Duration,
    /// Time spent Open before the next call is admitted as a probe
    pub open_timeout: Duration,
    /// Consecutive failures that trip the default policy
    pub failure_threshold: u32,
    /// Replaces the default `consecutive_failures >= failure_threshold`
    pub trip: Option<TripPolicy>,
    pub on_state_change: Option<StateObserver>,
}

impl fmt::Debug for BreakerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerSettings")
            .field("name", &self.name)
            .field("max_half_open_requests", &self.max_half_open_requests)
            .field("interval", &self.interval)
            .field("open_timeout", &self.open_timeout)
            .field("failure_threshold", &self.failure_threshold)
            .field("custom_trip", &self.trip.is_some())
            .field("observer", &self.on_state_change.is_some())
            .finish()
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_half_open_requests: 5,
            interval: Duration::from_secs(60),
            open_timeout: Duration::from_secs(60),
            failure_threshold: 6,
            trip: None,
            on_state_change: None,
        }
    }
}

impl BreakerSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Settings used for the agent API peer
    pub fn agent_api() -> Self {
        Self {
            name: "agent-api".to_string(),
            max_half_open_requests: 3,
            interval: Duration::from_secs(30),
            open_timeout: Duration::from_secs(65),
            failure_threshold: 3,
            trip: None,
            on_state_change: None,
        }
    }

    pub fn with_max_half_open_requests(mut self, max: u32) -> Self {
        self.max_half_open_requests = max;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_trip_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(&Counts) -> bool + Send + Sync + 'static,
    {
        self.trip = Some(Arc::new(policy));
        self
    }

    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&str, State, State) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(observer));
        self
    }
}

/// Outcome of a guarded call
///
/// The guard variants mean the operation was never invoked.
#[derive(Debug)]
pub enum BreakerError<E> {
    Open { name: String },
    TooManyRequests { name: String },
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_rejection(&self) -> bool {
        !matches!(self, BreakerError::Inner(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open { name } => write!(f, "circuit breaker '{}' is open", name),
            BreakerError::TooManyRequests { name } => {
                write!(f, "circuit breaker '{}' has no half-open capacity left", name)
            }
            BreakerError::Inner(e) => e.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BreakerError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BreakerError<KainosError>> for KainosError {
    fn from(err: BreakerError<KainosError>) -> Self {
        match err {
            BreakerError::Open { name } => KainosError::CircuitOpen { name },
            BreakerError::TooManyRequests { name } => KainosError::TooManyRequests { name },
            BreakerError::Inner(e) => e,
        }
    }
}

type Transition = (State, State);

struct Inner {
    state: State,
    generation: u64,
    counts: Counts,
    /// End of the Closed window or of the Open timeout
    expiry: Option<Instant>,
}

/// Named three-state circuit breaker
pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.settings.name)
            .field("state", &self.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    /// A `max_half_open_requests` of 0 is treated as 1
    pub fn new(mut settings: BreakerSettings) -> Self {
        settings.max_half_open_requests = settings.max_half_open_requests.max(1);
        let mut inner = Inner {
            state: State::Closed,
            generation: 0,
            counts: Counts::default(),
            expiry: None,
        };
        Self::new_generation(&settings, &mut inner, Instant::now());
        Self {
            settings,
            inner: Mutex::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Current state, applying any time-based transition that is due
    pub fn state(&self) -> State {
        let (state, transition) = {
            let mut inner = self.lock();
            let transition = self.refresh(&mut inner, Instant::now());
            (inner.state, transition)
        };
        self.notify(transition.into_iter());
        state
    }

    pub fn counts(&self) -> Counts {
        self.lock().counts
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Run `operation` if the breaker admits it
    ///
    /// `is_failure` classifies the finished result; an `Ok` value can still
    /// count as a failure (for instance an HTTP 5xx response).
    pub async fn call<T, E, F, Fut, C>(
        &self,
        operation: F,
        is_failure: C,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&Result<T, E>) -> bool,
    {
        let generation = self.before_request()?;
        let mut guard = CallGuard {
            breaker: self,
            generation,
            armed: true,
        };

        let result = operation().await;
        let failed = is_failure(&result);
        guard.armed = false;
        self.after_request(generation, !failed);

        result.map_err(BreakerError::Inner)
    }

    /// `call` where only `Err` counts as a failure
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call(operation, |r| r.is_err()).await
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn before_request<E>(&self) -> Result<u64, BreakerError<E>> {
        let (result, transition) = {
            let mut inner = self.lock();
            let transition = self.refresh(&mut inner, Instant::now());
            let result = match inner.state {
                State::Open => Err(BreakerError::Open {
                    name: self.settings.name.clone(),
                }),
                State::HalfOpen
                    if inner.counts.requests >= self.settings.max_half_open_requests =>
                {
                    Err(BreakerError::TooManyRequests {
                        name: self.settings.name.clone(),
                    })
                }
                _ => {
                    inner.counts.on_request();
                    Ok(inner.generation)
                }
            };
            (result, transition)
        };
        self.notify(transition.into_iter());

        if result.is_err() {
            debug!("🚫 Circuit breaker '{}' rejected a call", self.settings.name);
        }
        result
    }

    fn after_request(&self, generation: u64, success: bool) {
        let mut transitions: Vec<Transition> = Vec::with_capacity(2);
        {
            let mut inner = self.lock();
            let now = Instant::now();
            transitions.extend(self.refresh(&mut inner, now));
            if inner.generation != generation {
                debug!(
                    "Circuit breaker '{}' ignored outcome from stale generation {}",
                    self.settings.name, generation
                );
            } else if success {
                transitions.extend(self.on_success(&mut inner, now));
            } else {
                transitions.extend(self.on_failure(&mut inner, now));
            }
        }
        self.notify(transitions.into_iter());
    }

    fn on_success(&self, inner: &mut Inner, now: Instant) -> Option<Transition> {
        match inner.state {
            State::Closed => {
                inner.counts.on_success();
                None
            }
            State::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.settings.max_half_open_requests {
                    self.set_state(inner, State::Closed, now)
                } else {
                    None
                }
            }
            State::Open => None,
        }
    }

    fn on_failure(&self, inner: &mut Inner, now: Instant) -> Option<Transition> {
        match inner.state {
            State::Closed => {
                inner.counts.on_failure();
                if self.should_trip(&inner.counts) {
                    self.set_state(inner, State::Open, now)
                } else {
                    None
                }
            }
            State::HalfOpen => self.set_state(inner, State::Open, now),
            State::Open => None,
        }
    }

    fn should_trip(&self, counts: &Counts) -> bool {
        match &self.settings.trip {
            Some(policy) => policy(counts),
            None => counts.consecutive_failures >= self.settings.failure_threshold,
        }
    }

    /// Apply interval rollover and the Open timeout
    fn refresh(&self, inner: &mut Inner, now: Instant) -> Option<Transition> {
        match (inner.state, inner.expiry) {
            (State::Closed, Some(expiry)) if expiry <= now => {
                Self::new_generation(&self.settings, inner, now);
                None
            }
            (State::Open, Some(expiry)) if expiry <= now => {
                self.set_state(inner, State::HalfOpen, now)
            }
            _ => None,
        }
    }

    fn set_state(&self, inner: &mut Inner, to: State, now: Instant) -> Option<Transition> {
        if inner.state == to {
            return None;
        }
        let from = inner.state;
        inner.state = to;
        Self::new_generation(&self.settings, inner, now);
        Some((from, to))
    }

    fn new_generation(settings: &BreakerSettings, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            State::Closed if settings.interval.is_zero() => None,
            State::Closed => Some(now + settings.interval),
            State::Open => Some(now + settings.open_timeout),
            State::HalfOpen => None,
        };
    }

    fn notify(&self, transitions: impl Iterator<Item = Transition>) {
        for (from, to) in transitions {
            match to {
                State::Open => warn!(
                    "🔴 Circuit breaker '{}' {} -> {}",
                    self.settings.name, from, to
                ),
                State::HalfOpen => warn!(
                    "🟡 Circuit breaker '{}' {} -> {}",
                    self.settings.name, from, to
                ),
                State::Closed => info!(
                    "🟢 Circuit breaker '{}' {} -> {}",
                    self.settings.name, from, to
                ),
            }
            if let Some(observer) = &self.settings.on_state_change {
                observer(&self.settings.name, from, to);
            }
        }
    }
}

/// Reports a failure if a call future is dropped before it finishes
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    armed: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.after_request(self.generation, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_settings() -> BreakerSettings {
        BreakerSettings::new("test")
            .with_failure_threshold(3)
            .with_max_half_open_requests(2)
            .with_interval(Duration::from_secs(10))
            .with_open_timeout(Duration::from_secs(5))
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.execute(|| async { Ok::<(), &'static str>(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_threshold_and_rejects_without_calling() {
        let breaker = CircuitBreaker::new(fast_settings());
        for _ in 0..3 {
            assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner("boom"))));
        }
        assert_eq!(breaker.state(), State::Open);

        let invoked = AtomicU32::new(0);
        for _ in 0..5 {
            let result = breaker
                .execute(|| async {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), &'static str>(())
                })
                .await;
            assert!(matches!(result, Err(BreakerError::Open { .. })));
        }
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_with_new_generation() {
        let breaker = CircuitBreaker::new(fast_settings());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.state(), State::HalfOpen);
        let half_open_generation = breaker.generation();

        assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner(_))));
        assert_eq!(breaker.state(), State::Open);
        assert!(breaker.generation() > half_open_generation);
        assert_eq!(breaker.counts(), Counts::default());

        // The Open timer restarted from the failed probe
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_probe_successes_close() {
        let breaker = CircuitBreaker::new(fast_settings());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), State::HalfOpen);
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.counts(), Counts::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_probe_budget_still_admits_one_probe() {
        let breaker = CircuitBreaker::new(fast_settings().with_max_half_open_requests(0));
        assert_eq!(breaker.settings().max_half_open_requests, 1);
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_budget() {
        let breaker = Arc::new(CircuitBreaker::new(fast_settings()));
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(5)).await;

        // Two slow probes occupy the half-open budget
        let mut probes = Vec::new();
        for _ in 0..2 {
            let b = breaker.clone();
            probes.push(tokio::spawn(async move {
                b.execute(|| async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok::<(), &'static str>(())
                })
                .await
            }));
        }
        tokio::task::yield_now().await;

        assert!(matches!(
            succeed(&breaker).await,
            Err(BreakerError::TooManyRequests { .. })
        ));

        for probe in probes {
            assert!(probe.await.unwrap().is_ok());
        }
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_rolls_closed_counters() {
        let breaker = CircuitBreaker::new(fast_settings());
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.counts().consecutive_failures, 2);

        tokio::time::advance(Duration::from_secs(10)).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.counts().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_outcome_is_ignored() {
        let breaker = Arc::new(CircuitBreaker::new(fast_settings()));
        let slow = {
            let b = breaker.clone();
            tokio::spawn(async move {
                b.execute(|| async {
                    tokio::time::sleep(Duration::from_secs(15)).await;
                    Err::<(), &'static str>("late")
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        // Interval rolls while the slow call is in flight
        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = slow.await.unwrap();

        // The late failure belongs to the old window and must not trip
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.counts().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_classifies_ok_as_failure() {
        let breaker = CircuitBreaker::new(fast_settings().with_failure_threshold(1));
        let result = breaker
            .call(|| async { Ok::<u16, &'static str>(503) }, |r| matches!(r, Ok(s) if *s >= 500))
            .await;
        assert!(matches!(result, Ok(503)));
        assert_eq!(breaker.state(), State::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_every_transition() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let breaker = CircuitBreaker::new(fast_settings().with_observer(move |name, from, to| {
            sink.lock().unwrap().push((name.to_string(), from, to));
        }));

        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        let _ = succeed(&breaker).await;
        let _ = succeed(&breaker).await;

        let seen = seen.lock().unwrap();
        let transitions: Vec<(State, State)> = seen.iter().map(|(_, f, t)| (*f, *t)).collect();
        assert_eq!(
            transitions,
            vec![
                (State::Closed, State::Open),
                (State::Open, State::HalfOpen),
                (State::HalfOpen, State::Closed),
            ]
        );
        assert!(seen.iter().all(|(n, _, _)| n == "test"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_counts_as_failure() {
        let breaker = CircuitBreaker::new(fast_settings().with_failure_threshold(1));
        let call = breaker.execute(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), &'static str>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_secs(1), call).await;
        assert!(timed_out.is_err());
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_guard_errors_map_to_kainos_errors() {
        let err: KainosError = BreakerError::<KainosError>::Open { name: "x".into() }.into();
        assert!(err.is_guard());
        let err: KainosError = BreakerError::Inner(KainosError::NotConnected).into();
        assert!(matches!(err, KainosError::NotConnected));
    }
}
