//! Circuit Breaker Implementation
//!
//! One breaker guards one route. It keeps a fixed-size window of the most
//! recent call outcomes and trips when the failure rate in that window crosses
//! a threshold.
//!
//! ## States:
//! - **Closed**: Normal operation, calls pass through and their outcomes are recorded
//! - **Open**: Calls are rejected immediately until `open_duration` has elapsed
//! - **HalfOpen**: Up to `half_open_permits` trial calls probe the target; one failure
//!   reopens the breaker, a full set of successes closes it
//!
//! ## Key Rust Concepts:
//! - All mutable state lives behind a single `parking_lot::Mutex`, so admitting a
//!   call, appending an outcome and evaluating the threshold are one critical section
//! - `CallPermit` is an RAII guard: a permit dropped without an outcome (for example a
//!   cancelled request) gives its half-open slot back
//! - `AtomicU64` counters feed the inspection endpoint without taking the lock

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::observability::metrics;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError {
    #[error("Circuit breaker is open")]
    CircuitOpen,
    #[error("Circuit breaker is half-open and all trial permits are taken")]
    TrialPermitsExhausted,
}

/// Phase of the breaker state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of one admitted call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// The call exceeded `call_timeout`; counted as a failure
    Timeout,
}

impl CallOutcome {
    fn is_failure(self) -> bool {
        !matches!(self, CallOutcome::Success)
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of most recent outcomes retained
    pub window_size: usize,

    /// Outcomes required in the window before the failure rate is evaluated
    pub minimum_calls: usize,

    /// Failure percentage (0-100] at or above which the breaker opens
    pub failure_rate_threshold: f64,

    /// How long the breaker stays open before probing
    #[serde(with = "humantime_serde")]
    pub open_duration: Duration,

    /// Trial calls admitted while half-open
    pub half_open_permits: u32,

    /// A call running longer than this counts as a failure
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            minimum_calls: 5,
            failure_rate_threshold: 50.0,
            open_duration: Duration::from_secs(10),
            half_open_permits: 3,
            call_timeout: Duration::from_secs(5),
        }
    }
}

impl CircuitBreakerConfig {
    /// Describe every invalid parameter, empty when the config is usable
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.window_size == 0 {
            problems.push("window_size must be at least 1".to_string());
        }
        if self.minimum_calls == 0 {
            problems.push("minimum_calls must be at least 1".to_string());
        }
        // A window smaller than minimum_calls never reaches an evaluation
        if self.window_size > 0 && self.minimum_calls > self.window_size {
            problems.push(format!(
                "minimum_calls ({}) must not exceed window_size ({})",
                self.minimum_calls, self.window_size
            ));
        }
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 100.0) {
            problems.push("failure_rate_threshold must be in (0, 100]".to_string());
        }
        if self.open_duration.is_zero() {
            problems.push("open_duration must be greater than 0".to_string());
        }
        if self.half_open_permits == 0 {
            problems.push("half_open_permits must be at least 1".to_string());
        }
        if self.call_timeout.is_zero() {
            problems.push("call_timeout must be greater than 0".to_string());
        }
        problems
    }
}

/// Fixed-capacity ring of outcome bits with a running failure count
#[derive(Debug)]
struct OutcomeWindow {
    outcomes: VecDeque<bool>,
    capacity: usize,
    failures: usize,
}

impl OutcomeWindow {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity,
            failures: 0,
        }
    }

    fn push(&mut self, failed: bool) {
        if self.outcomes.len() == self.capacity {
            if let Some(true) = self.outcomes.pop_front() {
                self.failures -= 1;
            }
        }
        self.outcomes.push_back(failed);
        if failed {
            self.failures += 1;
        }
    }

    fn len(&self) -> usize {
        self.outcomes.len()
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        (self.failures as f64 / self.outcomes.len() as f64) * 100.0
    }

    fn clear(&mut self) {
        self.outcomes.clear();
        self.failures = 0;
    }
}

#[derive(Debug)]
struct BreakerState {
    phase: CircuitPhase,
    window: OutcomeWindow,
    opened_at: Option<Instant>,
    /// Trial calls admitted in the current half-open phase
    trials_admitted: u32,
    /// Trial calls that completed successfully in the current half-open phase
    trial_successes: u32,
    /// Bumped on every phase change so late outcomes from an earlier phase are ignored
    generation: u64,
}

/// Counters exposed through the inspection endpoint
#[derive(Debug, Default)]
pub struct CircuitBreakerMetrics {
    pub successful_calls: AtomicU64,
    pub failed_calls: AtomicU64,
    pub rejected_calls: AtomicU64,
    pub times_opened: AtomicU64,
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub route_id: String,
    pub phase: CircuitPhase,
    pub buffered_calls: usize,
    pub failed_buffered_calls: usize,
    pub failure_rate: f64,
    pub open_for_ms: Option<u64>,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub times_opened: u64,
}

pub struct CircuitBreaker {
    route_id: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    metrics: CircuitBreakerMetrics,
}

impl CircuitBreaker {
    pub fn new(route_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            route_id: route_id.into(),
            state: Mutex::new(BreakerState {
                phase: CircuitPhase::Closed,
                window: OutcomeWindow::new(config.window_size),
                opened_at: None,
                trials_admitted: 0,
                trial_successes: 0,
                generation: 0,
            }),
            config,
            metrics: CircuitBreakerMetrics::default(),
        }
    }

    pub fn with_defaults(route_id: impl Into<String>) -> Self {
        Self::new(route_id, CircuitBreakerConfig::default())
    }

    /// Ask to run one call through the breaker.
    ///
    /// An open breaker whose `open_duration` has elapsed moves to half-open
    /// here and admits this call as its first trial.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, CircuitBreakerError> {
        let mut state = self.state.lock();
        let now = Instant::now();

        if state.phase == CircuitPhase::Open {
            let elapsed = state
                .opened_at
                .map(|opened_at| now.duration_since(opened_at))
                .unwrap_or_default();
            if elapsed >= self.config.open_duration {
                self.transition(&mut state, CircuitPhase::HalfOpen, now);
            } else {
                self.metrics.rejected_calls.fetch_add(1, Ordering::Relaxed);
                metrics::record_breaker_rejection(&self.route_id);
                return Err(CircuitBreakerError::CircuitOpen);
            }
        }

        let trial = state.phase == CircuitPhase::HalfOpen;
        if trial {
            if state.trials_admitted >= self.config.half_open_permits {
                self.metrics.rejected_calls.fetch_add(1, Ordering::Relaxed);
                metrics::record_breaker_rejection(&self.route_id);
                return Err(CircuitBreakerError::TrialPermitsExhausted);
            }
            state.trials_admitted += 1;
        }

        Ok(CallPermit {
            breaker: Arc::clone(self),
            generation: state.generation,
            trial,
            started_at: now,
            completed: false,
        })
    }

    fn record(&self, generation: u64, outcome: CallOutcome) {
        let failed = outcome.is_failure();
        if failed {
            self.metrics.failed_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.successful_calls.fetch_add(1, Ordering::Relaxed);
        }

        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(route = %self.route_id, ?outcome, "Ignoring outcome from a previous breaker phase");
            return;
        }
        let now = Instant::now();

        match state.phase {
            CircuitPhase::Closed => {
                state.window.push(failed);
                let rate = state.window.failure_rate();
                if state.window.len() >= self.config.minimum_calls
                    && rate >= self.config.failure_rate_threshold
                {
                    warn!(
                        route = %self.route_id,
                        failure_rate = rate,
                        threshold = self.config.failure_rate_threshold,
                        "Failure rate over threshold, opening circuit"
                    );
                    self.transition(&mut state, CircuitPhase::Open, now);
                }
            }
            CircuitPhase::HalfOpen => {
                if failed {
                    warn!(route = %self.route_id, "Trial call failed, reopening circuit");
                    self.transition(&mut state, CircuitPhase::Open, now);
                } else {
                    state.trial_successes += 1;
                    if state.trial_successes >= self.config.half_open_permits {
                        self.transition(&mut state, CircuitPhase::Closed, now);
                    }
                }
            }
            // A permit from the current generation cannot complete while open
            CircuitPhase::Open => {}
        }
    }

    fn release(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation
            && state.phase == CircuitPhase::HalfOpen
            && state.trials_admitted > 0
        {
            state.trials_admitted -= 1;
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitPhase, now: Instant) {
        let from = state.phase;
        state.phase = to;
        state.generation += 1;
        state.trials_admitted = 0;
        state.trial_successes = 0;

        match to {
            CircuitPhase::Open => {
                state.opened_at = Some(now);
                self.metrics.times_opened.fetch_add(1, Ordering::Relaxed);
            }
            CircuitPhase::HalfOpen => {}
            CircuitPhase::Closed => {
                state.opened_at = None;
                state.window.clear();
            }
        }

        info!(route = %self.route_id, ?from, ?to, "Circuit breaker state change");
        metrics::record_breaker_transition(&self.route_id, to);
    }

    pub fn phase(&self) -> CircuitPhase {
        self.state.lock().phase
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CircuitBreakerMetrics {
        &self.metrics
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state.lock();
        CircuitBreakerSnapshot {
            route_id: self.route_id.clone(),
            phase: state.phase,
            buffered_calls: state.window.len(),
            failed_buffered_calls: state.window.failures,
            failure_rate: state.window.failure_rate(),
            open_for_ms: state
                .opened_at
                .map(|opened_at| opened_at.elapsed().as_millis() as u64),
            successful_calls: self.metrics.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.metrics.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.metrics.rejected_calls.load(Ordering::Relaxed),
            times_opened: self.metrics.times_opened.load(Ordering::Relaxed),
        }
    }
}

/// Admission ticket for one call. Report the result with [`CallPermit::complete`].
#[must_use = "a permit must be completed with the call outcome"]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    trial: bool,
    started_at: Instant,
    completed: bool,
}

impl CallPermit {
    /// Whether this call is a half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn call_timeout(&self) -> Duration {
        self.breaker.config.call_timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn complete(mut self, outcome: CallOutcome) {
        self.completed = true;
        self.breaker.record(self.generation, outcome);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.completed && self.trial {
            self.breaker.release(self.generation);
        }
    }
}

/// Per-route breakers, created lazily on first use and kept for the life of
/// the process.
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        defaults: CircuitBreakerConfig,
        overrides: HashMap<String, CircuitBreakerConfig>,
    ) -> Self {
        Self {
            defaults,
            overrides,
            breakers: DashMap::new(),
        }
    }

    /// Get or create the breaker for `route_id`
    pub fn breaker(&self, route_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(route_id) {
            return Arc::clone(breaker.value());
        }
        let entry = self.breakers.entry(route_id.to_string()).or_insert_with(|| {
            let config = self
                .overrides
                .get(route_id)
                .cloned()
                .unwrap_or_else(|| self.defaults.clone());
            Arc::new(CircuitBreaker::new(route_id, config))
        });
        Arc::clone(entry.value())
    }

    /// Snapshots of every breaker created so far, ordered by route id
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.route_id.cmp(&b.route_id));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), HashMap::new())
    }
}
