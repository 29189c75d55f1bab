//! Circuit breaker guarding calls to a payment processor.
//!
//! # States
//! - Closed: requests pass through; counts accumulate over a rolling interval
//! - Open: requests fail fast until the timeout elapses
//! - HalfOpen: at most `max_requests` concurrent probes; one failure reopens
//!
//! Every state transition advances a generation counter. A result recorded
//! against a stale generation is discarded, so a late-returning call can
//! never corrupt the counts of a newer window.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pay_common::ProcessorKind;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BreakerError {
    #[error("circuit breaker is open")]
    Open,

    #[error("too many concurrent half-open probes")]
    TooManyProbes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Request counts within the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
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

#[derive(Clone, Copy)]
pub struct BreakerConfig {
    /// Concurrent probes admitted while half-open.
    pub max_requests: u32,
    /// Rolling window for closed-state counts; zero disables the roll.
    pub interval: Duration,
    /// How long the breaker stays open before probing.
    pub timeout: Duration,
    /// Trip predicate evaluated after each closed-state failure.
    pub trip: fn(&Counts) -> bool,
}

struct Shared {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    max_requests: u32,
    interval: Duration,
    timeout: Duration,
    trip: fn(&Counts) -> bool,
    shared: Mutex<Shared>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            max_requests: config.max_requests.max(1),
            interval: config.interval,
            timeout: config.timeout,
            trip: config.trip,
            shared: Mutex::new(Shared {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: None,
            }),
        };
        breaker.shared.lock().expiry = breaker.closed_expiry(Instant::now());
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admit a request, returning the generation it belongs to. The critical
    /// section is O(1) and never spans I/O; the caller performs the call and
    /// reports the outcome via [`record`](Self::record).
    pub fn acquire(&self) -> Result<u64, BreakerError> {
        let mut shared = self.shared.lock();
        let now = Instant::now();
        self.advance(&mut shared, now);

        match shared.state {
            BreakerState::Open => Err(BreakerError::Open),
            BreakerState::HalfOpen if shared.counts.requests >= self.max_requests => {
                Err(BreakerError::TooManyProbes)
            }
            _ => {
                shared.counts.requests += 1;
                Ok(shared.generation)
            }
        }
    }

    /// Report the outcome of a request admitted at `generation`. Results from
    /// a prior generation are ignored.
    pub fn record(&self, generation: u64, success: bool) {
        let mut shared = self.shared.lock();
        let now = Instant::now();
        self.advance(&mut shared, now);
        if shared.generation != generation {
            return;
        }

        if success {
            shared.counts.on_success();
            if shared.state == BreakerState::HalfOpen
                && shared.counts.consecutive_successes >= self.max_requests
            {
                self.set_state(&mut shared, BreakerState::Closed, now);
            }
        } else {
            match shared.state {
                BreakerState::Closed => {
                    shared.counts.on_failure();
                    if (self.trip)(&shared.counts) {
                        self.set_state(&mut shared, BreakerState::Open, now);
                    }
                }
                BreakerState::HalfOpen => {
                    self.set_state(&mut shared, BreakerState::Open, now);
                }
                BreakerState::Open => {}
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut shared = self.shared.lock();
        self.advance(&mut shared, Instant::now());
        shared.state
    }

    pub fn counts(&self) -> Counts {
        let mut shared = self.shared.lock();
        self.advance(&mut shared, Instant::now());
        shared.counts
    }

    /// Force the breaker back to a fresh closed state, discarding in-flight
    /// outcomes via the generation bump.
    pub fn reset(&self) {
        let mut shared = self.shared.lock();
        shared.generation += 1;
        shared.counts = Counts::default();
        shared.state = BreakerState::Closed;
        shared.expiry = self.closed_expiry(Instant::now());
    }

    /// Apply time-driven transitions: roll the closed window, move an expired
    /// open breaker to half-open.
    fn advance(&self, shared: &mut Shared, now: Instant) {
        match shared.state {
            BreakerState::Closed => {
                if let Some(expiry) = shared.expiry {
                    if expiry <= now {
                        self.new_generation(shared, now);
                    }
                }
            }
            BreakerState::Open => {
                if let Some(expiry) = shared.expiry {
                    if expiry <= now {
                        self.set_state(shared, BreakerState::HalfOpen, now);
                    }
                }
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn set_state(&self, shared: &mut Shared, state: BreakerState, now: Instant) {
        if shared.state == state {
            return;
        }
        let from = shared.state;
        shared.state = state;
        shared.generation += 1;
        shared.counts = Counts::default();
        shared.expiry = match state {
            BreakerState::Closed => self.closed_expiry(now),
            BreakerState::Open => Some(now + self.timeout),
            BreakerState::HalfOpen => None,
        };
        tracing::info!(
            breaker = %self.name,
            from = from.as_str(),
            to = state.as_str(),
            "circuit breaker state change"
        );
    }

    fn new_generation(&self, shared: &mut Shared, now: Instant) {
        shared.generation += 1;
        shared.counts = Counts::default();
        shared.expiry = self.closed_expiry(now);
    }

    fn closed_expiry(&self, now: Instant) -> Option<Instant> {
        if self.interval.is_zero() {
            None
        } else {
            Some(now + self.interval)
        }
    }
}

// ============================================================================
// Per-processor breaker pair
// ============================================================================

fn default_trip(counts: &Counts) -> bool {
    counts.consecutive_failures >= 3
        || (counts.requests >= 5
            && counts.total_failures as f64 / counts.requests as f64 >= 0.6)
}

fn fallback_trip(counts: &Counts) -> bool {
    counts.consecutive_failures >= 5
        || (counts.requests >= 5
            && counts.total_failures as f64 / counts.requests as f64 >= 0.8)
}

/// The two breakers guarding the default and fallback processors. The
/// fallback breaker is deliberately more tolerant: it is the last line before
/// a payment goes back on the queue.
pub struct ProcessorBreakers {
    default: CircuitBreaker,
    fallback: CircuitBreaker,
}

impl ProcessorBreakers {
    pub fn new() -> Self {
        Self {
            default: CircuitBreaker::new(
                "default-processor",
                BreakerConfig {
                    max_requests: 3,
                    interval: Duration::from_secs(10),
                    timeout: Duration::from_secs(30),
                    trip: default_trip,
                },
            ),
            fallback: CircuitBreaker::new(
                "fallback-processor",
                BreakerConfig {
                    max_requests: 5,
                    interval: Duration::from_secs(15),
                    timeout: Duration::from_secs(45),
                    trip: fallback_trip,
                },
            ),
        }
    }

    pub fn for_kind(&self, kind: ProcessorKind) -> &CircuitBreaker {
        match kind {
            ProcessorKind::Default => &self.default,
            ProcessorKind::Fallback => &self.fallback,
        }
    }

    pub fn reset_all(&self) {
        self.default.reset();
        self.fallback.reset();
    }
}

impl Default for ProcessorBreakers {
    fn default() -> Self {
        Self::new()
    }
}
