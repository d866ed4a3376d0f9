//! Per-dependency circuit breaker.
//!
//! # State Machine
//!
//! ```text
//! Closed   --[calls >= min_throughput && failure ratio >= threshold in window]--> Open
//! Open     --[break_duration elapsed, next call admitted as trial]--> HalfOpen
//! HalfOpen --[trial succeeds]--> Closed
//! HalfOpen --[trial fails]--> Open
//! ```
//!
//! While a half-open trial is in flight every other call is rejected, so at most
//! one call reaches a recovering dependency. A trial whose permit is dropped
//! unrecorded frees the slot for the next caller.
//!
//! The sampling window slides: each recorded outcome first evicts outcomes
//! older than `sampling_duration`, and the ratio covers what remains.
//!
//! Circuits are keyed (e.g. `"tts:synthesize"`); one failing dependency never
//! blocks calls to another.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerPolicy {
    /// Fraction of failed calls (0.0-1.0) that trips the circuit
    pub failure_ratio: f64,
    /// Calls needed in the window before the ratio is evaluated
    pub minimum_throughput: u32,
    /// Rolling window over which calls are counted
    pub sampling_duration: Duration,
    /// How long the circuit stays open before admitting a trial
    pub break_duration: Duration,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            minimum_throughput: 5,
            sampling_duration: Duration::from_secs(60),
            break_duration: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast without reaching the dependency.
    Open,
    /// One trial call is allowed through.
    HalfOpen,
}

/// Emitted whenever a circuit changes state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitTransition {
    pub key: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub calls: u32,
    pub failures: u32,
    /// Time left before an open circuit admits a trial
    pub retry_after: Option<Duration>,
}

/// Kind of call a circuit admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Regular call on a closed circuit
    Normal,
    /// The single half-open trial
    Trial,
}

/// How an admitted call ended, from the breaker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// Neither (e.g. the caller canceled); not counted
    Ignored,
}

/// Admission ticket returned by [`CircuitBreaker::acquire`].
///
/// Dropping a permit without calling [`CallPermit::record`] settles it as
/// [`CallOutcome::Ignored`], so an abandoned half-open trial frees its slot.
#[derive(Debug)]
#[must_use = "an unrecorded permit counts as an ignored call"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    key: String,
    kind: Permit,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn kind(&self) -> Permit {
        self.kind
    }

    /// Report how the admitted call ended.
    pub fn record(mut self, outcome: CallOutcome) {
        self.settled = true;
        self.breaker.settle(&self.key, self.kind, outcome);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(&self.key, self.kind, CallOutcome::Ignored);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    failed: bool,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    /// Outcomes inside the sampling window, oldest first
    samples: VecDeque<Sample>,
    failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            samples: VecDeque::new(),
            failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn calls(&self) -> u32 {
        u32::try_from(self.samples.len()).unwrap_or(u32::MAX)
    }

    fn clear_samples(&mut self) {
        self.samples.clear();
        self.failures = 0;
    }

    /// Forget outcomes older than `sampling`.
    fn evict(&mut self, now: Instant, sampling: Duration) {
        while let Some(oldest) = self.samples.front() {
            if now.duration_since(oldest.at) < sampling {
                break;
            }
            if oldest.failed {
                self.failures -= 1;
            }
            self.samples.pop_front();
        }
    }

    fn push(&mut self, now: Instant, failed: bool) {
        self.samples.push_back(Sample { at: now, failed });
        if failed {
            self.failures += 1;
        }
    }

    fn retry_after(&self, now: Instant, break_duration: Duration) -> Option<Duration> {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened)) => {
                Some((opened + break_duration).saturating_duration_since(now))
            }
            (CircuitState::HalfOpen, _) => Some(Duration::ZERO),
            _ => None,
        }
    }
}

/// Keyed circuit breaker table.
pub struct CircuitBreaker {
    policy: CircuitBreakerPolicy,
    circuits: Mutex<HashMap<String, Circuit>>,
    transitions: broadcast::Sender<CircuitTransition>,
}

impl CircuitBreaker {
    pub fn new(policy: CircuitBreakerPolicy) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            policy,
            circuits: Mutex::new(HashMap::new()),
            transitions,
        }
    }

    pub fn policy(&self) -> &CircuitBreakerPolicy {
        &self.policy
    }

    /// Receive state transitions of every circuit.
    pub fn transitions(&self) -> broadcast::Receiver<CircuitTransition> {
        self.transitions.subscribe()
    }

    /// Ask to make a call. `Err` carries the time until a trial may be admitted.
    pub fn acquire(&self, key: &str) -> Result<CallPermit<'_>, Duration> {
        let kind = self.admit(key)?;
        Ok(CallPermit {
            breaker: self,
            key: key.to_string(),
            kind,
            settled: false,
        })
    }

    fn admit(&self, key: &str) -> Result<Permit, Duration> {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(key.to_string()).or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let remaining = circuit
                    .retry_after(now, self.policy.break_duration)
                    .unwrap_or_default();
                if !remaining.is_zero() {
                    return Err(remaining);
                }
                circuit.state = CircuitState::HalfOpen;
                circuit.trial_in_flight = true;
                self.notify(key, CircuitState::Open, CircuitState::HalfOpen);
                info!(circuit = key, "circuit half-open, admitting trial call");
                Ok(Permit::Trial)
            }
            CircuitState::HalfOpen => {
                if circuit.trial_in_flight {
                    Err(Duration::ZERO)
                } else {
                    circuit.trial_in_flight = true;
                    Ok(Permit::Trial)
                }
            }
        }
    }

    fn settle(&self, key: &str, permit: Permit, outcome: CallOutcome) {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let Some(circuit) = circuits.get_mut(key) else {
            return;
        };

        match permit {
            Permit::Trial => {
                circuit.trial_in_flight = false;
                match outcome {
                    CallOutcome::Success => {
                        circuit.state = CircuitState::Closed;
                        circuit.opened_at = None;
                        circuit.clear_samples();
                        self.notify(key, CircuitState::HalfOpen, CircuitState::Closed);
                        info!(circuit = key, "circuit closed after successful trial");
                    }
                    CallOutcome::Failure => {
                        circuit.state = CircuitState::Open;
                        circuit.opened_at = Some(now);
                        self.notify(key, CircuitState::HalfOpen, CircuitState::Open);
                        warn!(circuit = key, "trial call failed, circuit re-opened");
                    }
                    CallOutcome::Ignored => {
                        debug!(circuit = key, "trial call abandoned, slot released");
                    }
                }
            }
            Permit::Normal => {
                // Results of calls admitted before the circuit opened do not count.
                if circuit.state != CircuitState::Closed || outcome == CallOutcome::Ignored {
                    return;
                }
                circuit.evict(now, self.policy.sampling_duration);
                circuit.push(now, outcome == CallOutcome::Failure);

                let calls = circuit.calls();
                let ratio = f64::from(circuit.failures) / f64::from(calls);
                if calls >= self.policy.minimum_throughput && ratio >= self.policy.failure_ratio {
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(now);
                    self.notify(key, CircuitState::Closed, CircuitState::Open);
                    warn!(
                        circuit = key,
                        calls,
                        failures = circuit.failures,
                        break_secs = self.policy.break_duration.as_secs(),
                        "circuit opened"
                    );
                    circuit.clear_samples();
                }
            }
        }
    }

/// Current state of one circuit; unknown keys read as closed.
    pub fn state(&self, key: &str) -> CircuitState {
        self.circuits
            .lock()
            .get(key)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Current state and the outcomes still inside the sampling window.
    pub fn snapshot(&self, key: &str) -> Option<CircuitSnapshot> {
        let now = Instant::now();
        self.circuits.lock().get_mut(key).map(|c| {
            c.evict(now, self.policy.sampling_duration);
            CircuitSnapshot {
                state: c.state,
                calls: c.calls(),
                failures: c.failures,
                retry_after: c.retry_after(now, self.policy.break_duration),
            }
        })
    }

    fn notify(&self, key: &str, from: CircuitState, to: CircuitState) {
        // No receivers is fine.
        let _ = self.transitions.send(CircuitTransition {
            key: key.to_string(),
            from,
            to,
        });
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerPolicy::default())
    }
}

impl core::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("policy", &self.policy)
            .field("circuits", &self.circuits.lock().len())
            .finish()
    }
}
