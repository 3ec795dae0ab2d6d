//! Per-node failure tracking with closed/open/half-open
//! states.
//!
//! Timestamps are passed in by the caller rather than read from the system
//! clock here, so tests can drive the cool-down deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentmesh_core::error::CoreError;
use parking_lot::RwLock;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn encode(self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }

    fn decode(raw: u8) -> Self {
        match raw {
            0 => BreakerState::Closed,
            1 => BreakerState::Open,
            _ => BreakerState::HalfOpen,
        }
    }
}

/// A permit acquired from `CircuitBreaker::acquire`. Must be resolved with
/// `record_success` or `record_failure` exactly once.
pub enum CallPermit {
    Normal,
    Probe(#[allow(dead_code)] OwnedSemaphorePermit),
}

/// Per-node breaker. Closed: calls proceed, failures counted. `N` consecutive
/// failures (default 5) open the breaker. Open: all calls short-circuit for
/// `T` seconds (default 30). After `T`, a single half-open probe is allowed;
/// success closes the breaker, failure reopens it.
pub struct CircuitBreaker {
    node: String,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    last_transition_unix_ms: AtomicI64,
    half_open_gate: Arc<Semaphore>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(node: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            node: node.into(),
            state: AtomicU8::new(BreakerState::Closed.encode()),
            consecutive_failures: AtomicU32::new(0),
            last_transition_unix_ms: AtomicI64::new(0),
            half_open_gate: Arc::new(Semaphore::new(1)),
            failure_threshold,
            cooldown,
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::decode(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, to: BreakerState, now_unix_ms: i64) {
        tracing::debug!(node = %self.node, to = ?to, "breaker transition");
        self.state.store(to.encode(), Ordering::SeqCst);
        self.last_transition_unix_ms.store(now_unix_ms, Ordering::SeqCst);
    }

    /// Attempts to acquire permission to make a call. Returns
    /// `NodeUnavailable` when the breaker is open (cool-down still running,
    /// or a half-open probe is already in flight).
    pub fn acquire(&self, now_unix_ms: i64) -> Result<CallPermit, CoreError> {
        match self.state() {
            BreakerState::Closed => Ok(CallPermit::Normal),
            BreakerState::HalfOpen => self.try_probe(now_unix_ms),
            BreakerState::Open => {
                let last = self.last_transition_unix_ms.load(Ordering::SeqCst);
                let elapsed_ms = now_unix_ms.saturating_sub(last);
                if elapsed_ms >= self.cooldown.as_millis() as i64 {
                    let was_open = self
                        .state
                        .compare_exchange(
                            BreakerState::Open.encode(),
                            BreakerState::HalfOpen.encode(),
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok();
                    if was_open {
                        tracing::debug!(node = %self.node, "breaker transition: open -> half_open");
                        self.last_transition_unix_ms.store(now_unix_ms, Ordering::SeqCst);
                    }
                    self.try_probe(now_unix_ms)
                } else {
                    Err(CoreError::NodeUnavailable {
                        node: self.node.clone(),
                    })
                }
            }
        }
    }

    fn try_probe(&self, _now_unix_ms: i64) -> Result<CallPermit, CoreError> {
        match self.half_open_gate.clone().try_acquire_owned() {
            Ok(permit) => Ok(CallPermit::Probe(permit)),
            Err(_) => Err(CoreError::NodeUnavailable {
                node: self.node.clone(),
            }),
        }
    }

    pub fn record_success(&self, _permit: CallPermit, now_unix_ms: i64) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if self.state() != BreakerState::Closed {
            self.transition(BreakerState::Closed, now_unix_ms);
        }
    }

    pub fn record_failure(&self, _permit: CallPermit, now_unix_ms: i64) {
        match self.state() {
            BreakerState::HalfOpen => {
                self.transition(BreakerState::Open, now_unix_ms);
            }
            BreakerState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.failure_threshold {
                    self.transition(BreakerState::Open, now_unix_ms);
                }
            }
            BreakerState::Open => {}
        }
    }
}

/// Owns one `CircuitBreaker` per node, created lazily on first use.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl BreakerRegistry {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            failure_threshold,
            cooldown,
        }
    }

    pub fn get_or_create(&self, node: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(node) {
            return existing.clone();
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(node.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(node, self.failure_threshold, self.cooldown)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("mail", 5, Duration::from_secs(30));
        for t in 0..5 {
            let permit = breaker.acquire(t).unwrap();
            breaker.record_failure(permit, t);
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn sixth_call_short_circuits_without_network() {
        let breaker = CircuitBreaker::new("mail", 5, Duration::from_secs(30));
        for t in 0..5 {
            let permit = breaker.acquire(t).unwrap();
            breaker.record_failure(permit, t);
        }
        let result = breaker.acquire(5);
        assert!(matches!(result, Err(CoreError::NodeUnavailable { .. })));
    }

    #[test]
    fn half_open_allows_exactly_one_probe() {
        let breaker = CircuitBreaker::new("mail", 1, Duration::from_secs(10));
        let permit = breaker.acquire(0).unwrap();
        breaker.record_failure(permit, 0);
        assert_eq!(breaker.state(), BreakerState::Open);

        // cooldown elapsed at t=10_000ms
        let probe = breaker.acquire(10_000).unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // a second concurrent caller is refused the probe slot
        let second = breaker.acquire(10_000);
        assert!(matches!(second, Err(CoreError::NodeUnavailable { .. })));
        drop(probe);
    }

    #[test]
    fn successful_probe_closes_breaker_and_resets_counters() {
        let breaker = CircuitBreaker::new("mail", 1, Duration::from_secs(10));
        let permit = breaker.acquire(0).unwrap();
        breaker.record_failure(permit, 0);
        let probe = breaker.acquire(10_000).unwrap();
        breaker.record_success(probe, 10_000);
        assert_eq!(breaker.state(), BreakerState::Closed);
        // breaker closed: needs a fresh run of failures to reopen
        let permit = breaker.acquire(10_001).unwrap();
        breaker.record_failure(permit, 10_001);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn failed_probe_reopens_and_restarts_cooldown() {
        let breaker = CircuitBreaker::new("mail", 1, Duration::from_secs(10));
        let permit = breaker.acquire(0).unwrap();
        breaker.record_failure(permit, 0);
        let probe = breaker.acquire(10_000).unwrap();
        breaker.record_failure(probe, 10_000);
        assert_eq!(breaker.state(), BreakerState::Open);
        // cooldown restarted at 10_000, so 10_005 is still too soon
        assert!(breaker.acquire(10_005).is_err());
        assert!(breaker.acquire(20_000).is_ok());
    }

    #[test]
    fn registry_reuses_breaker_for_same_node() {
        let registry = BreakerRegistry::new(5, Duration::from_secs(30));
        let a = registry.get_or_create("mail");
        let b = registry.get_or_create("mail");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
