//! Circuit breaker for the model provider.
//!
//! Counts consecutive transient failures. At the threshold the circuit opens
//! and calls fail fast with `ProviderUnavailable` until the cool-down has
//! passed; then a single probe is admitted. A successful probe closes the
//! circuit, a failed one re-opens it for another cool-down. A probe whose
//! caller goes away frees its slot for the next caller.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use lore_core::config::ProviderConfig;
use lore_core::error::{LoreError, Result};

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

/// Admission to place one provider call.
#[derive(Debug)]
#[must_use = "settle the permit with the call's outcome"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
}

impl BreakerPermit<'_> {
    /// True if this call is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        let probe = std::mem::take(&mut self.probe);
        self.breaker.on_success(probe);
    }

    pub fn record_failure(mut self, error: &LoreError) {
        let probe = std::mem::take(&mut self.probe);
        self.breaker.on_failure(error, probe);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.probe {
            self.breaker.release_probe();
        }
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(config.breaker_failure_threshold, config.breaker_cooldown())
    }

    /// Ask to place a call.
    ///
    /// Returns `ProviderUnavailable` with the remaining cool-down while open,
    /// or while a half-open probe is already running. The returned permit
    /// must be settled with the call's outcome; dropping it unsettled gives a
    /// probe slot back so a cancelled probe cannot wedge the circuit.
    pub fn acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut inner = self.lock();
        let probe = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed < self.cooldown {
                    return Err(LoreError::ProviderUnavailable {
                        retry_after: self.cooldown - elapsed,
                    });
                }
                inner.state = BreakerState::HalfOpen;
                info!("Provider circuit half-open, admitting probe");
                true
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(LoreError::ProviderUnavailable {
                        retry_after: Duration::from_millis(100).min(self.cooldown),
                    });
                }
                true
            }
        };
        if probe {
            inner.probe_in_flight = true;
        }
        Ok(BreakerPermit {
            breaker: self,
            probe,
        })
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            info!("Provider circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        if probe {
            inner.probe_in_flight = false;
        }
    }

    /// Only transient failures count toward opening the circuit.
    fn on_failure(&self, error: &LoreError, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.probe_in_flight = false;
        }
        if !error.is_transient() {
            if probe && inner.state == BreakerState::HalfOpen {
                // The provider answered, so it is reachable.
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
            }
            return;
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = inner.state == BreakerState::HalfOpen
            || inner.consecutive_failures >= self.threshold;
        if trip {
            if inner.state != BreakerState::Open {
                warn!(
                    failures = inner.consecutive_failures,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "Provider circuit opened"
                );
            }
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.probe_in_flight {
            inner.probe_in_flight = false;
            debug!("Half-open probe abandoned before completing");
        }
    }

    /// Current state. An open circuit whose cool-down has passed reports
    /// `HalfOpen`.
    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(t)) if t.elapsed() >= self.cooldown => BreakerState::HalfOpen,
            (state, _) => state,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lore_core::error::TransientKind;

    fn transient() -> LoreError {
        LoreError::transient(TransientKind::Server, "boom")
    }

    fn fail(breaker: &CircuitBreaker, error: &LoreError) {
        breaker.acquire().unwrap().record_failure(error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        for _ in 0..2 {
            fail(&breaker, &transient());
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        fail(&breaker, &transient());
        assert_eq!(breaker.state(), BreakerState::Open);

        match breaker.acquire().unwrap_err() {
            LoreError::ProviderUnavailable { retry_after } => {
                assert!(retry_after <= Duration::from_secs(10));
                assert!(retry_after > Duration::from_secs(9));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_closes_on_success() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(5));
        fail(&breaker, &transient());
        assert!(breaker.acquire().is_err());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        let probe = breaker.acquire().unwrap();
        assert!(probe.is_probe());
        // Only one probe at a time.
        assert!(breaker.acquire().is_err());
        probe.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(!breaker.acquire().unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(5));
        fail(&breaker, &transient());
        tokio::time::advance(Duration::from_secs(6)).await;
        fail(&breaker, &transient());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_the_slot() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(5));
        fail(&breaker, &transient());
        tokio::time::advance(Duration::from_secs(5)).await;

        let probe = breaker.acquire().unwrap();
        assert!(breaker.acquire().is_err());
        drop(probe);

        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        let retry = breaker.acquire().unwrap();
        assert!(retry.is_probe());
        retry.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_call_settling_late_keeps_trial_slot() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(5));
        let straggler = breaker.acquire().unwrap();
        fail(&breaker, &transient());
        tokio::time::advance(Duration::from_secs(5)).await;

        let probe = breaker.acquire().unwrap();
        straggler.record_failure(&LoreError::ProviderPermanent("bad".into()));
        // The straggler was not the probe, so no second probe is admitted.
        assert!(breaker.acquire().is_err());
        probe.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_permanent_failures_do_not_trip() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(5));
        for _ in 0..5 {
            fail(&breaker, &LoreError::ProviderPermanent("bad key".into()));
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn test_success_resets_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(5));
        fail(&breaker, &transient());
        fail(&breaker, &transient());
        breaker.acquire().unwrap().record_success();
        fail(&breaker, &transient());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }
}
