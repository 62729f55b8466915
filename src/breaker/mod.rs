//! Per-capability circuit breakers.
//!
//! Each capability name gets its own [`BreakerState`], created on first use
//! and kept for the life of the registry. State lives behind a mutex scoped to
//! that one capability, so a slow or failing provider never makes callers of
//! an unrelated provider wait.
//!
//! ```text
//!            failure_count >= threshold
//!   closed ─────────────────────────────▶ open
//!     ▲                                     │ reset_timeout elapsed
//!     │ probe succeeds                      ▼
//!     └────────────────────────────────  half_open ──▶ open (probe fails)
//! ```
//!
//! While half-open exactly one caller holds the probe. Everyone else is
//! rejected with [`RejectReason::ProbeInFlight`] until the probe settles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::metrics::MetricsCollector;

/// Default consecutive transient failures before a breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time an open breaker waits before allowing a probe.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// Transitions kept per breaker for inspection.
const HISTORY_LIMIT: usize = 64;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
        }
    }
}

impl BreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Why a call was turned away without reaching the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The breaker is open; a probe becomes possible after `retry_after`.
    CircuitOpen { retry_after: Duration },
    /// The breaker is half-open and another caller holds the probe.
    ProbeInFlight,
}

/// Decision for one incoming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed: call normally.
    Allowed,
    /// Half-open: this caller is the single probe and must report back.
    Probe,
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_probe(&self) -> bool {
        matches!(self, Admission::Probe)
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub probe_in_flight: bool,
    pub transitions: Vec<BreakerTransition>,
}

/// Fault state for a single capability.
///
/// Mutated only through [`admit`](Self::admit), [`record_success`](Self::record_success),
/// [`record_failure`](Self::record_failure) and [`release_probe`](Self::release_probe).
#[derive(Debug)]
pub struct BreakerState {
    name: String,
    state: CircuitState,
    failure_count: u32,
    failure_threshold: u32,
    opened_at: Option<Instant>,
    reset_timeout: Duration,
    probe_in_flight: bool,
    history: Vec<BreakerTransition>,
    metrics: MetricsCollector,
}

impl BreakerState {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold: config.failure_threshold.max(1),
            opened_at: None,
            reset_timeout: config.reset_timeout,
            probe_in_flight: false,
            history: Vec::new(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    pub fn probe_in_flight(&self) -> bool {
        self.probe_in_flight
    }

    pub fn transitions(&self) -> &[BreakerTransition] {
        &self.history
    }

    /// Decide whether a call arriving at `now` may proceed.
    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.reset_timeout {
                    self.transition(CircuitState::HalfOpen, "reset timeout elapsed");
                    self.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Rejected(RejectReason::CircuitOpen {
                        retry_after: self.reset_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Admission::Rejected(RejectReason::ProbeInFlight)
                } else {
                    self.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Feed a successful call.
    ///
    /// A successful probe closes the breaker. A success while closed resets
    /// the consecutive failure count. Late successes from calls admitted
    /// before the breaker opened do not close it.
    pub fn record_success(&mut self, admission: Admission) {
        match (self.state, admission.is_probe()) {
            (CircuitState::HalfOpen, true) => {
                self.probe_in_flight = false;
                self.opened_at = None;
                self.transition(CircuitState::Closed, "probe succeeded");
            }
            (CircuitState::Closed, _) => self.failure_count = 0,
            _ => {}
        }
    }

    /// Feed a transient failure observed at `now`.
    pub fn record_failure(&mut self, admission: Admission, now: Instant, reason: &str) {
        match (self.state, admission.is_probe()) {
            (CircuitState::HalfOpen, true) => {
                self.probe_in_flight = false;
                self.failure_count = self.failure_count.saturating_add(1);
                self.opened_at = Some(now);
                self.transition(CircuitState::Open, &format!("probe failed: {}", reason));
            }
            (CircuitState::Closed, _) => {
                self.failure_count = self.failure_count.saturating_add(1);
                if self.failure_count >= self.failure_threshold {
                    self.opened_at = Some(now);
                    let why = format!(
                        "{} consecutive failures (threshold {}): {}",
                        self.failure_count, self.failure_threshold, reason
                    );
                    self.transition(CircuitState::Open, &why);
                }
            }
            _ => {}
        }
    }

    /// Give back a probe whose call ended without a health signal.
    ///
    /// Used for permanent errors and cancelled calls; the breaker stays
    /// half-open and the next caller becomes the probe.
    pub fn release_probe(&mut self, admission: Admission) {
        if admission.is_probe() && self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            name: self.name.clone(),
            state: self.state,
            failure_count: self.failure_count,
            failure_threshold: self.failure_threshold,
            probe_in_flight: self.probe_in_flight,
            transitions: self.history.clone(),
        }
    }

    fn transition(&mut self, to: CircuitState, reason: &str) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        if to == CircuitState::Closed {
            self.failure_count = 0;
        }

        if to == CircuitState::Open {
            warn!(capability = %self.name, from = %from, to = %to, reason, "Circuit breaker opened");
        } else {
            info!(capability = %self.name, from = %from, to = %to, reason, "Circuit breaker transition");
        }
        self.metrics
            .record_breaker_transition(&self.name, &from.to_string(), &to.to_string());

        if self.history.len() == HISTORY_LIMIT {
            self.history.remove(0);
        }
        self.history.push(BreakerTransition {
            from,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        });
    }
}

/// Shared handle to one capability's breaker.
pub type SharedBreaker = Arc<Mutex<BreakerState>>;

/// All breakers, keyed by capability name.
///
/// The map lock is only held long enough to find or insert an entry; state
/// transitions happen under the per-capability mutex.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: RwLock<HashMap<String, SharedBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Use different tunables for one capability.
    pub fn with_override(mut self, capability: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(capability.into(), config);
        self
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Breaker for `capability`, created closed on first request.
    pub fn breaker(&self, capability: &str) -> SharedBreaker {
        {
            let breakers = self.breakers.read().expect("breaker map lock poisoned");
            if let Some(existing) = breakers.get(capability) {
                return Arc::clone(existing);
            }
        }

        let mut breakers = self.breakers.write().expect("breaker map lock poisoned");
        let config = self
            .overrides
            .get(capability)
            .copied()
            .unwrap_or(self.config);
        Arc::clone(
            breakers
                .entry(capability.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(BreakerState::new(capability, config)))),
        )
    }

    /// Current state, or `None` if the capability was never called.
    pub fn state(&self, capability: &str) -> Option<CircuitState> {
        self.snapshot(capability).map(|s| s.state)
    }

    pub fn snapshot(&self, capability: &str) -> Option<BreakerSnapshot> {
        let breaker = {
            let breakers = self.breakers.read().expect("breaker map lock poisoned");
            breakers.get(capability).cloned()
        }?;
        let state = breaker.lock().expect("breaker lock poisoned");
        Some(state.snapshot())
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<SharedBreaker> = {
            let map = self.breakers.read().expect("breaker map lock poisoned");
            map.values().cloned().collect()
        };
        let mut out: Vec<BreakerSnapshot> = breakers
            .iter()
            .map(|b| b.lock().expect("breaker lock poisoned").snapshot())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, reset_ms: u64) -> BreakerConfig {
        BreakerConfig::default()
            .with_failure_threshold(threshold)
            .with_reset_timeout(Duration::from_millis(reset_ms))
    }

    #[test]
    fn test_opens_exactly_at_threshold() {
        let mut breaker = BreakerState::new("search", config(5, 60_000));
        let now = Instant::now();

        for i in 1..=4 {
            assert_eq!(breaker.admit(now), Admission::Allowed);
            breaker.record_failure(Admission::Allowed, now, "timeout");
            assert_eq!(breaker.state(), CircuitState::Closed, "opened early at {}", i);
        }
        breaker.record_failure(Admission::Allowed, now, "timeout");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.opened_at(), Some(now));

        let opens = breaker
            .transitions()
            .iter()
            .filter(|t| t.from == CircuitState::Closed && t.to == CircuitState::Open)
            .count();
        assert_eq!(opens, 1);

        assert!(matches!(
            breaker.admit(now + Duration::from_secs(1)),
            Admission::Rejected(RejectReason::CircuitOpen { .. })
        ));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let mut breaker = BreakerState::new("search", config(3, 60_000));
        let now = Instant::now();
        breaker.record_failure(Admission::Allowed, now, "x");
        breaker.record_failure(Admission::Allowed, now, "x");
        breaker.record_success(Admission::Allowed);
        assert_eq!(breaker.failure_count(), 0);
        breaker.record_failure(Admission::Allowed, now, "x");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_allows_single_probe() {
        let mut breaker = BreakerState::new("search", config(1, 100));
        let t0 = Instant::now();
        breaker.record_failure(Admission::Allowed, t0, "timeout");
        assert_eq!(breaker.state(), CircuitState::Open);

        let later = t0 + Duration::from_millis(150);
        assert_eq!(breaker.admit(later), Admission::Probe);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(
            breaker.admit(later),
            Admission::Rejected(RejectReason::ProbeInFlight)
        );

        breaker.record_success(Admission::Probe);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.admit(later), Admission::Allowed);
    }

    #[test]
    fn test_failed_probe_reopens_and_resets_opened_at() {
        let mut breaker = BreakerState::new("search", config(1, 100));
        let t0 = Instant::now();
        breaker.record_failure(Admission::Allowed, t0, "timeout");

        let t1 = t0 + Duration::from_millis(120);
        assert_eq!(breaker.admit(t1), Admission::Probe);
        breaker.record_failure(Admission::Probe, t1, "timeout");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.opened_at(), Some(t1));
        assert!(!breaker.probe_in_flight());

        // Measured from the new opened_at, not the original one.
        assert!(matches!(
            breaker.admit(t0 + Duration::from_millis(150)),
            Admission::Rejected(RejectReason::CircuitOpen { .. })
        ));
        assert_eq!(breaker.admit(t1 + Duration::from_millis(100)), Admission::Probe);
    }

    #[test]
    fn test_released_probe_lets_next_caller_probe() {
        let mut breaker = BreakerState::new("search", config(1, 0));
        let now = Instant::now();
        breaker.record_failure(Admission::Allowed, now, "timeout");
        assert_eq!(breaker.admit(now), Admission::Probe);
        breaker.release_probe(Admission::Probe);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.admit(now), Admission::Probe);
    }

    #[test]
    fn test_late_results_do_not_move_open_breaker() {
        let mut breaker = BreakerState::new("search", config(1, 60_000));
        let now = Instant::now();
        breaker.record_failure(Admission::Allowed, now, "timeout");
        breaker.record_success(Admission::Allowed);
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.record_failure(Admission::Allowed, now, "timeout");
        assert_eq!(breaker.transitions().len(), 1);
    }

    #[test]
    fn test_registry_is_lazy_and_isolated() {
        let registry = BreakerRegistry::new(config(1, 60_000))
            .with_override("text-generation", config(3, 60_000));
        assert!(registry.state("search").is_none());

        let search = registry.breaker("search");
        search
            .lock()
            .unwrap()
            .record_failure(Admission::Allowed, Instant::now(), "timeout");

        let text = registry.breaker("text-generation");
        text.lock()
            .unwrap()
            .record_failure(Admission::Allowed, Instant::now(), "timeout");

        assert_eq!(registry.state("search"), Some(CircuitState::Open));
        assert_eq!(registry.state("text-generation"), Some(CircuitState::Closed));
        assert!(Arc::ptr_eq(&search, &registry.breaker("search")));

        let names: Vec<String> = registry.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["search".to_string(), "text-generation".to_string()]);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut breaker = BreakerState::new("flaky", config(1, 0));
        let now = Instant::now();
        for _ in 0..100 {
            breaker.record_failure(Admission::Allowed, now, "timeout");
            let admission = breaker.admit(now);
            breaker.record_success(admission);
        }
        assert_eq!(breaker.transitions().len(), HISTORY_LIMIT);
    }
}
