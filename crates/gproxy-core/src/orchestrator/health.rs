//! Per-credential sliding-window health tracking and a three-state circuit
//! breaker (closed / open / half-open), mirroring the recovery-queue idiom
//! already used by `gproxy-provider-core::credential::pool` but keyed on
//! observed success/failure rate rather than explicit unavailability
//! decisions from a single upstream response.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use super::clock::Clock;

pub type KeyId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub window_size: usize,
    pub window: Duration,
    pub min_requests: usize,
    pub error_rate_threshold: f64,
    pub half_open_duration: Duration,
    pub half_open_success_threshold: u32,
    pub half_open_failure_threshold: u32,
    pub recovery_backoff_initial: Duration,
    pub recovery_backoff_base: f64,
    pub recovery_backoff_max: Duration,
    pub success_increment: f64,
    pub failure_decrement: f64,
    pub probe_recovery_score: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            window: Duration::from_secs(120),
            min_requests: 5,
            error_rate_threshold: 0.6,
            half_open_duration: Duration::from_secs(30),
            half_open_success_threshold: 3,
            half_open_failure_threshold: 2,
            recovery_backoff_initial: Duration::from_secs(10),
            recovery_backoff_base: 2.0,
            recovery_backoff_max: Duration::from_secs(600),
            success_increment: 0.05,
            failure_decrement: 0.1,
            probe_recovery_score: 0.5,
        }
    }
}

#[derive(Debug)]
struct KeyHealth {
    window: VecDeque<(Instant, bool)>,
    state: CircuitState,
    next_probe_at: Option<Instant>,
    half_open_until: Option<Instant>,
    half_open_successes: u32,
    half_open_failures: u32,
    consecutive_failures: u32,
    health_score: f64,
}

impl KeyHealth {
    fn new() -> Self {
        Self {
            window: VecDeque::new(),
            state: CircuitState::Closed,
            next_probe_at: None,
            half_open_until: None,
            half_open_successes: 0,
            half_open_failures: 0,
            consecutive_failures: 0,
            health_score: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthStatus {
    pub state: CircuitState,
    pub health_score: f64,
    pub consecutive_failures: u32,
}

/// Holds the single half-open probe slot for one key. Dropping it (on any
/// exit path of the attempt it was issued for) frees the slot for the next
/// caller, the same RAII shape as `admission::Lease`. Closed keys hand back
/// a guard with no flag to release, since they don't gate on a slot at all.
pub struct ProbeGuard {
    flag: Option<Arc<AtomicBool>>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if let Some(flag) = &self.flag {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

/// Tracks outcome windows and circuit state per upstream key. Window updates
/// and state transitions for a given key happen under that key's own lock
/// entry, so keys don't contend with each other.
pub struct HealthMonitor {
    config: HealthConfig,
    keys: RwLock<HashMap<KeyId, KeyHealth>>,
    /// One atomic flag per key tracking whether its single half-open probe
    /// slot is currently held. Kept separate from `keys` so releasing a
    /// slot (on `ProbeGuard` drop) never needs to await a lock.
    probe_slots: RwLock<HashMap<KeyId, Arc<AtomicBool>>>,
    clock: Arc<dyn Clock>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            keys: RwLock::new(HashMap::new()),
            probe_slots: RwLock::new(HashMap::new()),
            clock,
        }
    }

    fn add_to_window(&self, health: &mut KeyHealth, now: Instant, success: bool) {
        health.window.push_back((now, success));
        while health.window.len() > self.config.window_size {
            health.window.pop_front();
        }
        let cutoff = now.checked_sub(self.config.window).unwrap_or(now);
        while let Some((t, _)) = health.window.front() {
            if *t < cutoff {
                health.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn error_rate(health: &KeyHealth) -> f64 {
        if health.window.is_empty() {
            return 0.0;
        }
        let failures = health.window.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / health.window.len() as f64
    }

    fn recovery_backoff(&self, consecutive_failures: u32) -> Duration {
        let exponent = (consecutive_failures / 5).min(4);
        let secs = self.config.recovery_backoff_initial.as_secs_f64()
            * self.config.recovery_backoff_base.powi(exponent as i32);
        Duration::from_secs_f64(secs).min(self.config.recovery_backoff_max)
    }

    fn open_circuit(&self, health: &mut KeyHealth, now: Instant) {
        health.state = CircuitState::Open;
        health.next_probe_at = Some(now + self.recovery_backoff(health.consecutive_failures));
        health.half_open_until = None;
        health.half_open_successes = 0;
        health.half_open_failures = 0;
    }

    fn enter_half_open(&self, health: &mut KeyHealth, now: Instant) {
        health.state = CircuitState::HalfOpen;
        health.half_open_until = Some(now + self.config.half_open_duration);
        health.half_open_successes = 0;
        health.half_open_failures = 0;
    }

    fn close_circuit(&self, health: &mut KeyHealth) {
        health.state = CircuitState::Closed;
        health.next_probe_at = None;
        health.half_open_until = None;
        health.consecutive_failures = 0;
        health.half_open_successes = 0;
        health.half_open_failures = 0;
        health.health_score = (health.health_score + self.config.probe_recovery_score).min(1.0);
    }

    fn recompute_state(&self, health: &mut KeyHealth, now: Instant) {
        match health.state {
            CircuitState::Closed => {
                if health.window.len() >= self.config.min_requests
                    && Self::error_rate(health) >= self.config.error_rate_threshold
                {
                    self.open_circuit(health, now);
                }
            }
            CircuitState::Open => {
                if let Some(probe_at) = health.next_probe_at
                    && now >= probe_at
                {
                    self.enter_half_open(health, now);
                }
            }
            CircuitState::HalfOpen => {
                if health.half_open_successes >= self.config.half_open_success_threshold {
                    self.close_circuit(health);
                } else if health.half_open_failures >= self.config.half_open_failure_threshold {
                    self.open_circuit(health, now);
                } else if let Some(until) = health.half_open_until
                    && now >= until
                {
                    // half-open window elapsed without a verdict: treat like re-opening.
                    self.open_circuit(health, now);
                }
            }
        }
    }

    pub async fn record_success(&self, key_id: KeyId) {
        let now = self.clock.now();
        let mut keys = self.keys.write().await;
        let health = keys.entry(key_id).or_insert_with(KeyHealth::new);
        self.add_to_window(health, now, true);
        health.consecutive_failures = 0;
        health.health_score = (health.health_score + self.config.success_increment).min(1.0);
        if health.state == CircuitState::HalfOpen {
            health.half_open_successes += 1;
        }
        self.recompute_state(health, now);
    }

    pub async fn record_failure(&self, key_id: KeyId) {
        let now = self.clock.now();
        let mut keys = self.keys.write().await;
        let health = keys.entry(key_id).or_insert_with(KeyHealth::new);
        self.add_to_window(health, now, false);
        health.consecutive_failures += 1;
        health.health_score = (health.health_score - self.config.failure_decrement).max(0.0);
        if health.state == CircuitState::HalfOpen {
            health.half_open_failures += 1;
        }
        self.recompute_state(health, now);
    }

    /// Try to admit one attempt against `key_id`: always for a closed key,
    /// never for an open one, and for a half-open key only while no other
    /// probe is currently in flight (§5: "a half-open key admits at most
    /// one concurrent probe"). The returned guard holds that reservation;
    /// dropping it (the caller's attempt finishing, by any exit path) frees
    /// the slot for the next probe.
    pub async fn is_allowed(&self, key_id: KeyId) -> Option<ProbeGuard> {
        let now = self.clock.now();
        let (state, entered_half_open) = {
            let mut keys = self.keys.write().await;
            let health = keys.entry(key_id).or_insert_with(KeyHealth::new);
            let was_half_open = health.state == CircuitState::HalfOpen;
            self.recompute_state(health, now);
            (health.state, health.state == CircuitState::HalfOpen && !was_half_open)
        };

        if entered_half_open {
            // Fresh half-open window: any stale reservation from a previous
            // window (its guard having dropped without running through
            // here again) must not block the first probe of this one.
            if let Some(flag) = self.probe_slots.read().await.get(&key_id) {
                flag.store(false, Ordering::SeqCst);
            }
        }

        match state {
            CircuitState::Open => None,
            CircuitState::Closed => Some(ProbeGuard { flag: None }),
            CircuitState::HalfOpen => {
                let flag = {
                    let mut slots = self.probe_slots.write().await;
                    slots
                        .entry(key_id)
                        .or_insert_with(|| Arc::new(AtomicBool::new(false)))
                        .clone()
                };
                match flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => Some(ProbeGuard { flag: Some(flag) }),
                    Err(_) => None,
                }
            }
        }
    }

    /// Side-effect-free read of whether `key_id` is worth offering as a
    /// candidate at all (i.e. not fully open). Unlike `is_allowed`, this
    /// does not touch the half-open probe slot, since planning a candidate
    /// is not the same as attempting it.
    pub async fn is_open(&self, key_id: KeyId) -> bool {
        self.status(key_id).await.state == CircuitState::Open
    }

    pub async fn status(&self, key_id: KeyId) -> HealthStatus {
        let now = self.clock.now();
        let mut keys = self.keys.write().await;
        let health = keys.entry(key_id).or_insert_with(KeyHealth::new);
        self.recompute_state(health, now);
        HealthStatus {
            state: health.state,
            health_score: health.health_score,
            consecutive_failures: health.consecutive_failures,
        }
    }

    /// Admin "reset all circuits": clears window/state but does not cancel an
    /// in-flight half-open probe; its outcome still lands against this
    /// (now-reset) entry like any other attempt.
    pub async fn reset(&self, key_id: KeyId) {
        let mut keys = self.keys.write().await;
        keys.insert(key_id, KeyHealth::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> (HealthMonitor, Arc<super::super::clock::TestClock>) {
        let clock = Arc::new(super::super::clock::TestClock::new());
        (
            HealthMonitor::new(HealthConfig::default(), clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn opens_after_sustained_failures() {
        let (monitor, _clock) = monitor();
        for _ in 0..5 {
            monitor.record_failure(1).await;
        }
        assert!(monitor.is_allowed(1).await.is_none());
        assert_eq!(monitor.status(1).await.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn stays_closed_under_threshold() {
        let (monitor, _clock) = monitor();
        for _ in 0..3 {
            monitor.record_failure(1).await;
        }
        for _ in 0..3 {
            monitor.record_success(1).await;
        }
        assert!(monitor.is_allowed(1).await.is_some());
    }

    #[tokio::test]
    async fn half_open_closes_after_enough_successes() {
        let (monitor, clock) = monitor();
        for _ in 0..5 {
            monitor.record_failure(1).await;
        }
        assert_eq!(monitor.status(1).await.state, CircuitState::Open);

        clock.advance(Duration::from_secs(600));
        let probe = monitor.is_allowed(1).await;
        assert!(probe.is_some());
        assert_eq!(monitor.status(1).await.state, CircuitState::HalfOpen);
        drop(probe);

        for _ in 0..3 {
            monitor.record_success(1).await;
        }
        assert_eq!(monitor.status(1).await.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_admits_only_one_concurrent_probe() {
        let (monitor, clock) = monitor();
        for _ in 0..5 {
            monitor.record_failure(1).await;
        }
        clock.advance(Duration::from_secs(600));

        let first = monitor.is_allowed(1).await;
        assert!(first.is_some());
        let second = monitor.is_allowed(1).await;
        assert!(second.is_none(), "a second concurrent probe must not be admitted");

        drop(first);
        let third = monitor.is_allowed(1).await;
        assert!(third.is_some(), "releasing the first probe frees the slot");
    }

    #[tokio::test]
    async fn half_open_reopens_on_failures() {
        let (monitor, clock) = monitor();
        for _ in 0..5 {
            monitor.record_failure(1).await;
        }
        clock.advance(Duration::from_secs(600));
        let probe = monitor.is_allowed(1).await;
        for _ in 0..2 {
            monitor.record_failure(1).await;
        }
        drop(probe);
        assert_eq!(monitor.status(1).await.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn reset_clears_state_but_not_yet_recorded_probe() {
        let (monitor, clock) = monitor();
        for _ in 0..5 {
            monitor.record_failure(1).await;
        }
        clock.advance(Duration::from_secs(600));
        monitor.reset(1).await;
        assert_eq!(monitor.status(1).await.state, CircuitState::Closed);
    }
}
