//! AIMD concurrency learner for keys in adaptive mode
//! (`credential.max_concurrent == None`). Converges `learned_max_concurrent`
//! toward the highest concurrency level the upstream tolerates, driven by
//! the two 429 sub-classes distinguished by the attempt executor.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::RwLock;

use super::clock::Clock;

pub type KeyId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitKind {
    Concurrent,
    Rpm,
}

#[derive(Debug, Clone, Copy)]
pub struct AdaptiveConfig {
    pub cold_start_ceiling: i32,
    pub mult_decrease: f64,
    pub add_increase: i32,
    pub success_steps_before_increase: u32,
    pub hard_cap: i32,
    pub hard_cap_cold_start: i32,
    pub history_capacity: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            cold_start_ceiling: 4,
            mult_decrease: 0.7,
            add_increase: 1,
            success_steps_before_increase: 20,
            hard_cap: 64,
            hard_cap_cold_start: 8,
            history_capacity: 32,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdjustmentRecord {
    pub at: SystemTime,
    pub kind: RateLimitKind,
    pub new_ceiling: i32,
}

#[derive(Debug)]
struct LearnerState {
    learned_max_concurrent: i32,
    success_steps_at_ceiling: u32,
    last_429_at: Option<SystemTime>,
    last_429_type: Option<RateLimitKind>,
    history: VecDeque<AdjustmentRecord>,
}

impl LearnerState {
    fn cold_start(cfg: &AdaptiveConfig) -> Self {
        Self {
            learned_max_concurrent: cfg.cold_start_ceiling,
            success_steps_at_ceiling: 0,
            last_429_at: None,
            last_429_type: None,
            history: VecDeque::new(),
        }
    }
}

/// Snapshot of a key's adaptive concurrency state, suitable for persisting
/// back into `CredentialRow.learned_max_concurrent` and friends.
#[derive(Debug, Clone)]
pub struct LearnerSnapshot {
    pub learned_max_concurrent: i32,
    pub last_429_at: Option<SystemTime>,
    pub last_429_type: Option<RateLimitKind>,
}

pub struct AdaptiveLearner {
    config: AdaptiveConfig,
    keys: RwLock<HashMap<KeyId, LearnerState>>,
    clock: Arc<dyn Clock>,
}

impl AdaptiveLearner {
    pub fn new(config: AdaptiveConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            keys: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Seed a key's learned ceiling from a prior run's persisted value.
    pub async fn seed(&self, key_id: KeyId, learned_max_concurrent: Option<i32>) {
        let mut keys = self.keys.write().await;
        let entry = keys
            .entry(key_id)
            .or_insert_with(|| LearnerState::cold_start(&self.config));
        if let Some(value) = learned_max_concurrent {
            entry.learned_max_concurrent = value;
        }
    }

    pub async fn effective_limit(&self, key_id: KeyId) -> i32 {
        let keys = self.keys.read().await;
        keys.get(&key_id)
            .map(|s| s.learned_max_concurrent)
            .unwrap_or(self.config.cold_start_ceiling)
    }

    pub async fn record_concurrent_429(&self, key_id: KeyId, current_concurrent: i32) {
        let now = self.clock.system_now();
        let mut keys = self.keys.write().await;
        let state = keys
            .entry(key_id)
            .or_insert_with(|| LearnerState::cold_start(&self.config));

        let new_ceiling = ((current_concurrent as f64 * self.config.mult_decrease).floor() as i32)
            .max(1);
        state.learned_max_concurrent = new_ceiling;
        state.success_steps_at_ceiling = 0;
        state.last_429_at = Some(now);
        state.last_429_type = Some(RateLimitKind::Concurrent);
        push_history(
            &mut state.history,
            self.config.history_capacity,
            AdjustmentRecord {
                at: now,
                kind: RateLimitKind::Concurrent,
                new_ceiling,
            },
        );
    }

    /// RPM 429s do not alter the concurrency ceiling; they are recorded here
    /// only so `last_429_at`/`last_429_type` stay accurate for the admission
    /// controller's confidence calculation. The RPM window itself lives in
    /// `orchestrator::admission`.
    pub async fn record_rpm_429(&self, key_id: KeyId) {
        let now = self.clock.system_now();
        let mut keys = self.keys.write().await;
        let state = keys
            .entry(key_id)
            .or_insert_with(|| LearnerState::cold_start(&self.config));
        state.last_429_at = Some(now);
        state.last_429_type = Some(RateLimitKind::Rpm);
    }

    pub async fn record_success_at_ceiling(&self, key_id: KeyId, cold_start: bool) {
        let now = self.clock.system_now();
        let mut keys = self.keys.write().await;
        let state = keys
            .entry(key_id)
            .or_insert_with(|| LearnerState::cold_start(&self.config));
        state.success_steps_at_ceiling += 1;
        if state.success_steps_at_ceiling >= self.config.success_steps_before_increase {
            let cap = if cold_start {
                self.config.hard_cap_cold_start
            } else {
                self.config.hard_cap
            };
            let new_ceiling = (state.learned_max_concurrent + self.config.add_increase).min(cap);
            if new_ceiling != state.learned_max_concurrent {
                state.learned_max_concurrent = new_ceiling;
                push_history(
                    &mut state.history,
                    self.config.history_capacity,
                    AdjustmentRecord {
                        at: now,
                        kind: RateLimitKind::Concurrent,
                        new_ceiling,
                    },
                );
            }
            state.success_steps_at_ceiling = 0;
        }
    }

    pub async fn reset(&self, key_id: KeyId) {
        let mut keys = self.keys.write().await;
        keys.insert(key_id, LearnerState::cold_start(&self.config));
    }

    pub async fn snapshot(&self, key_id: KeyId) -> LearnerSnapshot {
        let keys = self.keys.read().await;
        match keys.get(&key_id) {
            Some(state) => LearnerSnapshot {
                learned_max_concurrent: state.learned_max_concurrent,
                last_429_at: state.last_429_at,
                last_429_type: state.last_429_type,
            },
            None => LearnerSnapshot {
                learned_max_concurrent: self.config.cold_start_ceiling,
                last_429_at: None,
                last_429_type: None,
            },
        }
    }

    /// Variance of the last N recorded ceiling adjustments, used by the
    /// admission controller's confidence score. `None` with fewer than 2
    /// samples.
    pub async fn adjustment_variance(&self, key_id: KeyId) -> Option<f64> {
        let keys = self.keys.read().await;
        let history = &keys.get(&key_id)?.history;
        if history.len() < 2 {
            return None;
        }
        let values: Vec<f64> = history.iter().map(|r| r.new_ceiling as f64).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        Some(variance)
    }
}

fn push_history(history: &mut VecDeque<AdjustmentRecord>, capacity: usize, record: AdjustmentRecord) {
    history.push_back(record);
    while history.len() > capacity {
        history.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::clock::TestClock;

    fn learner() -> AdaptiveLearner {
        AdaptiveLearner::new(AdaptiveConfig::default(), Arc::new(TestClock::new()))
    }

    #[tokio::test]
    async fn concurrent_429_backs_off_multiplicatively() {
        let learner = learner();
        learner.seed(1, Some(10)).await;
        learner.record_concurrent_429(1, 10).await;
        assert_eq!(learner.effective_limit(1).await, 7);
    }

    #[tokio::test]
    async fn never_backs_off_below_one() {
        let learner = learner();
        learner.seed(1, Some(1)).await;
        learner.record_concurrent_429(1, 1).await;
        assert_eq!(learner.effective_limit(1).await, 1);
    }

    #[tokio::test]
    async fn rpm_429_does_not_change_ceiling() {
        let learner = learner();
        learner.seed(1, Some(10)).await;
        learner.record_rpm_429(1).await;
        assert_eq!(learner.effective_limit(1).await, 10);
    }

    #[tokio::test]
    async fn sustained_success_raises_ceiling() {
        let learner = learner();
        learner.seed(1, Some(4)).await;
        for _ in 0..20 {
            learner.record_success_at_ceiling(1, false).await;
        }
        assert_eq!(learner.effective_limit(1).await, 5);
    }

    #[tokio::test]
    async fn reset_returns_to_cold_start() {
        let learner = learner();
        learner.seed(1, Some(40)).await;
        learner.reset(1).await;
        assert_eq!(
            learner.effective_limit(1).await,
            AdaptiveConfig::default().cold_start_ceiling
        );
    }
}
