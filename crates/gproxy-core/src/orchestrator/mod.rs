//! Request-routing brain: candidate planning, admission control, health
//! tracking, adaptive concurrency, cache affinity, cost accounting and the
//! attempt/fallback loop. `Orchestrator` bundles one instance of each,
//! built from a [`gproxy_common::OrchestratorConfig`] so every tunable is
//! hot-reloadable the same way the rest of `GlobalConfig` is.

pub mod adaptive;
pub mod admission;
pub mod affinity;
pub mod clock;
pub mod cost;
pub mod executor;
pub mod health;
pub mod planner;
pub mod quota_reset;

pub use adaptive::{AdaptiveConfig, AdaptiveLearner, LearnerSnapshot, RateLimitKind};
pub use admission::{
    AdmissionConfig, AdmissionController, AdmissionRejection, AdmissionRequest, Lease,
};
pub use affinity::{
    AffinityConfig, AffinityKey, AffinityManager, AffinityStore, AffinityTarget,
    InMemoryAffinityStore,
};
pub use clock::{Clock, SystemClock, TestClock};
pub use cost::{compute_cost, effective_prices, AttemptOutcome, CostBreakdown, EffectivePrices, TokenUsage};
pub use executor::{classify_failure, classify_response, AttemptExecutor, AttemptRecord, Outcome};
pub use health::{CircuitState, HealthConfig, HealthMonitor, HealthStatus};
pub use planner::{Candidate, CandidatePlanner, CapabilityMode, CapabilityTable, Requirements};
pub use quota_reset::{monthly_reset_due, rpm_reset_due, QuotaResetConfig};

use std::sync::Arc;

use gproxy_common::OrchestratorConfig;

/// Owns one instance of each routing subsystem for the process. Constructed
/// once at startup from `GlobalConfig::orchestrator` and handed to the
/// request path behind an `Arc`; a config reload replaces it wholesale the
/// same way `gproxy-core::core` swaps the rest of the running config.
pub struct Orchestrator {
    pub planner: CandidatePlanner,
    pub admission: Arc<AdmissionController>,
    pub health: Arc<HealthMonitor>,
    pub adaptive: Arc<AdaptiveLearner>,
    pub affinity: Arc<AffinityManager>,
    pub executor: AttemptExecutor,
    pub clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(config: &OrchestratorConfig, affinity_store: Arc<dyn AffinityStore>) -> Self {
        Self::with_clock(config, affinity_store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &OrchestratorConfig,
        affinity_store: Arc<dyn AffinityStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let health = Arc::new(HealthMonitor::new(health_config(config), clock.clone()));
        let adaptive = Arc::new(AdaptiveLearner::new(adaptive_config(config), clock.clone()));
        let admission = Arc::new(AdmissionController::new(admission_config(config)));
        let affinity = Arc::new(AffinityManager::new(
            affinity_config(config),
            affinity_store,
            clock.clone(),
        ));
        let capabilities = Arc::new(CapabilityTable::new());
        let planner =
            CandidatePlanner::with_capabilities(capabilities.clone(), affinity.clone(), health.clone());
        let executor = AttemptExecutor::new(
            admission.clone(),
            health.clone(),
            adaptive.clone(),
            capabilities,
        );

        Self {
            planner,
            admission,
            health,
            adaptive,
            affinity,
            executor,
            clock,
        }
    }
}

fn health_config(c: &OrchestratorConfig) -> HealthConfig {
    HealthConfig {
        min_requests: c.health_min_requests,
        half_open_duration: std::time::Duration::from_secs(c.health_half_open_duration_secs),
        half_open_success_threshold: c.health_half_open_success,
        half_open_failure_threshold: c.health_half_open_failure,
        recovery_backoff_initial: std::time::Duration::from_secs(
            c.health_recovery_backoff_initial_secs,
        ),
        success_increment: c.health_success_increment,
        failure_decrement: c.health_failure_decrement,
        probe_recovery_score: c.health_probe_recovery_score,
        ..HealthConfig::default()
    }
}

fn adaptive_config(c: &OrchestratorConfig) -> AdaptiveConfig {
    AdaptiveConfig {
        mult_decrease: c.adaptive_mult_decrease,
        add_increase: c.adaptive_add_increase,
        success_steps_before_increase: c.adaptive_success_steps_before_increase,
        hard_cap: c.adaptive_hard_cap,
        hard_cap_cold_start: c.adaptive_hard_cap_cold_start,
        ..AdaptiveConfig::default()
    }
}

fn admission_config(c: &OrchestratorConfig) -> AdmissionConfig {
    AdmissionConfig {
        probe_phase_requests: c.probe_phase_requests,
        probe_reservation: c.probe_reservation,
        stable_min_reservation: c.stable_min_reservation,
        stable_max_reservation: c.stable_max_reservation,
        cooldown_hours_for_full_confidence: c.cooldown_hours_for_full_confidence,
        low_load_threshold: c.low_load_threshold,
        high_load_threshold: c.high_load_threshold,
        ..AdmissionConfig::default()
    }
}

fn affinity_config(c: &OrchestratorConfig) -> AffinityConfig {
    AffinityConfig {
        default_ttl: std::time::Duration::from_secs(c.cache_affinity_default_ttl_secs),
        l1_max_size: c.cache_affinity_l1_max_size,
        ..AffinityConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_default_config() {
        let config = OrchestratorConfig::default();
        let store: Arc<dyn AffinityStore> = Arc::new(InMemoryAffinityStore::default());
        let orchestrator = Orchestrator::new(&config, store);
        assert_eq!(orchestrator.admission.config().probe_phase_requests, 50);
    }
}
