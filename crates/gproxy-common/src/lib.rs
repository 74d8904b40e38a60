use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order (after DB connection): CLI > ENV > DB, then persist back to DB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Stored as a hash (not plaintext).
    pub admin_key_hash: String,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    /// Database DSN used for this process.
    pub dsn: String,
    /// Whether to redact sensitive fields in emitted events.
    pub event_redact_sensitive: bool,
    /// Tunables for the candidate planner / admission / health / adaptive /
    /// affinity subsystems. Hot-reloadable like the rest of `GlobalConfig`.
    pub orchestrator: OrchestratorConfig,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_key_hash: Option<String>,
    pub proxy: Option<String>,
    pub dsn: Option<String>,
    pub event_redact_sensitive: Option<bool>,
    pub orchestrator: OrchestratorConfigPatch,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.admin_key_hash.is_some() {
            self.admin_key_hash = other.admin_key_hash;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.event_redact_sensitive.is_some() {
            self.event_redact_sensitive = other.event_redact_sensitive;
        }
        self.orchestrator.overlay(other.orchestrator);
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8787),
            admin_key_hash: self
                .admin_key_hash
                .ok_or(GlobalConfigError::MissingField("admin_key_hash"))?,
            proxy: self.proxy,
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            event_redact_sensitive: self.event_redact_sensitive.unwrap_or(true),
            orchestrator: self.orchestrator.into_config(),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key_hash: Some(value.admin_key_hash),
            proxy: value.proxy,
            dsn: Some(value.dsn),
            event_redact_sensitive: Some(value.event_redact_sensitive),
            orchestrator: value.orchestrator.into(),
        }
    }
}

/// Tunables named in the configuration surface: admission's dynamic
/// reservation, health's circuit breaker, the adaptive concurrency
/// learner, and cache affinity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub probe_phase_requests: u64,
    pub probe_reservation: f64,
    pub stable_min_reservation: f64,
    pub stable_max_reservation: f64,
    pub success_count_for_full_confidence: u32,
    pub cooldown_hours_for_full_confidence: f64,
    pub low_load_threshold: f64,
    pub high_load_threshold: f64,
    pub health_min_requests: usize,
    pub health_half_open_duration_secs: u64,
    pub health_half_open_success: u32,
    pub health_half_open_failure: u32,
    pub health_recovery_backoff_initial_secs: u64,
    pub health_success_increment: f64,
    pub health_failure_decrement: f64,
    pub health_probe_recovery_score: f64,
    pub adaptive_mult_decrease: f64,
    pub adaptive_add_increase: i32,
    pub adaptive_success_steps_before_increase: u32,
    pub adaptive_hard_cap: i32,
    pub adaptive_hard_cap_cold_start: i32,
    pub cache_affinity_default_ttl_secs: u64,
    pub cache_affinity_l1_max_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            probe_phase_requests: 50,
            probe_reservation: 0.10,
            stable_min_reservation: 0.10,
            stable_max_reservation: 0.40,
            success_count_for_full_confidence: 50,
            cooldown_hours_for_full_confidence: 24.0,
            low_load_threshold: 0.5,
            high_load_threshold: 0.8,
            health_min_requests: 5,
            health_half_open_duration_secs: 30,
            health_half_open_success: 3,
            health_half_open_failure: 2,
            health_recovery_backoff_initial_secs: 10,
            health_success_increment: 0.05,
            health_failure_decrement: 0.1,
            health_probe_recovery_score: 0.5,
            adaptive_mult_decrease: 0.7,
            adaptive_add_increase: 1,
            adaptive_success_steps_before_increase: 20,
            adaptive_hard_cap: 64,
            adaptive_hard_cap_cold_start: 8,
            cache_affinity_default_ttl_secs: 300,
            cache_affinity_l1_max_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfigPatch {
    pub probe_phase_requests: Option<u64>,
    pub probe_reservation: Option<f64>,
    pub stable_min_reservation: Option<f64>,
    pub stable_max_reservation: Option<f64>,
    pub success_count_for_full_confidence: Option<u32>,
    pub cooldown_hours_for_full_confidence: Option<f64>,
    pub low_load_threshold: Option<f64>,
    pub high_load_threshold: Option<f64>,
    pub health_min_requests: Option<usize>,
    pub health_half_open_duration_secs: Option<u64>,
    pub health_half_open_success: Option<u32>,
    pub health_half_open_failure: Option<u32>,
    pub health_recovery_backoff_initial_secs: Option<u64>,
    pub health_success_increment: Option<f64>,
    pub health_failure_decrement: Option<f64>,
    pub health_probe_recovery_score: Option<f64>,
    pub adaptive_mult_decrease: Option<f64>,
    pub adaptive_add_increase: Option<i32>,
    pub adaptive_success_steps_before_increase: Option<u32>,
    pub adaptive_hard_cap: Option<i32>,
    pub adaptive_hard_cap_cold_start: Option<i32>,
    pub cache_affinity_default_ttl_secs: Option<u64>,
    pub cache_affinity_l1_max_size: Option<usize>,
}

macro_rules! overlay_field {
    ($self:ident, $other:ident, $field:ident) => {
        if $other.$field.is_some() {
            $self.$field = $other.$field;
        }
    };
}

impl OrchestratorConfigPatch {
    pub fn overlay(&mut self, other: OrchestratorConfigPatch) {
        overlay_field!(self, other, probe_phase_requests);
        overlay_field!(self, other, probe_reservation);
        overlay_field!(self, other, stable_min_reservation);
        overlay_field!(self, other, stable_max_reservation);
        overlay_field!(self, other, success_count_for_full_confidence);
        overlay_field!(self, other, cooldown_hours_for_full_confidence);
        overlay_field!(self, other, low_load_threshold);
        overlay_field!(self, other, high_load_threshold);
        overlay_field!(self, other, health_min_requests);
        overlay_field!(self, other, health_half_open_duration_secs);
        overlay_field!(self, other, health_half_open_success);
        overlay_field!(self, other, health_half_open_failure);
        overlay_field!(self, other, health_recovery_backoff_initial_secs);
        overlay_field!(self, other, health_success_increment);
        overlay_field!(self, other, health_failure_decrement);
        overlay_field!(self, other, health_probe_recovery_score);
        overlay_field!(self, other, adaptive_mult_decrease);
        overlay_field!(self, other, adaptive_add_increase);
        overlay_field!(self, other, adaptive_success_steps_before_increase);
        overlay_field!(self, other, adaptive_hard_cap);
        overlay_field!(self, other, adaptive_hard_cap_cold_start);
        overlay_field!(self, other, cache_affinity_default_ttl_secs);
        overlay_field!(self, other, cache_affinity_l1_max_size);
    }

    pub fn into_config(self) -> OrchestratorConfig {
        let d = OrchestratorConfig::default();
        OrchestratorConfig {
            probe_phase_requests: self.probe_phase_requests.unwrap_or(d.probe_phase_requests),
            probe_reservation: self.probe_reservation.unwrap_or(d.probe_reservation),
            stable_min_reservation: self
                .stable_min_reservation
                .unwrap_or(d.stable_min_reservation),
            stable_max_reservation: self
                .stable_max_reservation
                .unwrap_or(d.stable_max_reservation),
            success_count_for_full_confidence: self
                .success_count_for_full_confidence
                .unwrap_or(d.success_count_for_full_confidence),
            cooldown_hours_for_full_confidence: self
                .cooldown_hours_for_full_confidence
                .unwrap_or(d.cooldown_hours_for_full_confidence),
            low_load_threshold: self.low_load_threshold.unwrap_or(d.low_load_threshold),
            high_load_threshold: self.high_load_threshold.unwrap_or(d.high_load_threshold),
            health_min_requests: self.health_min_requests.unwrap_or(d.health_min_requests),
            health_half_open_duration_secs: self
                .health_half_open_duration_secs
                .unwrap_or(d.health_half_open_duration_secs),
            health_half_open_success: self
                .health_half_open_success
                .unwrap_or(d.health_half_open_success),
            health_half_open_failure: self
                .health_half_open_failure
                .unwrap_or(d.health_half_open_failure),
            health_recovery_backoff_initial_secs: self
                .health_recovery_backoff_initial_secs
                .unwrap_or(d.health_recovery_backoff_initial_secs),
            health_success_increment: self
                .health_success_increment
                .unwrap_or(d.health_success_increment),
            health_failure_decrement: self
                .health_failure_decrement
                .unwrap_or(d.health_failure_decrement),
            health_probe_recovery_score: self
                .health_probe_recovery_score
                .unwrap_or(d.health_probe_recovery_score),
            adaptive_mult_decrease: self
                .adaptive_mult_decrease
                .unwrap_or(d.adaptive_mult_decrease),
            adaptive_add_increase: self
                .adaptive_add_increase
                .unwrap_or(d.adaptive_add_increase),
            adaptive_success_steps_before_increase: self
                .adaptive_success_steps_before_increase
                .unwrap_or(d.adaptive_success_steps_before_increase),
            adaptive_hard_cap: self.adaptive_hard_cap.unwrap_or(d.adaptive_hard_cap),
            adaptive_hard_cap_cold_start: self
                .adaptive_hard_cap_cold_start
                .unwrap_or(d.adaptive_hard_cap_cold_start),
            cache_affinity_default_ttl_secs: self
                .cache_affinity_default_ttl_secs
                .unwrap_or(d.cache_affinity_default_ttl_secs),
            cache_affinity_l1_max_size: self
                .cache_affinity_l1_max_size
                .unwrap_or(d.cache_affinity_l1_max_size),
        }
    }
}

impl From<OrchestratorConfig> for OrchestratorConfigPatch {
    fn from(value: OrchestratorConfig) -> Self {
        Self {
            probe_phase_requests: Some(value.probe_phase_requests),
            probe_reservation: Some(value.probe_reservation),
            stable_min_reservation: Some(value.stable_min_reservation),
            stable_max_reservation: Some(value.stable_max_reservation),
            success_count_for_full_confidence: Some(value.success_count_for_full_confidence),
            cooldown_hours_for_full_confidence: Some(value.cooldown_hours_for_full_confidence),
            low_load_threshold: Some(value.low_load_threshold),
            high_load_threshold: Some(value.high_load_threshold),
            health_min_requests: Some(value.health_min_requests),
            health_half_open_duration_secs: Some(value.health_half_open_duration_secs),
            health_half_open_success: Some(value.health_half_open_success),
            health_half_open_failure: Some(value.health_half_open_failure),
            health_recovery_backoff_initial_secs: Some(value.health_recovery_backoff_initial_secs),
            health_success_increment: Some(value.health_success_increment),
            health_failure_decrement: Some(value.health_failure_decrement),
            health_probe_recovery_score: Some(value.health_probe_recovery_score),
            adaptive_mult_decrease: Some(value.adaptive_mult_decrease),
            adaptive_add_increase: Some(value.adaptive_add_increase),
            adaptive_success_steps_before_increase: Some(
                value.adaptive_success_steps_before_increase,
            ),
            adaptive_hard_cap: Some(value.adaptive_hard_cap),
            adaptive_hard_cap_cold_start: Some(value.adaptive_hard_cap_cold_start),
            cache_affinity_default_ttl_secs: Some(value.cache_affinity_default_ttl_secs),
            cache_affinity_l1_max_size: Some(value.cache_affinity_l1_max_size),
        }
    }
}
