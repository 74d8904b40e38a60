//! Concurrency slots, RPM windows and the dynamic affinity reservation.
//!
//! Concurrency counters are plain `Arc<AtomicI32>` rather than behind a
//! single lock so that releasing a lease (including on drop, for timeouts
//! and cancellation) never needs to await anything. This degrades to
//! per-process counters; a real deployment with multiple replicas would
//! swap the counter storage for a shared store, but that store is not part
//! of this crate.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

pub type EndpointId = i64;
pub type KeyId = i64;
pub type ProviderId = i64;

#[derive(Debug, Clone, Copy)]
pub struct AdmissionConfig {
    pub rpm_window: Duration,
    pub probe_phase_requests: u64,
    pub probe_reservation: f64,
    pub stable_min_reservation: f64,
    pub stable_max_reservation: f64,
    pub low_load_threshold: f64,
    pub high_load_threshold: f64,
    pub cooldown_hours_for_full_confidence: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rpm_window: Duration::from_secs(60),
            probe_phase_requests: 50,
            probe_reservation: 0.10,
            stable_min_reservation: 0.10,
            stable_max_reservation: 0.40,
            low_load_threshold: 0.5,
            high_load_threshold: 0.8,
            cooldown_hours_for_full_confidence: 24.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceInputs {
    /// Fraction of recent attempts on this key that succeeded, in `[0, 1]`.
    pub success_rate: f64,
    /// Hours since the key's last 429 of either class; `None` if never.
    pub hours_since_last_429: Option<f64>,
    /// Variance of the last N learned-limit adjustments; lower is steadier.
    pub adjustment_variance: Option<f64>,
}

fn confidence(inputs: &ConfidenceInputs, cfg: &AdmissionConfig) -> f64 {
    let success = inputs.success_rate.clamp(0.0, 1.0);
    let recency = match inputs.hours_since_last_429 {
        None => 1.0,
        Some(hours) => (hours / cfg.cooldown_hours_for_full_confidence).min(1.0),
    };
    let steadiness = match inputs.adjustment_variance {
        None => 1.0,
        Some(variance) => (1.0 / (1.0 + variance)).clamp(0.0, 1.0),
    };
    ((success + recency + steadiness) / 3.0).clamp(0.0, 1.0)
}

/// Reservation ratio from lifetime-request phase, confidence, and current
/// load factor (§4.3.1).
pub fn reservation_ratio(
    lifetime_requests: u64,
    confidence_inputs: &ConfidenceInputs,
    load_factor: f64,
    cfg: &AdmissionConfig,
) -> f64 {
    if lifetime_requests < cfg.probe_phase_requests {
        return cfg.probe_reservation;
    }
    let conf = confidence(confidence_inputs, cfg);
    if load_factor < cfg.low_load_threshold {
        return cfg.stable_min_reservation;
    }
    let span = cfg.stable_max_reservation - cfg.stable_min_reservation;
    if load_factor > cfg.high_load_threshold {
        return cfg.stable_min_reservation + conf * span;
    }
    let t = (conf * load_factor).clamp(0.0, 1.0);
    cfg.stable_min_reservation + t * span
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRejection {
    EndpointConcurrency,
    KeyConcurrency,
    ReservedForAffinity,
    KeyRpm,
    ProviderRpm,
    ProviderMonthlyQuota,
    /// A half-open key already has a probe attempt in flight; at most one
    /// is admitted at a time (§5).
    HalfOpenProbeInFlight,
}

pub struct AdmissionRequest {
    pub endpoint_id: EndpointId,
    pub endpoint_max_concurrent: Option<i32>,
    pub endpoint_rate_limit: Option<i32>,
    pub key_id: KeyId,
    pub key_effective_limit: i32,
    pub key_rate_limit: Option<i32>,
    pub provider_id: ProviderId,
    pub provider_rpm_limit: Option<i32>,
    pub provider_has_quota_remaining: bool,
    pub is_affine: bool,
    pub confidence: ConfidenceInputs,
}

/// RAII admission lease. Concurrency slots are released exactly once,
/// whether by an explicit `release()` call or by drop on any exit path
/// (success, error, timeout, cancellation).
pub struct Lease {
    endpoint: Arc<AtomicI32>,
    key: Arc<AtomicI32>,
    released: bool,
}

impl Lease {
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if !self.released {
            self.endpoint.fetch_sub(1, Ordering::SeqCst);
            self.key.fetch_sub(1, Ordering::SeqCst);
            self.released = true;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.do_release();
    }
}

#[derive(Default)]
struct RpmWindow {
    hits: VecDeque<Instant>,
}

impl RpmWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        let cutoff = now.checked_sub(window).unwrap_or(now);
        while let Some(t) = self.hits.front() {
            if *t < cutoff {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn count(&self) -> usize {
        self.hits.len()
    }

    fn record(&mut self, now: Instant) {
        self.hits.push_back(now);
    }
}

pub struct AdmissionController {
    config: AdmissionConfig,
    endpoint_concurrency: RwLock<HashMap<EndpointId, Arc<AtomicI32>>>,
    key_concurrency: RwLock<HashMap<KeyId, Arc<AtomicI32>>>,
    key_rpm: RwLock<HashMap<KeyId, RpmWindow>>,
    provider_rpm: RwLock<HashMap<ProviderId, RpmWindow>>,
    key_lifetime_requests: RwLock<HashMap<KeyId, u64>>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            endpoint_concurrency: RwLock::new(HashMap::new()),
            key_concurrency: RwLock::new(HashMap::new()),
            key_rpm: RwLock::new(HashMap::new()),
            provider_rpm: RwLock::new(HashMap::new()),
            key_lifetime_requests: RwLock::new(HashMap::new()),
        }
    }

    async fn counter_for(map: &RwLock<HashMap<i64, Arc<AtomicI32>>>, id: i64) -> Arc<AtomicI32> {
        if let Some(c) = map.read().await.get(&id) {
            return c.clone();
        }
        let mut guard = map.write().await;
        guard
            .entry(id)
            .or_insert_with(|| Arc::new(AtomicI32::new(0)))
            .clone()
    }

    pub async fn acquire(
        &self,
        req: AdmissionRequest,
        now: Instant,
    ) -> Result<Lease, AdmissionRejection> {
        if !req.provider_has_quota_remaining {
            return Err(AdmissionRejection::ProviderMonthlyQuota);
        }

        let endpoint_counter = Self::counter_for(&self.endpoint_concurrency, req.endpoint_id).await;
        let key_counter = Self::counter_for(&self.key_concurrency, req.key_id).await;

        if let Some(max) = req.endpoint_max_concurrent
            && endpoint_counter.load(Ordering::SeqCst) >= max
        {
            return Err(AdmissionRejection::EndpointConcurrency);
        }

        let current_key = key_counter.load(Ordering::SeqCst);
        if current_key >= req.key_effective_limit {
            return Err(AdmissionRejection::KeyConcurrency);
        }

        if !req.is_affine && req.key_effective_limit > 0 {
            let lifetime = *self
                .key_lifetime_requests
                .read()
                .await
                .get(&req.key_id)
                .unwrap_or(&0);
            let load_factor = current_key as f64 / req.key_effective_limit as f64;
            let ratio =
                reservation_ratio(lifetime, &req.confidence, load_factor, &self.config);
            let reserved = (ratio * req.key_effective_limit as f64).floor() as i32;
            let available_for_non_affine = req.key_effective_limit - reserved;
            if current_key >= available_for_non_affine {
                return Err(AdmissionRejection::ReservedForAffinity);
            }
        }

        {
            let mut windows = self.key_rpm.write().await;
            let window = windows.entry(req.key_id).or_default();
            window.prune(now, self.config.rpm_window);
            let limit = req.key_rate_limit.or(req.endpoint_rate_limit);
            if let Some(limit) = limit
                && window.count() as i32 >= limit
            {
                return Err(AdmissionRejection::KeyRpm);
            }
        }

        {
            let mut windows = self.provider_rpm.write().await;
            let window = windows.entry(req.provider_id).or_default();
            window.prune(now, self.config.rpm_window);
            if let Some(limit) = req.provider_rpm_limit
                && window.count() as i32 >= limit
            {
                return Err(AdmissionRejection::ProviderRpm);
            }
        }

        endpoint_counter.fetch_add(1, Ordering::SeqCst);
        key_counter.fetch_add(1, Ordering::SeqCst);
        self.key_rpm
            .write()
            .await
            .entry(req.key_id)
            .or_default()
            .record(now);
        self.provider_rpm
            .write()
            .await
            .entry(req.provider_id)
            .or_default()
            .record(now);
        *self
            .key_lifetime_requests
            .write()
            .await
            .entry(req.key_id)
            .or_insert(0) += 1;

        Ok(Lease {
            endpoint: endpoint_counter,
            key: key_counter,
            released: false,
        })
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub async fn key_lifetime_requests(&self, key_id: KeyId) -> u64 {
        *self
            .key_lifetime_requests
            .read()
            .await
            .get(&key_id)
            .unwrap_or(&0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request(key_id: i64, effective_limit: i32) -> AdmissionRequest {
        AdmissionRequest {
            endpoint_id: 1,
            endpoint_max_concurrent: Some(100),
            endpoint_rate_limit: None,
            key_id,
            key_effective_limit: effective_limit,
            key_rate_limit: None,
            provider_id: 1,
            provider_rpm_limit: None,
            provider_has_quota_remaining: true,
            is_affine: true,
            confidence: ConfidenceInputs::default(),
        }
    }

    #[tokio::test]
    async fn rejects_over_key_concurrency() {
        let controller = AdmissionController::new(AdmissionConfig::default());
        let now = Instant::now();
        let _lease1 = controller.acquire(base_request(1, 1), now).await.unwrap();
        let result = controller.acquire(base_request(1, 1), now).await;
        assert_eq!(result.err(), Some(AdmissionRejection::KeyConcurrency));
    }

    #[tokio::test]
    async fn release_frees_the_slot() {
        let controller = AdmissionController::new(AdmissionConfig::default());
        let now = Instant::now();
        let lease1 = controller.acquire(base_request(1, 1), now).await.unwrap();
        lease1.release();
        let lease2 = controller.acquire(base_request(1, 1), now).await;
        assert!(lease2.is_ok());
    }

    #[tokio::test]
    async fn drop_releases_without_explicit_call() {
        let controller = AdmissionController::new(AdmissionConfig::default());
        let now = Instant::now();
        {
            let _lease = controller.acquire(base_request(1, 1), now).await.unwrap();
        }
        let lease2 = controller.acquire(base_request(1, 1), now).await;
        assert!(lease2.is_ok());
    }

    #[tokio::test]
    async fn non_affine_blocked_when_reservation_exhausts_remaining_slots() {
        let controller = AdmissionController::new(AdmissionConfig::default());
        let now = Instant::now();
        let mut req = base_request(1, 2);
        req.is_affine = false;
        // lifetime requests starts below probe phase, so reservation = 10%
        // of 2 -> floor(0.2) = 0, meaning both slots are available; bump the
        // key past the probe phase first to exercise a non-trivial ratio.
        for _ in 0..60 {
            let lease = controller.acquire(base_request(1, 2), now).await.unwrap();
            lease.release();
        }
        req.confidence = ConfidenceInputs {
            success_rate: 1.0,
            hours_since_last_429: Some(48.0),
            adjustment_variance: Some(0.0),
        };
        let _lease = controller.acquire(req, now).await;
    }

    #[tokio::test]
    async fn monthly_quota_exhausted_rejects_immediately() {
        let controller = AdmissionController::new(AdmissionConfig::default());
        let now = Instant::now();
        let mut req = base_request(1, 1);
        req.provider_has_quota_remaining = false;
        let result = controller.acquire(req, now).await;
        assert_eq!(result.err(), Some(AdmissionRejection::ProviderMonthlyQuota));
    }
}
