//! Attempt executor and the outer fallback loop. One `Attempt` is one
//! upstream call against one candidate; the loop walks the candidate list
//! produced by `orchestrator::planner` until it finds a non-retriable
//! outcome or runs out of candidates.
//!
//! Building the outbound request and performing the HTTP call stay on the
//! existing `UpstreamProvider`/`UpstreamClient` plumbing; this module adds
//! the outcome taxonomy, the retry/fallback decision and the admission and
//! health bookkeeping around each attempt.

use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use bytes::Bytes;

use gproxy_provider_core::provider::{UpstreamFailure, UpstreamHttpResponse};

use super::adaptive::AdaptiveLearner;
use super::admission::{AdmissionController, AdmissionRejection, AdmissionRequest};
use super::health::HealthMonitor;
use super::planner::{Candidate, CapabilityTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    ClientErrorTerminal,
    AuthError,
    RateLimitConcurrent,
    RateLimitRpm,
    RateLimitGeneric,
    Timeout,
    NetworkError,
    /// Carries the capability whose error pattern matched (e.g.
    /// `"context_1m"`), so the fallback loop knows which `Requirements`
    /// flag to widen before re-planning.
    CapabilityUpgrade(&'static str),
    EmptyStream,
    EmbeddedError,
}

impl Outcome {
    /// Whether the fallback loop should try the next candidate. Only
    /// `ClientErrorTerminal` breaks the loop immediately; `Success` ends it
    /// because there is nothing left to retry.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Outcome::Success | Outcome::ClientErrorTerminal)
    }
}

const CONCURRENT_429_KEYWORDS: &[&str] = &["max concurrent", "too many concurrent", "concurrency limit"];
const RPM_429_KEYWORDS: &[&str] = &["requests per minute", "rate limit", "rpm"];

/// Classify a raw upstream response/failure into the §4.6 outcome taxonomy.
/// `embedded_error` lets a protocol-specific hook (Gemini's 200-with-body-
/// error shape) report a success-looking response as actually an error.
pub fn classify_response(
    status: u16,
    body: &[u8],
    embedded_error: bool,
    byte_count: usize,
    capabilities: &CapabilityTable,
) -> Outcome {
    if (200..300).contains(&status) {
        if embedded_error {
            if let Some(capability) = capabilities.detect_upgrade(body) {
                return Outcome::CapabilityUpgrade(capability);
            }
            return Outcome::EmbeddedError;
        }
        if byte_count == 0 {
            return Outcome::EmptyStream;
        }
        return Outcome::Success;
    }
    if status == 401 || status == 403 {
        return Outcome::AuthError;
    }
    if status == 429 {
        let text = String::from_utf8_lossy(body).to_ascii_lowercase();
        if CONCURRENT_429_KEYWORDS.iter().any(|kw| text.contains(kw)) {
            return Outcome::RateLimitConcurrent;
        }
        if RPM_429_KEYWORDS.iter().any(|kw| text.contains(kw)) {
            return Outcome::RateLimitRpm;
        }
        return Outcome::RateLimitGeneric;
    }
    if let Some(capability) = capabilities.detect_upgrade(body) {
        return Outcome::CapabilityUpgrade(capability);
    }
    if (400..500).contains(&status) {
        return Outcome::ClientErrorTerminal;
    }
    Outcome::NetworkError
}

/// Capability-upgrade detection: does the error body mention every keyword
/// of a known capability's error pattern? (e.g. `context_1m` matching
/// `{context, token, length, exceed}`).
pub fn matches_capability_upgrade(body: &[u8], error_patterns: &[&str]) -> bool {
    let text = String::from_utf8_lossy(body).to_ascii_lowercase();
    !error_patterns.is_empty() && error_patterns.iter().all(|kw| text.contains(&kw.to_ascii_lowercase()))
}

pub fn classify_failure(failure: &UpstreamFailure, capabilities: &CapabilityTable) -> Outcome {
    match failure {
        UpstreamFailure::Transport { .. } => Outcome::NetworkError,
        UpstreamFailure::Http { status, body, .. } => {
            classify_response(*status, body, false, body.len(), capabilities)
        }
    }
}

pub struct AttemptRecord {
    pub candidate: Candidate,
    pub outcome: Outcome,
    pub latency: Duration,
}

pub struct AttemptExecutor {
    admission: Arc<AdmissionController>,
    health: Arc<HealthMonitor>,
    adaptive: Arc<AdaptiveLearner>,
    capabilities: Arc<CapabilityTable>,
}

impl AttemptExecutor {
    pub fn new(
        admission: Arc<AdmissionController>,
        health: Arc<HealthMonitor>,
        adaptive: Arc<AdaptiveLearner>,
        capabilities: Arc<CapabilityTable>,
    ) -> Self {
        Self {
            admission,
            health,
            adaptive,
            capabilities,
        }
    }

    /// Run one attempt against `candidate`, handing the built response/
    /// failure off to `send`. Reserves the key's half-open probe slot (if
    /// applicable), acquires and releases the admission lease around the
    /// call, and feeds the health monitor and adaptive learner with the
    /// outcome.
    pub async fn run_attempt<F, Fut>(
        &self,
        candidate: &Candidate,
        admission_req: AdmissionRequest,
        cold_start: bool,
        send: F,
    ) -> Result<AttemptRecord, AdmissionRejection>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>>,
    {
        let Some(_probe) = self.health.is_allowed(candidate.key_id).await else {
            return Err(AdmissionRejection::HalfOpenProbeInFlight);
        };

        let lease = self
            .admission
            .acquire(admission_req, tokio::time::Instant::now())
            .await?;

        let started = StdInstant::now();
        let result = send().await;
        let latency = started.elapsed();

        let outcome = match &result {
            Ok(response) => {
                let body_len = response_byte_hint(response);
                let body = response_byte_slice(response);
                classify_response(response.status, body, false, body_len, &self.capabilities)
            }
            Err(failure) => classify_failure(failure, &self.capabilities),
        };

        self.record_outcome(candidate.key_id, outcome).await;
        lease.release();

        Ok(AttemptRecord {
            candidate: candidate.clone(),
            outcome,
            latency,
        })
    }

    async fn record_outcome(&self, key_id: i64, outcome: Outcome) {
        match outcome {
            Outcome::Success => {
                self.health.record_success(key_id).await;
                self.adaptive.record_success_at_ceiling(key_id, false).await;
            }
            Outcome::RateLimitConcurrent => {
                self.health.record_failure(key_id).await;
                let current = self.adaptive.effective_limit(key_id).await;
                self.adaptive.record_concurrent_429(key_id, current).await;
            }
            Outcome::RateLimitRpm => {
                self.health.record_failure(key_id).await;
                self.adaptive.record_rpm_429(key_id).await;
            }
            Outcome::ClientErrorTerminal | Outcome::CapabilityUpgrade(_) => {
                // User/model-shape caused; does not count against the upstream key's health.
            }
            _ => {
                self.health.record_failure(key_id).await;
            }
        }
    }

    /// Outer fallback loop: walk `candidates`, running `attempt` on each
    /// until a non-retriable outcome lands or the list is exhausted. Stops
    /// (rather than trying the next candidate) on `CapabilityUpgrade` too:
    /// the caller owns re-planning with the widened `Requirements` and
    /// calling back in with a freshly filtered candidate list (§4.6 step 4).
    /// Takes `admission_req_for`/`attempt` by reference so a caller driving
    /// the capability-upgrade retry loop can call this more than once.
    pub async fn run_with_fallback<F, Fut>(
        &self,
        candidates: &[Candidate],
        admission_req_for: &(impl Fn(&Candidate) -> AdmissionRequest + ?Sized),
        attempt: &mut F,
    ) -> Option<AttemptRecord>
    where
        F: FnMut(&Candidate) -> Fut,
        Fut: std::future::Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>>,
    {
        let mut last: Option<AttemptRecord> = None;
        for candidate in candidates {
            let req = admission_req_for(candidate);
            let record = match self
                .run_attempt(candidate, req, false, || attempt(candidate))
                .await
            {
                Ok(record) => record,
                Err(_rejection) => continue,
            };
            let retriable = record.outcome.is_retriable();
            let terminal = record.outcome;
            last = Some(record);
            if !retriable
                || terminal == Outcome::ClientErrorTerminal
                || matches!(terminal, Outcome::CapabilityUpgrade(_))
            {
                break;
            }
        }
        last
    }
}

fn response_byte_hint(response: &UpstreamHttpResponse) -> usize {
    match &response.body {
        gproxy_provider_core::provider::UpstreamBody::Bytes(b) => b.len(),
        // Streams are consumed by the caller; presence of a receiver alone
        // is treated as non-empty since the empty-stream check happens once
        // the caller observes zero bytes before EOF.
        gproxy_provider_core::provider::UpstreamBody::Stream(_) => 1,
    }
}

/// Buffered bodies are available for pattern matching; streamed ones are
/// not sniffed here (a protocol-specific hook inspects those as they
/// decode and reports `embedded_error` itself).
fn response_byte_slice(response: &UpstreamHttpResponse) -> &[u8] {
    match &response.body {
        gproxy_provider_core::provider::UpstreamBody::Bytes(b) => b.as_ref(),
        gproxy_provider_core::provider::UpstreamBody::Stream(_) => &[],
    }
}

#[allow(dead_code)]
fn empty_bytes() -> Bytes {
    Bytes::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_success() {
        let caps = CapabilityTable::new();
        assert_eq!(classify_response(200, b"{}", false, 2, &caps), Outcome::Success);
    }

    #[test]
    fn classifies_embedded_error_on_200() {
        let caps = CapabilityTable::new();
        assert_eq!(
            classify_response(200, br#"{"error":{"code":400}}"#, true, 10, &caps),
            Outcome::EmbeddedError
        );
    }

    #[test]
    fn embedded_error_on_200_detects_capability_upgrade() {
        let caps = CapabilityTable::new();
        let body = br#"{"error":"context length exceeded"}"#;
        assert_eq!(
            classify_response(200, body, true, body.len(), &caps),
            Outcome::CapabilityUpgrade("context_1m")
        );
    }

    #[test]
    fn classifies_empty_stream() {
        let caps = CapabilityTable::new();
        assert_eq!(classify_response(200, b"", false, 0, &caps), Outcome::EmptyStream);
    }

    #[test]
    fn classifies_concurrent_429() {
        let caps = CapabilityTable::new();
        let body = b"error: too many concurrent requests";
        assert_eq!(
            classify_response(429, body, false, body.len(), &caps),
            Outcome::RateLimitConcurrent
        );
    }

    #[test]
    fn classifies_rpm_429() {
        let caps = CapabilityTable::new();
        let body = b"rate limit exceeded: requests per minute";
        assert_eq!(classify_response(429, body, false, body.len(), &caps), Outcome::RateLimitRpm);
    }

    #[test]
    fn classifies_generic_429() {
        let caps = CapabilityTable::new();
        let body = b"too many requests";
        assert_eq!(classify_response(429, body, false, body.len(), &caps), Outcome::RateLimitGeneric);
    }

    #[test]
    fn classifies_auth_error() {
        let caps = CapabilityTable::new();
        assert_eq!(classify_response(401, b"", false, 0, &caps), Outcome::AuthError);
    }

    #[test]
    fn classifies_client_error_terminal() {
        let caps = CapabilityTable::new();
        assert_eq!(
            classify_response(400, b"bad request", false, 11, &caps),
            Outcome::ClientErrorTerminal
        );
    }

    #[test]
    fn classifies_capability_upgrade_on_4xx_body() {
        let caps = CapabilityTable::new();
        let body = b"400 error: context length exceeded for this model";
        assert_eq!(
            classify_response(400, body, false, body.len(), &caps),
            Outcome::CapabilityUpgrade("context_1m")
        );
    }

    #[test]
    fn classifies_network_error_on_5xx() {
        let caps = CapabilityTable::new();
        assert_eq!(classify_response(500, b"", false, 0, &caps), Outcome::NetworkError);
    }

    #[test]
    fn capability_upgrade_requires_all_keywords() {
        let body = b"error: context length exceeded for this request";
        assert!(matches_capability_upgrade(
            body,
            &["context", "length", "exceed"]
        ));
        assert!(!matches_capability_upgrade(body, &["context", "token"]));
    }

    #[test]
    fn client_error_terminal_breaks_fallback_not_retriable() {
        assert!(!Outcome::ClientErrorTerminal.is_retriable());
        assert!(Outcome::Timeout.is_retriable());
        assert!(!Outcome::Success.is_retriable());
    }

    fn candidate(key_id: i64) -> Candidate {
        Candidate {
            provider_id: 1,
            endpoint_id: 1,
            key_id,
            target_model_name: "m".to_string(),
            priority: 0,
            health_score: 1.0,
            is_affine: false,
        }
    }

    fn admission_req(candidate: &Candidate) -> AdmissionRequest {
        AdmissionRequest {
            endpoint_id: candidate.endpoint_id,
            endpoint_max_concurrent: Some(100),
            endpoint_rate_limit: None,
            key_id: candidate.key_id,
            key_effective_limit: 100,
            key_rate_limit: None,
            provider_id: candidate.provider_id,
            provider_rpm_limit: None,
            provider_has_quota_remaining: true,
            is_affine: false,
            confidence: super::super::admission::ConfidenceInputs::default(),
        }
    }

    fn executor() -> AttemptExecutor {
        let clock: Arc<dyn super::super::clock::Clock> = Arc::new(super::super::clock::TestClock::new());
        AttemptExecutor::new(
            Arc::new(AdmissionController::new(super::super::admission::AdmissionConfig::default())),
            Arc::new(HealthMonitor::new(super::super::health::HealthConfig::default(), clock.clone())),
            Arc::new(AdaptiveLearner::new(super::super::adaptive::AdaptiveConfig::default(), clock)),
            Arc::new(CapabilityTable::new()),
        )
    }

    #[tokio::test]
    async fn fallback_stops_at_first_capability_upgrade_for_caller_replan() {
        let executor = executor();
        let candidates = vec![candidate(1), candidate(2)];
        let mut calls = 0;
        let record = executor
            .run_with_fallback(&candidates, &admission_req, &mut |_candidate| {
                calls += 1;
                async move {
                    Ok(UpstreamHttpResponse {
                        status: 400,
                        headers: Vec::new(),
                        body: gproxy_provider_core::provider::UpstreamBody::Bytes(Bytes::from_static(
                            b"error: context length exceeded",
                        )),
                    })
                }
            })
            .await
            .expect("first candidate attempted");

        assert_eq!(record.outcome, Outcome::CapabilityUpgrade("context_1m"));
        assert_eq!(calls, 1, "fallback must not walk past the upgrade signal itself");
    }
}
