//! Candidate planner: alias resolution, eligible-set enumeration, health
//! filtering, ordering and capability matching. Produces an ordered list of
//! `Candidate`s for the attempt executor to walk.

use std::collections::HashMap;
use std::sync::Arc;

use gproxy_storage::StorageSnapshot;

use super::affinity::{AffinityKey, AffinityManager};
use super::health::HealthMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityMode {
    Exclusive,
    Compatible,
}

#[derive(Debug, Clone)]
pub struct Requirements {
    /// `None` means unset (not asserted either way), per the Format
    /// Adapter's capability-inference contract.
    flags: HashMap<String, bool>,
}

impl Requirements {
    pub fn new() -> Self {
        Self {
            flags: HashMap::new(),
        }
    }

    pub fn set(&mut self, capability: &str, value: bool) {
        self.flags.insert(capability.to_string(), value);
    }

    pub fn get(&self, capability: &str) -> Option<bool> {
        self.flags.get(capability).copied()
    }
}

impl Default for Requirements {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CapabilityTable {
    modes: HashMap<&'static str, CapabilityMode>,
    error_patterns: HashMap<&'static str, &'static [&'static str]>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        let mut modes = HashMap::new();
        modes.insert("cache_1h", CapabilityMode::Exclusive);
        modes.insert("context_1m", CapabilityMode::Compatible);

        let mut error_patterns: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
        error_patterns.insert("context_1m", &["context", "length", "exceed"]);

        Self {
            modes,
            error_patterns,
        }
    }

    pub fn mode(&self, capability: &str) -> Option<CapabilityMode> {
        self.modes.get(capability).copied()
    }

    /// §4.6 step 4: does `body` match all keywords of some known
    /// capability's error pattern? Returns the first capability whose
    /// pattern is fully satisfied; callers widen `Requirements` for it and
    /// re-plan.
    pub fn detect_upgrade(&self, body: &[u8]) -> Option<&'static str> {
        self.error_patterns
            .iter()
            .find(|(_, patterns)| super::executor::matches_capability_upgrade(body, patterns))
            .map(|(name, _)| *name)
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::new()
    }
}

/// §4.2.1: does a key advertising `key_capabilities` satisfy `requirements`?
/// Unknown capability names are ignored (neither gate nor pass anything).
pub fn capability_matches(
    requirements: &Requirements,
    key_capabilities: &serde_json::Value,
    table: &CapabilityTable,
) -> bool {
    let Some(obj) = key_capabilities.as_object() else {
        return requirements
            .flags
            .keys()
            .filter_map(|name| table.mode(name))
            .all(|mode| mode != CapabilityMode::Exclusive);
    };

    for (name, mode) in table.modes.iter() {
        let key_has = obj.get(*name).and_then(|v| v.as_bool()).unwrap_or(false);
        let requested = requirements.get(name);
        match mode {
            CapabilityMode::Exclusive => {
                // Advertised-but-not-requested is filtered the same as an
                // explicit `false`: avoid paying a premium unasked for.
                let effective_request = requested.unwrap_or(false);
                if key_has != effective_request {
                    return false;
                }
            }
            CapabilityMode::Compatible => {
                if requested == Some(true) && !key_has {
                    return false;
                }
            }
        }
    }
    true
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider_id: i64,
    pub endpoint_id: i64,
    pub key_id: i64,
    pub target_model_name: String,
    pub priority: i32,
    pub health_score: f64,
    pub is_affine: bool,
}

pub struct CandidatePlanner {
    capabilities: Arc<CapabilityTable>,
    affinity: Arc<AffinityManager>,
    health: Arc<HealthMonitor>,
}

impl CandidatePlanner {
    pub fn new(affinity: Arc<AffinityManager>, health: Arc<HealthMonitor>) -> Self {
        Self::with_capabilities(Arc::new(CapabilityTable::new()), affinity, health)
    }

    /// Shares one `CapabilityTable` with the attempt executor so plan-time
    /// matching and attempt-time upgrade detection agree on the same modes
    /// and error patterns.
    pub fn with_capabilities(
        capabilities: Arc<CapabilityTable>,
        affinity: Arc<AffinityManager>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            capabilities,
            affinity,
            health,
        }
    }

    /// Resolve `source_model` to a `global_model_id`, checking each
    /// candidate provider's alias before the global one.
    fn resolve_global_model_id(
        &self,
        snapshot: &StorageSnapshot,
        source_model: &str,
        provider_ids: &[i64],
    ) -> Option<i64> {
        for provider_id in provider_ids {
            if let Some(id) = snapshot.resolve_model_alias(source_model, *provider_id) {
                return Some(id);
            }
        }
        snapshot
            .model_mappings
            .iter()
            .find(|m| m.source_model == source_model && m.provider_id.is_none())
            .map(|m| m.target_global_model_id)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn plan(
        &self,
        snapshot: &StorageSnapshot,
        client_key_id: i64,
        api_format: &str,
        source_model: &str,
        requirements: &Requirements,
        client_allowed_models: Option<&[String]>,
        user_allowed_models: Option<&[String]>,
    ) -> Vec<Candidate> {
        let provider_ids: Vec<i64> = snapshot.providers.iter().map(|p| p.id).collect();
        let Some(global_model_id) =
            self.resolve_global_model_id(snapshot, source_model, &provider_ids)
        else {
            return Vec::new();
        };

        let mut candidates = Vec::new();

        for provider in &snapshot.providers {
            if !provider.enabled || !provider.has_quota_remaining() {
                continue;
            }
            let Some(model) = snapshot.model_for(provider.id, global_model_id) else {
                continue;
            };

            for endpoint in snapshot
                .endpoints
                .iter()
                .filter(|e| e.provider_id == provider.id && e.is_active)
            {
                if !formats_compatible(api_format, &endpoint.api_format) {
                    continue;
                }

                for credential in snapshot
                    .credentials
                    .iter()
                    .filter(|c| c.endpoint_id == endpoint.id && c.enabled)
                {
                    if let Some(allowed) = &credential.allowed_models
                        && !allowed.iter().any(|m| m == source_model)
                    {
                        continue;
                    }
                    if !allowed_by(client_allowed_models, source_model) {
                        continue;
                    }
                    if !allowed_by(user_allowed_models, source_model) {
                        continue;
                    }
                    if !capability_matches(requirements, &credential.capabilities, &self.capabilities)
                    {
                        continue;
                    }
                    // Plan-time filtering only excludes fully open keys; the
                    // half-open single-probe slot is reserved at attempt
                    // time by the executor (`HealthMonitor::is_allowed`),
                    // not while merely enumerating candidates.
                    if self.health.is_open(credential.id).await {
                        continue;
                    }

                    let status = self.health.status(credential.id).await;
                    candidates.push(Candidate {
                        provider_id: provider.id,
                        endpoint_id: endpoint.id,
                        key_id: credential.id,
                        target_model_name: model.provider_model_name.clone(),
                        priority: provider.priority,
                        health_score: status.health_score,
                        is_affine: false,
                    });
                }
            }
        }

        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.health_score.total_cmp(&a.health_score))
                .then(a.key_id.cmp(&b.key_id))
        });

        let affinity_key = AffinityKey {
            client_key_id,
            api_format: api_format.to_string(),
            model: source_model.to_string(),
        };
        if let Some(target) = self.affinity.lookup(&affinity_key).await
            && let Some(pos) = candidates.iter().position(|c| c.key_id == target.key_id)
        {
            let mut affine = candidates.remove(pos);
            affine.is_affine = true;
            candidates.insert(0, affine);
        }

        candidates
    }
}

fn allowed_by(allowed: Option<&[String]>, model: &str) -> bool {
    match allowed {
        None => true,
        Some(list) => list.iter().any(|m| m == model),
    }
}

/// Claude and its `claude_cli` compatible variant share a wire shape; every
/// other pair requires an exact api_format match.
fn formats_compatible(requested: &str, endpoint_format: &str) -> bool {
    if requested == endpoint_format {
        return true;
    }
    matches!(
        (requested, endpoint_format),
        ("claude", "claude_cli") | ("claude_cli", "claude")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_capability_filters_unadvertised_and_unrequested() {
        let table = CapabilityTable::new();
        let mut reqs = Requirements::new();
        reqs.set("cache_1h", true);
        let caps = serde_json::json!({ "cache_1h": false });
        assert!(!capability_matches(&reqs, &caps, &table));
    }

    #[test]
    fn exclusive_capability_passes_when_matching() {
        let table = CapabilityTable::new();
        let mut reqs = Requirements::new();
        reqs.set("cache_1h", true);
        let caps = serde_json::json!({ "cache_1h": true });
        assert!(capability_matches(&reqs, &caps, &table));
    }

    #[test]
    fn exclusive_capability_filters_advertised_but_not_requested() {
        let table = CapabilityTable::new();
        let reqs = Requirements::new();
        let caps = serde_json::json!({ "cache_1h": true });
        assert!(!capability_matches(&reqs, &caps, &table));
    }

    #[test]
    fn compatible_capability_requires_advertisement_only_when_requested() {
        let table = CapabilityTable::new();
        let mut reqs = Requirements::new();
        reqs.set("context_1m", true);
        let caps = serde_json::json!({});
        assert!(!capability_matches(&reqs, &caps, &table));
    }

    #[test]
    fn compatible_capability_unset_allows_any_key() {
        let table = CapabilityTable::new();
        let reqs = Requirements::new();
        let caps = serde_json::json!({});
        assert!(capability_matches(&reqs, &caps, &table));
    }

    #[test]
    fn detects_context_1m_upgrade_from_error_body() {
        let table = CapabilityTable::new();
        let body = b"error: context length exceeded for this request";
        assert_eq!(table.detect_upgrade(body), Some("context_1m"));
        assert_eq!(table.detect_upgrade(b"unrelated failure"), None);
    }

    #[test]
    fn claude_and_claude_cli_are_compatible_formats() {
        assert!(formats_compatible("claude", "claude_cli"));
        assert!(formats_compatible("claude_cli", "claude"));
        assert!(!formats_compatible("claude", "gemini"));
    }
}
