use gproxy_common::GlobalConfig;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct GlobalConfigRow {
    pub id: i64,
    pub config: GlobalConfig,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ProviderRow {
    pub id: i64,
    pub name: String,
    pub config_json: JsonValue,
    pub enabled: bool,
    pub priority: i32,
    pub billing_type: BillingType,
    pub monthly_quota_usd: Option<f64>,
    pub monthly_used_usd: f64,
    pub quota_reset_day: i32,
    pub quota_last_reset_at: Option<OffsetDateTime>,
    pub rpm_limit: Option<i32>,
    pub rpm_used: i32,
    pub rpm_reset_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingType {
    PayAsYouGo,
    MonthlyQuota,
    FreeTier,
}

impl BillingType {
    pub fn parse(s: &str) -> Self {
        match s {
            "monthly_quota" => BillingType::MonthlyQuota,
            "free_tier" => BillingType::FreeTier,
            _ => BillingType::PayAsYouGo,
        }
    }
}

impl ProviderRow {
    /// spec.md §3: `monthly_used_usd <= monthly_quota_usd` gates further dispatch.
    pub fn has_quota_remaining(&self) -> bool {
        match (self.billing_type, self.monthly_quota_usd) {
            (BillingType::MonthlyQuota, Some(quota)) => self.monthly_used_usd < quota,
            _ => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointRow {
    pub id: i64,
    pub provider_id: i64,
    pub api_format: String,
    pub base_url: String,
    pub is_active: bool,
    pub max_concurrent: Option<i32>,
    pub rate_limit: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub id: i64,
    pub provider_id: i64,
    pub endpoint_id: i64,
    pub name: Option<String>,
    pub settings_json: JsonValue,
    pub secret_json: JsonValue,
    pub enabled: bool,
    pub max_concurrent: Option<i32>,
    pub learned_max_concurrent: Option<i32>,
    pub rate_multiplier: f64,
    pub allowed_models: Option<Vec<String>>,
    pub capabilities: JsonValue,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct GlobalModelRow {
    pub id: i64,
    pub name: String,
    pub supported_capabilities: JsonValue,
    pub default_input_price: f64,
    pub default_output_price: f64,
    pub default_cache_creation_price: f64,
    pub default_cache_read_price: f64,
}

#[derive(Debug, Clone)]
pub struct PriceTier {
    pub up_to: Option<i64>,
    pub input_price: f64,
    pub output_price: f64,
    pub cache_creation_price: f64,
    pub cache_read_price: f64,
}

#[derive(Debug, Clone)]
pub struct ModelRow {
    pub id: i64,
    pub provider_id: i64,
    pub global_model_id: i64,
    pub provider_model_name: String,
    pub is_active: bool,
    pub override_input_price: Option<f64>,
    pub override_output_price: Option<f64>,
    pub override_cache_creation_price: Option<f64>,
    pub override_cache_read_price: Option<f64>,
    pub tiered_pricing: Option<Vec<PriceTier>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingType {
    Alias,
    Mapping,
}

#[derive(Debug, Clone)]
pub struct ModelMappingRow {
    pub id: i64,
    pub source_model: String,
    pub provider_id: Option<i64>,
    pub target_global_model_id: i64,
    pub mapping_type: MappingType,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub quota_usd: Option<f64>,
    pub used_usd: f64,
    pub total_usd: f64,
    pub role: String,
    pub allowed_providers: Option<Vec<String>>,
    pub allowed_api_formats: Option<Vec<String>>,
    pub allowed_models: Option<Vec<String>>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UserRow {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }

    /// spec.md §4.8 quota enforcement: unlimited when `quota_usd = NIL`, admins exempt.
    pub fn has_quota_remaining(&self) -> bool {
        if self.is_admin() {
            return true;
        }
        match self.quota_usd {
            Some(quota) => self.used_usd < quota,
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserKeyRow {
    pub id: i64,
    pub user_id: i64,
    pub api_key: String,
    pub label: Option<String>,
    pub enabled: bool,
    pub is_standalone: bool,
    pub current_balance_usd: Option<f64>,
    pub balance_used_usd: f64,
    pub allowed_providers: Option<Vec<String>>,
    pub allowed_api_formats: Option<Vec<String>>,
    pub allowed_models: Option<Vec<String>>,
    pub rate_limit: Option<i32>,
    pub force_capabilities: Option<JsonValue>,
    pub expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UserKeyRow {
    /// spec.md §4.8 quota enforcement floor for standalone keys.
    pub fn has_balance_at_least(&self, floor: f64) -> bool {
        if !self.is_standalone {
            return true;
        }
        match self.current_balance_usd {
            Some(balance) => balance - self.balance_used_usd >= floor,
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSnapshot {
    pub global_config: Option<GlobalConfigRow>,
    pub providers: Vec<ProviderRow>,
    pub endpoints: Vec<EndpointRow>,
    pub credentials: Vec<CredentialRow>,
    pub global_models: Vec<GlobalModelRow>,
    pub models: Vec<ModelRow>,
    pub model_mappings: Vec<ModelMappingRow>,
    pub users: Vec<UserRow>,
    pub user_keys: Vec<UserKeyRow>,
}

impl StorageSnapshot {
    pub fn endpoint(&self, id: i64) -> Option<&EndpointRow> {
        self.endpoints.iter().find(|e| e.id == id)
    }

    pub fn provider(&self, id: i64) -> Option<&ProviderRow> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn credential(&self, id: i64) -> Option<&CredentialRow> {
        self.credentials.iter().find(|c| c.id == id)
    }

    pub fn global_model(&self, id: i64) -> Option<&GlobalModelRow> {
        self.global_models.iter().find(|g| g.id == id)
    }

    pub fn model_for(&self, provider_id: i64, global_model_id: i64) -> Option<&ModelRow> {
        self.models
            .iter()
            .find(|m| m.provider_id == provider_id && m.global_model_id == global_model_id && m.is_active)
    }

    /// spec.md §4.2 step 1: provider-scoped alias wins over the global one.
    pub fn resolve_model_alias(&self, source_model: &str, provider_id: i64) -> Option<i64> {
        self.model_mappings
            .iter()
            .find(|m| m.source_model == source_model && m.provider_id == Some(provider_id))
            .or_else(|| {
                self.model_mappings
                    .iter()
                    .find(|m| m.source_model == source_model && m.provider_id.is_none())
            })
            .map(|m| m.target_global_model_id)
    }
}
