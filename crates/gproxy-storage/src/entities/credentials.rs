use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Upstream key bound to an endpoint (spec.md §3 Upstream Key / ProviderAPIKey).
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "credentials")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub provider_id: i64,
    pub endpoint_id: i64,
    pub name: Option<String>,
    pub settings: Option<Json>,
    pub secret: Json,
    pub enabled: bool,
    /// None => adaptive mode, `learned_max_concurrent` is the live ceiling.
    pub max_concurrent: Option<i32>,
    pub learned_max_concurrent: Option<i32>,
    pub rate_multiplier: f64,
    pub allowed_models: Option<Json>,
    pub capabilities: Json,

    // --- health / circuit breaker state (§4.4) ---
    pub health_score: f64,
    pub consecutive_failures: i32,
    pub last_failure_at: Option<OffsetDateTime>,
    pub request_results_window: Json,
    pub circuit_breaker_open: bool,
    pub circuit_breaker_open_at: Option<OffsetDateTime>,
    pub next_probe_at: Option<OffsetDateTime>,
    pub half_open_until: Option<OffsetDateTime>,
    pub half_open_successes: i32,
    pub half_open_failures: i32,

    // --- adaptive concurrency state (§4.5) ---
    pub concurrent_429_count: i32,
    pub rpm_429_count: i32,
    pub last_429_at: Option<OffsetDateTime>,
    pub last_429_type: Option<String>,
    pub adjustment_history: Json,
    pub success_count: i64,
    pub request_count: i64,

    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "provider_id", to = "id", on_delete = "Cascade")]
    pub provider: HasOne<super::providers::Entity>,
    #[sea_orm(belongs_to, from = "endpoint_id", to = "id", on_delete = "Cascade")]
    pub endpoint: HasOne<super::endpoints::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
