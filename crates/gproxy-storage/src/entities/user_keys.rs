use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Inbound client credential (spec.md §3 ApiKey).
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "user_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    #[sea_orm(column_name = "key_hash")]
    #[sea_orm(unique_key = "user_key_hash")]
    pub api_key: String,
    pub label: Option<String>,
    pub enabled: bool,
    /// Self-funded key: debits its own balance instead of the owning user's quota.
    pub is_standalone: bool,
    pub current_balance_usd: Option<f64>,
    pub balance_used_usd: f64,
    pub allowed_providers: Option<Json>,
    pub allowed_api_formats: Option<Json>,
    pub allowed_models: Option<Json>,
    pub rate_limit: Option<i32>,
    pub force_capabilities: Option<Json>,
    pub expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "user_id", to = "id", on_delete = "Cascade")]
    pub user: HasOne<super::users::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
