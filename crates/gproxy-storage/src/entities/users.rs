use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "user_name")]
    pub name: String,
    pub enabled: bool,
    pub quota_usd: Option<f64>,
    pub used_usd: f64,
    pub total_usd: f64,
    pub role: String,
    pub allowed_providers: Option<Json>,
    pub allowed_api_formats: Option<Json>,
    pub allowed_models: Option<Json>,
    pub model_capability_settings: Json,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub keys: HasMany<super::user_keys::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
