use sea_orm::entity::prelude::*;

/// One wire-protocol offering of a provider (spec.md §3 Endpoint).
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "endpoints")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub provider_id: i64,
    /// claude | claude_cli | openai | openai_cli | gemini | ...
    #[sea_orm(unique_key = "endpoint_provider_format")]
    pub api_format: String,
    pub base_url: String,
    pub is_active: bool,
    pub max_concurrent: Option<i32>,
    pub rate_limit: Option<i32>,
    #[sea_orm(belongs_to, from = "provider_id", to = "id", on_delete = "Cascade")]
    pub provider: HasOne<super::providers::Entity>,
    #[sea_orm(has_many)]
    pub credentials: HasMany<super::credentials::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
