use sea_orm::entity::prelude::*;

/// Alias from a requested model name to a canonical `GlobalModel` (spec.md §3 ModelMapping).
///
/// At most one row per `(source_model, provider_id)`; `provider_id = NULL` is the
/// global fallback consulted when no provider-scoped alias matches.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "model_mappings")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "model_mapping_source")]
    pub source_model: String,
    #[sea_orm(unique_key = "model_mapping_source")]
    pub provider_id: Option<i64>,
    pub target_global_model_id: i64,
    /// alias | mapping
    pub mapping_type: String,
    #[sea_orm(belongs_to, from = "target_global_model_id", to = "id", on_delete = "Cascade")]
    pub target_global_model: HasOne<super::global_models::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
