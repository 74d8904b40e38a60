use sea_orm::entity::prelude::*;

/// Provider-specific implementation of a `GlobalModel` (spec.md §3 Model).
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "models")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub provider_id: i64,
    pub global_model_id: i64,
    pub provider_model_name: String,
    pub is_active: bool,
    pub override_input_price: Option<f64>,
    pub override_output_price: Option<f64>,
    pub override_cache_creation_price: Option<f64>,
    pub override_cache_read_price: Option<f64>,
    /// Ordered `[{up_to, input_price, output_price, cache_creation_price, cache_read_price}, ...]`.
    pub tiered_pricing: Option<Json>,
    #[sea_orm(belongs_to, from = "provider_id", to = "id", on_delete = "Cascade")]
    pub provider: HasOne<super::providers::Entity>,
    #[sea_orm(belongs_to, from = "global_model_id", to = "id", on_delete = "Cascade")]
    pub global_model: HasOne<super::global_models::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
