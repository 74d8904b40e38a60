use sea_orm::entity::prelude::*;

/// Canonical model catalog entry, independent of any one provider's naming.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "global_models")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "global_model_name")]
    pub name: String,
    pub supported_capabilities: Json,
    pub default_input_price: f64,
    pub default_output_price: f64,
    pub default_cache_creation_price: f64,
    pub default_cache_read_price: f64,
    #[sea_orm(has_many)]
    pub implementations: HasMany<super::models::Entity>,
    #[sea_orm(has_many)]
    pub mappings: HasMany<super::model_mappings::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
