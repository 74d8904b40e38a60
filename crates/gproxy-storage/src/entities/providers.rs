use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "providers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "provider_name")]
    pub name: String,
    pub config_json: Json,
    pub enabled: bool,
    /// Smaller sorts first in the candidate planner's ordering step.
    pub priority: i32,
    /// One of pay_as_you_go | monthly_quota | free_tier.
    pub billing_type: String,
    pub monthly_quota_usd: Option<f64>,
    pub monthly_used_usd: f64,
    pub quota_reset_day: i32,
    pub quota_last_reset_at: Option<OffsetDateTime>,
    pub rpm_limit: Option<i32>,
    pub rpm_used: i32,
    pub rpm_reset_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub credentials: HasMany<super::credentials::Entity>,
    #[sea_orm(has_many)]
    pub endpoints: HasMany<super::endpoints::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
