use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One outbound call on one candidate (spec.md §3 Attempt).
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "attempts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub request_id: String,
    pub provider_id: i64,
    pub endpoint_id: i64,
    pub key_id: i64,
    /// available | pending | started | used | success | failed | skipped
    pub status: String,
    pub status_code: Option<i32>,
    pub latency_ms: Option<i32>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
}

impl ActiveModelBehavior for ActiveModel {}
