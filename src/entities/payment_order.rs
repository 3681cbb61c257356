use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub merchant_order_id: String,
    pub gateway_order_id: Option<String>,
    pub redirect_url: Option<String>,
    pub amount: i64,
    pub status: String,
    pub payment_method: Option<String>,
    pub gateway_transaction_id: Option<String>,
    pub customer_info: Json,
    pub selected_items: Json,
    pub refunds: Json,
    pub expire_at: DateTime<Utc>,
    pub case_id: Option<String>,
    pub provisioning_pending: bool,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::payment_audit_log::Entity")]
    AuditLogs,
}

impl Related<super::payment_audit_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AuditLogs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
