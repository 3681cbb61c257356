use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use utoipa::ToSchema;
use uuid::Uuid;

use super::payment_order::PaymentStatus;

/// Closed set of audit events recorded for an order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr, ToSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    OrderCreated,
    PaymentInitiated,
    PaymentProcessing,
    PaymentSuccess,
    PaymentFailed,
    PaymentCancelled,
    RefundInitiated,
    RefundCompleted,
    RefundFailed,
    WebhookReceived,
    StatusCheck,
    ErrorOccurred,
    CaseLinked,
}

/// Persisted, immutable audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PaymentAuditLogEntry {
    pub id: Uuid,
    pub order_id: Uuid,
    pub event: AuditEvent,
    pub resulting_status: PaymentStatus,
    pub description: String,
    #[schema(value_type = Object)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Entry about to be appended; the store assigns nothing, ids are generated here.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub id: Uuid,
    pub order_id: Uuid,
    pub event: AuditEvent,
    pub resulting_status: PaymentStatus,
    pub description: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl NewAuditEntry {
    pub fn new(
        order_id: Uuid,
        event: AuditEvent,
        resulting_status: PaymentStatus,
        description: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            event,
            resulting_status,
            description: description.into(),
            metadata,
            created_at: Utc::now(),
        }
    }

    pub fn into_entry(self) -> PaymentAuditLogEntry {
        PaymentAuditLogEntry {
            id: self.id,
            order_id: self.order_id,
            event: self.event,
            resulting_status: self.resulting_status,
            description: self.description,
            metadata: self.metadata,
            created_at: self.created_at,
        }
    }
}
