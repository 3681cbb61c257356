use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::Condition, ActiveValue::NotSet, ColumnTrait, ConnectionTrait, DatabaseConnection,
    DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait,
};
use tracing::error;
use uuid::Uuid;

use super::{CommitOutcome, PaymentOrderRepository};
use crate::entities::{payment_audit_log, payment_order};
use crate::errors::ServiceError;
use crate::models::{
    AuditEvent, NewAuditEntry, PaymentAuditLogEntry, PaymentMethod, PaymentOrder, PaymentStatus,
};

/// Attempts at claiming the next audit sequence number before giving up.
const SEQUENCE_ATTEMPTS: usize = 5;

const OPEN_STATUSES: [PaymentStatus; 3] = [
    PaymentStatus::Pending,
    PaymentStatus::Initiated,
    PaymentStatus::Processing,
];

/// Relational store backed by sea-orm.
#[derive(Debug, Clone)]
pub struct SeaOrmPaymentOrderRepository {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmPaymentOrderRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn to_active(order: &PaymentOrder) -> Result<payment_order::ActiveModel, ServiceError> {
    Ok(payment_order::ActiveModel {
        id: Set(order.id),
        merchant_order_id: Set(order.merchant_order_id.clone()),
        gateway_order_id: Set(order.gateway_order_id.clone()),
        redirect_url: Set(order.redirect_url.clone()),
        amount: Set(order.amount),
        status: Set(order.status.to_string()),
        payment_method: Set(order.payment_method.map(|m| m.to_string())),
        gateway_transaction_id: Set(order.gateway_transaction_id.clone()),
        customer_info: Set(serde_json::to_value(&order.customer_info)?),
        selected_items: Set(serde_json::to_value(&order.selected_items)?),
        refunds: Set(serde_json::to_value(&order.refunds)?),
        expire_at: Set(order.expire_at),
        case_id: Set(order.case_id.clone()),
        provisioning_pending: Set(order.provisioning_pending),
        version: Set(order.version),
        created_at: Set(order.created_at),
        updated_at: Set(order.updated_at),
    })
}

fn corrupt(what: &str, value: &str) -> ServiceError {
    ServiceError::InternalError(format!("stored {} '{}' is not recognised", what, value))
}

impl TryFrom<payment_order::Model> for PaymentOrder {
    type Error = ServiceError;

    fn try_from(model: payment_order::Model) -> Result<Self, Self::Error> {
        let status =
            PaymentStatus::from_str(&model.status).map_err(|_| corrupt("status", &model.status))?;
        let payment_method = model
            .payment_method
            .as_deref()
            .map(|m| PaymentMethod::from_str(m).map_err(|_| corrupt("payment method", m)))
            .transpose()?;
        Ok(PaymentOrder {
            id: model.id,
            merchant_order_id: model.merchant_order_id,
            gateway_order_id: model.gateway_order_id,
            redirect_url: model.redirect_url,
            amount: model.amount,
            status,
            payment_method,
            gateway_transaction_id: model.gateway_transaction_id,
            customer_info: serde_json::from_value(model.customer_info)?,
            selected_items: serde_json::from_value(model.selected_items)?,
            refunds: serde_json::from_value(model.refunds)?,
            expire_at: model.expire_at,
            case_id: model.case_id,
            provisioning_pending: model.provisioning_pending,
            version: model.version,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

fn audit_active(entry: NewAuditEntry, sequence: i64) -> payment_audit_log::ActiveModel {
    payment_audit_log::ActiveModel {
        id: Set(entry.id),
        order_id: Set(entry.order_id),
        sequence: Set(sequence),
        event: Set(entry.event.to_string()),
        resulting_status: Set(entry.resulting_status.to_string()),
        description: Set(entry.description),
        metadata: Set(entry.metadata),
        created_at: Set(entry.created_at),
    }
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

/// Appends `entry` after the last one stored for its order. A concurrent
/// appender claiming the same number fails on the unique index.
async fn insert_audit<C: ConnectionTrait>(conn: &C, entry: NewAuditEntry) -> Result<(), DbErr> {
    let last: Option<Option<i64>> = payment_audit_log::Entity::find()
        .select_only()
        .column_as(payment_audit_log::Column::Sequence.max(), "last")
        .filter(payment_audit_log::Column::OrderId.eq(entry.order_id))
        .into_tuple()
        .one(conn)
        .await?;
    let sequence = last.flatten().unwrap_or(0) + 1;
    payment_audit_log::Entity::insert(audit_active(entry, sequence))
        .exec_without_returning(conn)
        .await?;
    Ok(())
}

impl TryFrom<payment_audit_log::Model> for PaymentAuditLogEntry {
    type Error = ServiceError;

    fn try_from(model: payment_audit_log::Model) -> Result<Self, Self::Error> {
        Ok(PaymentAuditLogEntry {
            id: model.id,
            order_id: model.order_id,
            event: AuditEvent::from_str(&model.event).map_err(|_| corrupt("event", &model.event))?,
            resulting_status: PaymentStatus::from_str(&model.resulting_status)
                .map_err(|_| corrupt("status", &model.resulting_status))?,
            description: model.description,
            metadata: model.metadata,
            created_at: model.created_at,
        })
    }
}

fn into_orders(models: Vec<payment_order::Model>) -> Result<Vec<PaymentOrder>, ServiceError> {
    models.into_iter().map(PaymentOrder::try_from).collect()
}

#[async_trait]
impl PaymentOrderRepository for SeaOrmPaymentOrderRepository {
    async fn insert(&self, order: &PaymentOrder, entry: NewAuditEntry) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        if let Err(e) = payment_order::Entity::insert(to_active(order)?)
            .exec_without_returning(&txn)
            .await
        {
            return Err(match e.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(_)) => ServiceError::Conflict(format!(
                    "payment order {} already exists",
                    order.merchant_order_id
                )),
                _ => ServiceError::db_error(e),
            });
        }
        insert_audit(&txn, entry).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentOrder>, ServiceError> {
        payment_order::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .map(PaymentOrder::try_from)
            .transpose()
    }

    async fn find_by_merchant_order_id(
        &self,
        merchant_order_id: &str,
    ) -> Result<Option<PaymentOrder>, ServiceError> {
        payment_order::Entity::find()
            .filter(payment_order::Column::MerchantOrderId.eq(merchant_order_id))
            .one(&*self.db)
            .await?
            .map(PaymentOrder::try_from)
            .transpose()
    }

    async fn commit(
        &self,
        order: &PaymentOrder,
        expected_version: i32,
        entry: NewAuditEntry,
    ) -> Result<CommitOutcome, ServiceError> {
        let txn = self.db.begin().await?;

        let mut active = to_active(order)?;
        active.id = NotSet;
        active.merchant_order_id = NotSet;
        active.created_at = NotSet;

        let result = payment_order::Entity::update_many()
            .set(active)
            .filter(payment_order::Column::Id.eq(order.id))
            .filter(payment_order::Column::Version.eq(expected_version))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(CommitOutcome::Conflict);
        }

        if let Err(e) = insert_audit(&txn, entry).await {
            txn.rollback().await?;
            if is_unique_violation(&e) {
                // lost the sequence race; the caller re-reads and retries
                return Ok(CommitOutcome::Conflict);
            }
            return Err(ServiceError::db_error(e));
        }

        txn.commit().await.map_err(|e| {
            error!("Failed to commit transaction for order {}: {}", order.id, e);
            ServiceError::db_error(e)
        })?;
        Ok(CommitOutcome::Committed)
    }

    async fn append_audit(&self, entry: NewAuditEntry) -> Result<(), ServiceError> {
        for _ in 0..SEQUENCE_ATTEMPTS {
            let txn = self.db.begin().await?;
            match insert_audit(&txn, entry.clone()).await {
                Ok(()) => {
                    txn.commit().await?;
                    return Ok(());
                }
                Err(e) if is_unique_violation(&e) => txn.rollback().await?,
                Err(e) => return Err(ServiceError::db_error(e)),
            }
        }
        Err(ServiceError::Conflict(format!(
            "could not sequence audit entry for order {}",
            entry.order_id
        )))
    }

    async fn audit_trail(&self, order_id: Uuid) -> Result<Vec<PaymentAuditLogEntry>, ServiceError> {
        payment_audit_log::Entity::find()
            .filter(payment_audit_log::Column::OrderId.eq(order_id))
            .order_by_asc(payment_audit_log::Column::CreatedAt)
            .order_by_asc(payment_audit_log::Column::Sequence)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(PaymentAuditLogEntry::try_from)
            .collect()
    }

    async fn find_reconcilable(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<PaymentOrder>, ServiceError> {
        let models = payment_order::Entity::find()
            .filter(payment_order::Column::Status.is_in(OPEN_STATUSES.map(|s| s.to_string())))
            .filter(
                Condition::any()
                    .add(payment_order::Column::UpdatedAt.lt(stale_before))
                    .add(payment_order::Column::ExpireAt.lte(now)),
            )
            .order_by_asc(payment_order::Column::UpdatedAt)
            .limit(limit)
            .all(&*self.db)
            .await?;
        into_orders(models)
    }

    async fn find_pending_provisioning(
        &self,
        updated_before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<PaymentOrder>, ServiceError> {
        let models = payment_order::Entity::find()
            .filter(payment_order::Column::ProvisioningPending.eq(true))
            .filter(payment_order::Column::UpdatedAt.lt(updated_before))
            .order_by_asc(payment_order::Column::UpdatedAt)
            .limit(limit)
            .all(&*self.db)
            .await?;
        into_orders(models)
    }
}
