use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{CommitOutcome, PaymentOrderRepository};
use crate::errors::ServiceError;
use crate::models::{NewAuditEntry, PaymentAuditLogEntry, PaymentOrder};

#[derive(Default)]
struct Store {
    orders: HashMap<Uuid, PaymentOrder>,
    by_merchant_id: HashMap<String, Uuid>,
    audit: Vec<PaymentAuditLogEntry>,
}

/// Process-local store. One lock covers both collections so a commit and its
/// audit entry become visible together.
#[derive(Default)]
pub struct InMemoryPaymentOrderRepository {
    store: Mutex<Store>,
}

impl InMemoryPaymentOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total entries across all orders.
    pub async fn audit_len(&self) -> usize {
        self.store.lock().await.audit.len()
    }
}

#[async_trait]
impl PaymentOrderRepository for InMemoryPaymentOrderRepository {
    async fn insert(&self, order: &PaymentOrder, entry: NewAuditEntry) -> Result<(), ServiceError> {
        let mut store = self.store.lock().await;
        if store.by_merchant_id.contains_key(&order.merchant_order_id)
            || store.orders.contains_key(&order.id)
        {
            return Err(ServiceError::Conflict(format!(
                "payment order {} already exists",
                order.merchant_order_id
            )));
        }
        store
            .by_merchant_id
            .insert(order.merchant_order_id.clone(), order.id);
        store.orders.insert(order.id, order.clone());
        store.audit.push(entry.into_entry());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentOrder>, ServiceError> {
        Ok(self.store.lock().await.orders.get(&id).cloned())
    }

    async fn find_by_merchant_order_id(
        &self,
        merchant_order_id: &str,
    ) -> Result<Option<PaymentOrder>, ServiceError> {
        let store = self.store.lock().await;
        Ok(store
            .by_merchant_id
            .get(merchant_order_id)
            .and_then(|id| store.orders.get(id))
            .cloned())
    }

    async fn commit(
        &self,
        order: &PaymentOrder,
        expected_version: i32,
        entry: NewAuditEntry,
    ) -> Result<CommitOutcome, ServiceError> {
        let mut store = self.store.lock().await;
        let current = store
            .orders
            .get_mut(&order.id)
            .ok_or_else(|| ServiceError::NotFound(format!("payment order {}", order.id)))?;
        if current.version != expected_version {
            return Ok(CommitOutcome::Conflict);
        }
        *current = order.clone();
        store.audit.push(entry.into_entry());
        Ok(CommitOutcome::Committed)
    }

    async fn append_audit(&self, entry: NewAuditEntry) -> Result<(), ServiceError> {
        self.store.lock().await.audit.push(entry.into_entry());
        Ok(())
    }

    async fn audit_trail(&self, order_id: Uuid) -> Result<Vec<PaymentAuditLogEntry>, ServiceError> {
        let store = self.store.lock().await;
        let mut entries: Vec<PaymentAuditLogEntry> = store
            .audit
            .iter()
            .filter(|entry| entry.order_id == order_id)
            .cloned()
            .collect();
        // stable, so equal timestamps keep append order
        entries.sort_by_key(|entry| entry.created_at);
        Ok(entries)
    }

    async fn find_reconcilable(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<PaymentOrder>, ServiceError> {
        let store = self.store.lock().await;
        let mut orders: Vec<PaymentOrder> = store
            .orders
            .values()
            .filter(|order| order.status.is_open())
            .filter(|order| order.updated_at < stale_before || order.expire_at <= now)
            .cloned()
            .collect();
        orders.sort_by_key(|order| order.updated_at);
        orders.truncate(limit as usize);
        Ok(orders)
    }

    async fn find_pending_provisioning(
        &self,
        updated_before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<PaymentOrder>, ServiceError> {
        let store = self.store.lock().await;
        let mut orders: Vec<PaymentOrder> = store
            .orders
            .values()
            .filter(|order| order.provisioning_pending && order.updated_at < updated_before)
            .cloned()
            .collect();
        orders.sort_by_key(|order| order.updated_at);
        orders.truncate(limit as usize);
        Ok(orders)
    }
}
