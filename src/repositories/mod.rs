use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::models::{NewAuditEntry, PaymentAuditLogEntry, PaymentOrder};

pub mod in_memory;
pub mod payment_order_repository;

pub use in_memory::InMemoryPaymentOrderRepository;
pub use payment_order_repository::SeaOrmPaymentOrderRepository;

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The stored version no longer matches; nothing was written.
    Conflict,
}

/// Persistence contract for the order projection and its audit trail.
///
/// Every write that changes an order also appends its audit entry atomically.
#[async_trait]
pub trait PaymentOrderRepository: Send + Sync {
    /// Stores a fresh order together with its `ORDER_CREATED` entry.
    async fn insert(&self, order: &PaymentOrder, entry: NewAuditEntry) -> Result<(), ServiceError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentOrder>, ServiceError>;

    async fn find_by_merchant_order_id(
        &self,
        merchant_order_id: &str,
    ) -> Result<Option<PaymentOrder>, ServiceError>;

    /// Replaces the stored order if its version still equals `expected_version`.
    /// `order.version` must already carry the bumped value.
    async fn commit(
        &self,
        order: &PaymentOrder,
        expected_version: i32,
        entry: NewAuditEntry,
    ) -> Result<CommitOutcome, ServiceError>;

    /// Appends an entry that does not accompany a row change.
    async fn append_audit(&self, entry: NewAuditEntry) -> Result<(), ServiceError>;

    /// Entries in `created_at` order; entries sharing a timestamp keep append order.
    async fn audit_trail(&self, order_id: Uuid) -> Result<Vec<PaymentAuditLogEntry>, ServiceError>;

    /// Open orders that went stale before `stale_before` or whose deadline has passed.
    async fn find_reconcilable(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<PaymentOrder>, ServiceError>;

    /// Completed orders still waiting for a case, untouched since `updated_before`.
    async fn find_pending_provisioning(
        &self,
        updated_before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<PaymentOrder>, ServiceError>;
}
