use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use super::payment_order::PaymentMethod;

/// Where a status report came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ObservationSource {
    Webhook,
    Poll,
    Manual,
}

/// Gateway state after translation into internal vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservedState {
    /// The gateway holds the order; no payment attempt yet.
    Accepted,
    /// A payment attempt is in flight.
    Attempted,
    Completed,
    Failed,
    Cancelled,
    /// The order passed its deadline without a terminal observation.
    Expired,
    RefundAccepted { refund_id: String },
    RefundCompleted { refund_id: String, amount: i64 },
    RefundFailed { refund_id: String },
}

/// Normalised status report fed to the transition function.
///
/// Deliberately closed: the raw gateway payload travels next to it as audit
/// metadata and never reaches `apply`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Observation {
    pub source: ObservationSource,
    pub state: ObservedState,
    pub gateway_order_id: Option<String>,
    pub transaction_id: Option<String>,
    pub payment_method: Option<PaymentMethod>,
    pub expire_at: Option<DateTime<Utc>>,
}

impl Observation {
    pub fn new(source: ObservationSource, state: ObservedState) -> Self {
        Self {
            source,
            state,
            gateway_order_id: None,
            transaction_id: None,
            payment_method: None,
            expire_at: None,
        }
    }

    pub fn with_transaction(
        mut self,
        transaction_id: Option<String>,
        payment_method: Option<PaymentMethod>,
    ) -> Self {
        self.transaction_id = transaction_id;
        self.payment_method = payment_method;
        self
    }

    pub fn with_gateway_order(
        mut self,
        gateway_order_id: Option<String>,
        expire_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.gateway_order_id = gateway_order_id;
        self.expire_at = expire_at;
        self
    }
}
