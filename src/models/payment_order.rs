use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use once_cell::sync::Lazy;
use regex::Regex;

static PHONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+?[0-9]{10,15}$").expect("valid regex"));

/// Lifecycle status of a payment order.
///
/// Statuses form a partial order by terminality weight. `Pending`,
/// `Initiated`, `Processing` are the only non-terminal states; `Completed`
/// only moves further along the refund chain.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
    ToSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Initiated,
    Processing,
    Completed,
    Failed,
    Cancelled,
    PartiallyRefunded,
    Refunded,
}

impl PaymentStatus {
    /// Terminality weight used to reject regressive observations.
    pub fn weight(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Initiated => 1,
            Self::Processing => 2,
            Self::Completed => 3,
            Self::PartiallyRefunded => 4,
            Self::Failed | Self::Cancelled | Self::Refunded => 5,
        }
    }

    /// True while the order still waits for a payment outcome.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Initiated | Self::Processing)
    }

    /// True when the payment itself succeeded (including the refund chain).
    pub fn is_paid(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyRefunded | Self::Refunded
        )
    }

    /// No outgoing transitions at all.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::Refunded)
    }

    /// Exhaustive edge check shared by the transition function and audit replay.
    pub fn can_transition_to(self, next: Self) -> bool {
        use PaymentStatus::*;
        match (self, next) {
            (from, Failed | Cancelled) if from.is_open() => true,
            (from, Initiated | Processing | Completed) if from.is_open() => {
                next.weight() > from.weight()
            }
            (Completed, PartiallyRefunded | Refunded) => true,
            (PartiallyRefunded, PartiallyRefunded | Refunded) => true,
            _ => false,
        }
    }
}

/// Normalised payment instrument reported by the gateway.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr, ToSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    UpiIntent,
    UpiCollect,
    UpiQr,
    Card,
    NetBanking,
    Wallet,
    Other,
}

/// Customer snapshot taken at order creation. Later profile edits never touch it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate, ToSchema)]
pub struct CustomerInfo {
    #[validate(length(min = 1, max = 100, message = "name must be between 1 and 100 characters"))]
    pub name: String,
    #[validate(email(message = "email must be a valid email address"))]
    pub email: String,
    #[validate(custom = "validate_phone")]
    pub phone: String,
}

fn validate_phone(phone: &str) -> Result<(), ValidationError> {
    if PHONE_RE.is_match(phone) {
        Ok(())
    } else {
        let mut err = ValidationError::new("phone");
        err.message = Some("phone must contain 10 to 15 digits with an optional leading '+'".into());
        Err(err)
    }
}

/// Price-at-order-time snapshot of one selected price component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SelectedItem {
    pub price_component_id: Uuid,
    pub price_at_order_time: i64,
    pub discount_at_order_time: i64,
    pub final_price: i64,
    pub is_compulsory: bool,
}

/// A refund the gateway confirmed for this order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RefundRecord {
    pub refund_id: String,
    pub amount: i64,
    pub completed_at: DateTime<Utc>,
}

/// Current-state projection of a payment order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOrder {
    pub id: Uuid,
    pub merchant_order_id: String,
    pub gateway_order_id: Option<String>,
    /// Where the caller asked the customer to be sent back; reused when initiation is retried.
    pub redirect_url: Option<String>,
    pub amount: i64,
    pub status: PaymentStatus,
    pub payment_method: Option<PaymentMethod>,
    pub gateway_transaction_id: Option<String>,
    pub customer_info: CustomerInfo,
    pub selected_items: Vec<SelectedItem>,
    pub refunds: Vec<RefundRecord>,
    pub expire_at: DateTime<Utc>,
    pub case_id: Option<String>,
    /// Set in the same write that first reaches `Completed`; cleared once `case_id` is linked.
    pub provisioning_pending: bool,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentOrder {
    /// Builds a fresh `Pending` order.
    pub fn new(
        merchant_order_id: String,
        customer_info: CustomerInfo,
        selected_items: Vec<SelectedItem>,
        expire_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let amount = selected_items.iter().map(|item| item.final_price).sum();
        Self {
            id: Uuid::new_v4(),
            merchant_order_id,
            gateway_order_id: None,
            redirect_url: None,
            amount,
            status: PaymentStatus::Pending,
            payment_method: None,
            gateway_transaction_id: None,
            customer_info,
            selected_items,
            refunds: Vec::new(),
            expire_at,
            case_id: None,
            provisioning_pending: false,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn refunded_amount(&self) -> i64 {
        self.refunds.iter().map(|refund| refund.amount).sum()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expire_at
    }

    pub fn view(&self) -> OrderStatusView {
        OrderStatusView {
            merchant_order_id: self.merchant_order_id.clone(),
            status: self.status,
            amount: self.amount,
            refunded_amount: self.refunded_amount(),
            payment_method: self.payment_method,
            transaction_id: self.gateway_transaction_id.clone(),
            selected_items: self.selected_items.clone(),
            case_id: self.case_id.clone(),
            expire_at: self.expire_at,
            updated_at: self.updated_at,
        }
    }
}

/// Externally visible projection returned by the status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OrderStatusView {
    pub merchant_order_id: String,
    pub status: PaymentStatus,
    pub amount: i64,
    pub refunded_amount: i64,
    pub payment_method: Option<PaymentMethod>,
    pub transaction_id: Option<String>,
    pub selected_items: Vec<SelectedItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    pub expire_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Generates `ORDER_<unixMillis>_<RANDOM6>`.
pub fn generate_merchant_order_id(now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| char::from(c).to_ascii_uppercase())
        .collect();
    format!("ORDER_{}_{}", now.timestamp_millis(), suffix)
}
