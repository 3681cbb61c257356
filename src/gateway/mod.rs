//! Boundary to the external payment gateway.
//!
//! Everything that knows the gateway's request/response shape lives below this
//! module. Callers only see [`PaymentGateway`], the normalised
//! [`GatewayObservation`] and the typed errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde_json::Value;

use crate::models::{Observation, ObservationSource, ObservedState, PaymentMethod};

pub mod http_client;
pub mod signature;
pub mod wire;

pub use http_client::{GatewaySettings, HttpPaymentGateway};
pub use signature::WebhookAuth;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway request timed out")]
    Timeout,
    #[error("gateway transport failure: {0}")]
    Transport(String),
    #[error("gateway returned server error {status}")]
    Upstream { status: u16 },
    #[error("gateway rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("order is not known to the gateway")]
    NotFound,
    #[error("gateway authentication failed: {0}")]
    Authentication(String),
    #[error("unexpected gateway response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// The request may or may not have taken effect remotely.
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout | GatewayError::Transport(_) | GatewayError::Upstream { .. }
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing authentication header: {0}")]
    MissingHeader(&'static str),
    #[error("webhook signature mismatch")]
    Mismatch,
    #[error("webhook timestamp outside tolerance")]
    StaleTimestamp,
    #[error("webhook body is malformed: {0}")]
    MalformedBody(String),
    #[error("webhook authentication is not configured")]
    NotConfigured,
}

/// Order creation request sent to the gateway. `merchant_order_id` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiationRequest {
    pub merchant_order_id: String,
    pub amount: i64,
    pub redirect_url: String,
    pub expire_after_secs: u64,
}

/// The gateway accepted an order and returned a checkout session.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayOrder {
    pub gateway_order_id: String,
    pub redirect_url: String,
    pub expire_at: DateTime<Utc>,
    pub raw: Value,
}

impl GatewayOrder {
    pub fn into_observation(self) -> (Observation, Value) {
        let observation = Observation::new(ObservationSource::Manual, ObservedState::Accepted)
            .with_gateway_order(Some(self.gateway_order_id), Some(self.expire_at));
        (observation, self.raw)
    }
}

/// Normalised gateway report plus its raw payload for the audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayObservation {
    pub state: ObservedState,
    pub gateway_order_id: Option<String>,
    pub transaction_id: Option<String>,
    pub payment_method: Option<PaymentMethod>,
    pub raw: Value,
}

impl GatewayObservation {
    pub fn new(state: ObservedState, raw: Value) -> Self {
        Self {
            state,
            gateway_order_id: None,
            transaction_id: None,
            payment_method: None,
            raw,
        }
    }

    pub fn into_observation(self, source: ObservationSource) -> (Observation, Value) {
        let observation = Observation::new(source, self.state)
            .with_transaction(self.transaction_id, self.payment_method)
            .with_gateway_order(self.gateway_order_id, None);
        (observation, self.raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    pub merchant_refund_id: String,
    pub merchant_order_id: String,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundAcceptance {
    pub refund_id: String,
    pub amount: i64,
    pub raw: Value,
}

/// A webhook whose authenticity has been established.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedPayload {
    /// Merchant order id the notification refers to, if the payload carries one.
    pub merchant_order_id: Option<String>,
    /// `None` when the notification type carries no lifecycle meaning for us.
    pub observation: Option<GatewayObservation>,
    pub raw: Value,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates the remote order. Never retried automatically.
    async fn initiate(&self, request: &InitiationRequest) -> Result<GatewayOrder, GatewayError>;

    /// Looks up the remote order by merchant order id. Safe to retry.
    async fn poll_status(&self, merchant_order_id: &str)
        -> Result<GatewayObservation, GatewayError>;

    async fn refund(&self, request: &RefundRequest) -> Result<RefundAcceptance, GatewayError>;

    /// Authenticates an inbound callback and decodes it. Any mismatch is an error.
    fn validate_inbound_signature(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<VerifiedPayload, SignatureError>;
}
