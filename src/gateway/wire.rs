//! Gateway wire format and its translation into internal vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{GatewayError, GatewayObservation, GatewayOrder, SignatureError, VerifiedPayload};
use crate::models::{ObservedState, PaymentMethod};

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    /// Epoch seconds.
    pub expires_at: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PayRequest<'a> {
    pub merchant_order_id: &'a str,
    pub amount: i64,
    pub expire_after: u64,
    pub payment_flow: PaymentFlow<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PaymentFlow<'a> {
    #[serde(rename = "type")]
    pub flow_type: &'static str,
    pub merchant_urls: MerchantUrls<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MerchantUrls<'a> {
    pub redirect_url: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PayResponse {
    pub order_id: String,
    /// Epoch milliseconds.
    pub expire_at: i64,
    pub redirect_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OrderStatusResponse {
    pub order_id: Option<String>,
    pub state: String,
    #[serde(default)]
    pub payment_details: Vec<PaymentDetail>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PaymentDetail {
    pub payment_mode: Option<String>,
    pub transaction_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefundRequestBody<'a> {
    pub merchant_refund_id: &'a str,
    pub original_merchant_order_id: &'a str,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefundResponse {
    pub refund_id: String,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WebhookEnvelope {
    #[serde(rename = "type", alias = "event")]
    pub event_type: String,
    pub payload: WebhookPayload,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WebhookPayload {
    pub original_merchant_order_id: Option<String>,
    pub merchant_order_id: Option<String>,
    pub order_id: Option<String>,
    pub refund_id: Option<String>,
    pub merchant_refund_id: Option<String>,
    pub amount: Option<i64>,
    #[serde(default)]
    pub payment_details: Vec<PaymentDetail>,
}

pub(crate) fn payment_method(mode: &str) -> PaymentMethod {
    match mode.to_ascii_uppercase().as_str() {
        "UPI_INTENT" => PaymentMethod::UpiIntent,
        "UPI_COLLECT" => PaymentMethod::UpiCollect,
        "UPI_QR" => PaymentMethod::UpiQr,
        "CARD" | "DEBIT_CARD" | "CREDIT_CARD" => PaymentMethod::Card,
        "NET_BANKING" | "NETBANKING" => PaymentMethod::NetBanking,
        "WALLET" => PaymentMethod::Wallet,
        _ => PaymentMethod::Other,
    }
}

fn latest_attempt(details: &[PaymentDetail]) -> (Option<String>, Option<PaymentMethod>) {
    details
        .last()
        .map(|detail| {
            (
                detail.transaction_id.clone(),
                detail.payment_mode.as_deref().map(payment_method),
            )
        })
        .unwrap_or((None, None))
}

pub(crate) fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, GatewayError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| GatewayError::Decode(format!("invalid timestamp {}", millis)))
}

pub(crate) fn gateway_order(raw: Value) -> Result<GatewayOrder, GatewayError> {
    let response: PayResponse =
        serde_json::from_value(raw.clone()).map_err(|e| GatewayError::Decode(e.to_string()))?;
    Ok(GatewayOrder {
        gateway_order_id: response.order_id,
        redirect_url: response.redirect_url,
        expire_at: millis_to_datetime(response.expire_at)?,
        raw,
    })
}

/// Translates a status lookup response.
pub(crate) fn status_observation(raw: Value) -> Result<GatewayObservation, GatewayError> {
    let response: OrderStatusResponse =
        serde_json::from_value(raw.clone()).map_err(|e| GatewayError::Decode(e.to_string()))?;
    let state = match response.state.as_str() {
        "COMPLETED" => ObservedState::Completed,
        "FAILED" => ObservedState::Failed,
        "CANCELLED" => ObservedState::Cancelled,
        "PENDING" if response.payment_details.is_empty() => ObservedState::Accepted,
        "PENDING" => ObservedState::Attempted,
        other => {
            return Err(GatewayError::Decode(format!(
                "unrecognised order state {}",
                other
            )))
        }
    };
    let (transaction_id, payment_method) = latest_attempt(&response.payment_details);
    Ok(GatewayObservation {
        state,
        gateway_order_id: response.order_id,
        transaction_id,
        payment_method,
        raw,
    })
}

/// Decodes an authenticated webhook body.
pub(crate) fn webhook_payload(body: &[u8]) -> Result<VerifiedPayload, SignatureError> {
    let raw: Value =
        serde_json::from_slice(body).map_err(|e| SignatureError::MalformedBody(e.to_string()))?;
    let envelope: WebhookEnvelope = serde_json::from_value(raw.clone())
        .map_err(|e| SignatureError::MalformedBody(e.to_string()))?;
    let payload = envelope.payload;

    let kind = envelope
        .event_type
        .trim_start_matches("CHECKOUT_")
        .trim_start_matches("PG_");
    let refund_id = payload
        .refund_id
        .clone()
        .or_else(|| payload.merchant_refund_id.clone());

    let state = match (kind, refund_id) {
        ("ORDER_COMPLETED", _) => Some(ObservedState::Completed),
        ("ORDER_FAILED", _) => Some(ObservedState::Failed),
        ("ORDER_CANCELLED", _) => Some(ObservedState::Cancelled),
        ("REFUND_ACCEPTED", Some(refund_id)) => Some(ObservedState::RefundAccepted { refund_id }),
        ("REFUND_COMPLETED", Some(refund_id)) => payload
            .amount
            .map(|amount| ObservedState::RefundCompleted { refund_id, amount }),
        ("REFUND_FAILED", Some(refund_id)) => Some(ObservedState::RefundFailed { refund_id }),
        _ => None,
    };

    let observation = state.map(|state| {
        let (transaction_id, payment_method) = latest_attempt(&payload.payment_details);
        GatewayObservation {
            state,
            gateway_order_id: payload.order_id.clone(),
            transaction_id,
            payment_method,
            raw: raw.clone(),
        }
    });

    Ok(VerifiedPayload {
        merchant_order_id: payload
            .original_merchant_order_id
            .or(payload.merchant_order_id),
        observation,
        raw,
    })
}
