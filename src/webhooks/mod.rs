//! Inbound gateway callbacks.
//!
//! The handler authenticates, correlates and delegates. Duplicate and
//! out-of-order deliveries are made harmless by the transition function, not here.

use std::sync::Arc;

use http::HeaderMap;
use metrics::counter;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;

use crate::gateway::{PaymentGateway, SignatureError};
use crate::models::{AuditEvent, NewAuditEntry, ObservationSource};
use crate::services::order_manager::OrderManager;
use crate::services::state_machine::Outcome;

/// What happened to an authenticated delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WebhookDisposition {
    Applied,
    Enriched,
    Recorded,
    Discarded,
    /// No order carries the referenced merchant order id.
    OrderNotFound,
    /// The notification type has no lifecycle meaning.
    Ignored,
    /// Processing failed internally; recorded for operators, still acknowledged.
    Failed,
}

impl From<Outcome> for WebhookDisposition {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Applied => Self::Applied,
            Outcome::Enriched => Self::Enriched,
            Outcome::Recorded => Self::Recorded,
            Outcome::Discarded => Self::Discarded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAck {
    Accepted { disposition: WebhookDisposition },
    Unauthorized(SignatureError),
}

impl WebhookAck {
    fn accepted(disposition: WebhookDisposition) -> Self {
        Self::Accepted { disposition }
    }
}

#[derive(Clone)]
pub struct PaymentWebhookHandler {
    gateway: Arc<dyn PaymentGateway>,
    manager: OrderManager,
}

impl PaymentWebhookHandler {
    pub fn new(gateway: Arc<dyn PaymentGateway>, manager: OrderManager) -> Self {
        Self { gateway, manager }
    }

    /// Processes one delivery. Only a signature failure is reported back as such;
    /// everything after authentication is acknowledged.
    #[instrument(skip(self, headers, body), fields(body_len = body.len()))]
    pub async fn handle(&self, headers: &HeaderMap, body: &[u8]) -> WebhookAck {
        let payload = match self.gateway.validate_inbound_signature(headers, body) {
            Ok(payload) => payload,
            Err(err) => {
                counter!("payment_orders.webhook.unauthorized", 1);
                warn!(error = %err, "rejected payment webhook");
                return WebhookAck::Unauthorized(err);
            }
        };

        let Some(merchant_order_id) = payload.merchant_order_id.clone() else {
            info!("payment webhook without merchant order id; acknowledging");
            return WebhookAck::accepted(WebhookDisposition::Ignored);
        };

        let order = match self.manager.repository().find_by_merchant_order_id(&merchant_order_id).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                warn!(%merchant_order_id, "payment webhook for unknown order");
                return WebhookAck::accepted(WebhookDisposition::OrderNotFound);
            }
            Err(err) => {
                error!(%merchant_order_id, error = %err, "order lookup failed for webhook");
                return WebhookAck::accepted(WebhookDisposition::Failed);
            }
        };

        let Some(remote) = payload.observation else {
            info!(%merchant_order_id, "payment webhook type carries no state; acknowledging");
            let entry = NewAuditEntry::new(
                order.id,
                AuditEvent::WebhookReceived,
                order.status,
                "webhook carried no usable state; no change",
                json!({"source": "webhook", "outcome": "ignored", "raw": payload.raw}),
            );
            if let Err(err) = self.manager.repository().append_audit(entry).await {
                error!(%merchant_order_id, error = %err, "failed to audit ignored webhook");
            }
            return WebhookAck::accepted(WebhookDisposition::Ignored);
        };

        let (observation, raw) = remote.into_observation(ObservationSource::Webhook);
        match self.manager.apply_observation(order.id, observation, raw).await {
            Ok(applied) => WebhookAck::accepted(applied.transition.outcome.into()),
            Err(err) => {
                error!(%merchant_order_id, error = %err, "failed to apply webhook observation");
                self.manager
                    .record_error(
                        &order,
                        format!("webhook processing failed: {}", err),
                        json!({"operation": "webhook", "error": err.to_string()}),
                    )
                    .await;
                WebhookAck::accepted(WebhookDisposition::Failed)
            }
        }
    }
}
