use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::gateway::{GatewayError, InitiationRequest, PaymentGateway, RefundRequest};
use crate::models::{
    generate_merchant_order_id, AuditEvent, CustomerInfo, NewAuditEntry, Observation,
    ObservationSource, OrderStatusView, PaymentAuditLogEntry, PaymentOrder, PaymentStatus,
};
use crate::repositories::{CommitOutcome, PaymentOrderRepository};
use crate::services::case_provisioner::CaseProvisioner;
use crate::services::price_catalog::{resolve_selection, PriceCatalog};
use crate::services::state_machine::{self, Outcome, Transition};

#[derive(Debug, Clone)]
pub struct OrderSettings {
    pub order_ttl: Duration,
    pub default_redirect_url: String,
    pub max_commit_attempts: u32,
}

impl From<&AppConfig> for OrderSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            order_ttl: Duration::from_secs(cfg.orders.order_ttl_secs),
            default_redirect_url: cfg.orders.default_redirect_url.clone(),
            max_commit_attempts: cfg.orders.max_commit_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[validate]
    pub customer_info: CustomerInfo,
    pub selected_price_component_ids: Vec<Uuid>,
    #[validate(url)]
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    pub merchant_order_id: String,
    pub checkout_url: String,
    pub amount: i64,
    pub expire_at: chrono::DateTime<Utc>,
}

/// What `retry_initiation` ended up doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RetryOutcome {
    /// The gateway already held the order; it was adopted.
    Recovered { order: OrderStatusView },
    /// The gateway had never seen the order; it was initiated now.
    Initiated { checkout: CreateOrderResponse },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefundResponse {
    pub merchant_order_id: String,
    pub merchant_refund_id: String,
    pub refund_id: String,
    pub amount: i64,
}

/// Result of feeding one observation through the transition function.
#[derive(Debug, Clone)]
pub struct AppliedObservation {
    /// Projection after the write (and after case linkage, when that ran).
    pub order: PaymentOrder,
    pub transition: Transition,
}

/// Owns the payment order state machine. The only writer of order rows.
#[derive(Clone)]
pub struct OrderManager {
    repo: Arc<dyn PaymentOrderRepository>,
    gateway: Arc<dyn PaymentGateway>,
    provisioner: Arc<dyn CaseProvisioner>,
    catalog: Arc<dyn PriceCatalog>,
    settings: OrderSettings,
}

impl OrderManager {
    pub fn new(
        repo: Arc<dyn PaymentOrderRepository>,
        gateway: Arc<dyn PaymentGateway>,
        provisioner: Arc<dyn CaseProvisioner>,
        catalog: Arc<dyn PriceCatalog>,
        settings: OrderSettings,
    ) -> Self {
        Self {
            repo,
            gateway,
            provisioner,
            catalog,
            settings,
        }
    }

    pub fn repository(&self) -> &Arc<dyn PaymentOrderRepository> {
        &self.repo
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    /// Validates the request, stores a `Pending` order and initiates it remotely.
    #[instrument(skip(self, request))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<CreateOrderResponse, ServiceError> {
        request.validate()?;
        let items =
            resolve_selection(self.catalog.as_ref(), &request.selected_price_component_ids).await?;

        let now = Utc::now();
        let expire_at = now + chrono::Duration::seconds(self.settings.order_ttl.as_secs() as i64);
        let mut order = PaymentOrder::new(
            generate_merchant_order_id(now),
            request.customer_info,
            items,
            expire_at,
            now,
        );
        let redirect_url = request
            .redirect_url
            .unwrap_or_else(|| self.settings.default_redirect_url.clone());
        order.redirect_url = Some(redirect_url.clone());
        let entry = NewAuditEntry::new(
            order.id,
            AuditEvent::OrderCreated,
            PaymentStatus::Pending,
            "order created",
            json!({
                "amount": order.amount,
                "selected_items": order.selected_items,
                "expire_at": order.expire_at,
                "redirect_url": order.redirect_url,
            }),
        );
        self.repo.insert(&order, entry).await?;
        info!(
            merchant_order_id = %order.merchant_order_id,
            amount = order.amount,
            "payment order created"
        );

        self.initiate(order, redirect_url).await
    }

    async fn initiate(
        &self,
        order: PaymentOrder,
        redirect_url: String,
    ) -> Result<CreateOrderResponse, ServiceError> {
        let request = InitiationRequest {
            merchant_order_id: order.merchant_order_id.clone(),
            amount: order.amount,
            redirect_url,
            expire_after_secs: self.settings.order_ttl.as_secs(),
        };

        match self.gateway.initiate(&request).await {
            Ok(remote) => {
                let checkout_url = remote.redirect_url.clone();
                let (observation, raw) = remote.into_observation();
                let applied = self.apply_observation(order.id, observation, raw).await?;
                Ok(CreateOrderResponse {
                    merchant_order_id: order.merchant_order_id,
                    checkout_url,
                    amount: order.amount,
                    expire_at: applied.order.expire_at,
                })
            }
            Err(err) => {
                counter!("payment_orders.gateway.error", 1);
                warn!(
                    merchant_order_id = %order.merchant_order_id,
                    error = %err,
                    outcome_unknown = err.is_outcome_unknown(),
                    "gateway initiation failed"
                );
                self.record_error(
                    &order,
                    format!("gateway initiation failed: {}", err),
                    json!({
                        "operation": "initiate",
                        "error": err.to_string(),
                        "outcome_unknown": err.is_outcome_unknown(),
                    }),
                )
                .await;
                Err(ServiceError::Gateway(err))
            }
        }
    }

    /// Recovers an order left `Pending` by a failed initiation.
    ///
    /// Looks the order up remotely first so an initiation whose response was
    /// lost is adopted instead of duplicated.
    #[instrument(skip(self))]
    pub async fn retry_initiation(
        &self,
        merchant_order_id: &str,
    ) -> Result<RetryOutcome, ServiceError> {
        let order = self.find_by_merchant_order_id(merchant_order_id).await?;
        if order.status != PaymentStatus::Pending {
            return Err(ServiceError::InvalidOperation(format!(
                "order {} is already {}",
                merchant_order_id, order.status
            )));
        }
        if order.is_expired(Utc::now()) {
            return Err(ServiceError::InvalidOperation(format!(
                "order {} has expired",
                merchant_order_id
            )));
        }

        match self.gateway.poll_status(merchant_order_id).await {
            Ok(remote) => {
                info!("gateway already holds the order; adopting it");
                let (observation, raw) = remote.into_observation(ObservationSource::Poll);
                let applied = self.apply_observation(order.id, observation, raw).await?;
                Ok(RetryOutcome::Recovered {
                    order: applied.order.view(),
                })
            }
            Err(GatewayError::NotFound) => {
                let redirect_url = order
                    .redirect_url
                    .clone()
                    .unwrap_or_else(|| self.settings.default_redirect_url.clone());
                let checkout = self.initiate(order, redirect_url).await?;
                Ok(RetryOutcome::Initiated { checkout })
            }
            Err(err) => {
                counter!("payment_orders.gateway.error", 1);
                self.record_error(
                    &order,
                    format!("status lookup before re-initiation failed: {}", err),
                    json!({"operation": "retry_initiation", "error": err.to_string()}),
                )
                .await;
                Err(ServiceError::Gateway(err))
            }
        }
    }

    /// Runs `observation` through the transition function and persists the result.
    ///
    /// The row write is a compare-and-swap on `version`; on conflict the order
    /// is reloaded and the observation re-evaluated against the fresh state.
    #[instrument(skip(self, observation, raw), fields(source = %observation.source))]
    pub async fn apply_observation(
        &self,
        order_id: Uuid,
        observation: Observation,
        raw: Value,
    ) -> Result<AppliedObservation, ServiceError> {
        for attempt in 1..=self.settings.max_commit_attempts {
            let current = self
                .repo
                .find_by_id(order_id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("payment order {}", order_id)))?;

            let transition = state_machine::apply(&current, &observation, Utc::now());
            let entry = NewAuditEntry::new(
                order_id,
                transition.event,
                transition.to,
                transition.description.clone(),
                json!({
                    "source": observation.source,
                    "outcome": transition.outcome,
                    "observation": observation,
                    "raw": raw,
                }),
            );

            if !transition.writes_row() {
                self.repo.append_audit(entry).await?;
                if transition.outcome == Outcome::Discarded {
                    counter!("payment_orders.transition.discarded", 1);
                }
                info!(
                    merchant_order_id = %current.merchant_order_id,
                    status = %current.status,
                    outcome = ?transition.outcome,
                    reason = %transition.description,
                    "observation recorded without state change"
                );
                return Ok(AppliedObservation {
                    order: current,
                    transition,
                });
            }

            let mut next = transition.next.clone();
            next.version = current.version + 1;

            match self.repo.commit(&next, current.version, entry).await? {
                CommitOutcome::Committed => {
                    if transition.outcome == Outcome::Applied {
                        counter!("payment_orders.transition.applied", 1);
                    }
                    info!(
                        merchant_order_id = %next.merchant_order_id,
                        from = %transition.from,
                        to = %transition.to,
                        event = %transition.event,
                        "payment order transitioned"
                    );
                    let order = if transition.effects.provision_case {
                        self.provision(next).await
                    } else {
                        next
                    };
                    return Ok(AppliedObservation { order, transition });
                }
                CommitOutcome::Conflict => {
                    counter!("payment_orders.commit.conflict", 1);
                    debug!(%order_id, attempt, "version conflict, re-evaluating");
                }
            }
        }

        error!(%order_id, "giving up after repeated version conflicts");
        Err(ServiceError::ConcurrentModification(order_id))
    }

    /// Calls the provisioner and links the case. Payment state is never rolled back here.
    async fn provision(&self, order: PaymentOrder) -> PaymentOrder {
        match self.provisioner.provision_case(&order).await {
            Ok(case_id) => match self.link_case(order.id, case_id).await {
                Ok(linked) => linked,
                Err(err) => {
                    error!(
                        merchant_order_id = %order.merchant_order_id,
                        error = %err,
                        "failed to record case linkage"
                    );
                    self.record_error(
                        &order,
                        format!("case linkage failed: {}", err),
                        json!({"operation": "link_case", "error": err.to_string()}),
                    )
                    .await;
                    order
                }
            },
            Err(err) => {
                counter!("payment_orders.provisioning.failed", 1);
                warn!(
                    merchant_order_id = %order.merchant_order_id,
                    error = %err,
                    "case provisioning failed; will retry"
                );
                self.record_error(
                    &order,
                    format!("case provisioning failed: {}", err),
                    json!({"operation": "provision_case", "error": err.to_string()}),
                )
                .await;
                order
            }
        }
    }

    /// Retries provisioning for an order whose case is still missing.
    #[instrument(skip(self))]
    pub async fn provision_pending(&self, order_id: Uuid) -> Result<PaymentOrder, ServiceError> {
        let order = self
            .repo
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment order {}", order_id)))?;
        if !order.provisioning_pending || order.case_id.is_some() {
            return Ok(order);
        }
        Ok(self.provision(order).await)
    }

    /// Writes `case_id` once, together with a `CASE_LINKED` entry.
    #[instrument(skip(self))]
    pub async fn link_case(
        &self,
        order_id: Uuid,
        case_id: String,
    ) -> Result<PaymentOrder, ServiceError> {
        for _ in 0..self.settings.max_commit_attempts {
            let current = self
                .repo
                .find_by_id(order_id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("payment order {}", order_id)))?;

            if let Some(existing) = &current.case_id {
                if existing != &case_id {
                    warn!(%existing, offered = %case_id, "order already linked to another case");
                }
                return Ok(current);
            }
            if !current.status.is_paid() {
                return Err(ServiceError::InvalidOperation(format!(
                    "cannot link a case to an order in status {}",
                    current.status
                )));
            }

            let mut next = current.clone();
            next.case_id = Some(case_id.clone());
            next.provisioning_pending = false;
            next.version = current.version + 1;
            next.updated_at = Utc::now();

            let entry = NewAuditEntry::new(
                order_id,
                AuditEvent::CaseLinked,
                current.status,
                format!("case {} linked", case_id),
                json!({"case_id": case_id}),
            );
            match self.repo.commit(&next, current.version, entry).await? {
                CommitOutcome::Committed => {
                    info!(merchant_order_id = %next.merchant_order_id, %case_id, "case linked");
                    return Ok(next);
                }
                CommitOutcome::Conflict => {
                    counter!("payment_orders.commit.conflict", 1);
                }
            }
        }
        Err(ServiceError::ConcurrentModification(order_id))
    }

    /// Asks the gateway to refund part or all of a paid order.
    ///
    /// Status only changes once the gateway confirms the refund.
    #[instrument(skip(self))]
    pub async fn request_refund(
        &self,
        merchant_order_id: &str,
        amount: i64,
    ) -> Result<RefundResponse, ServiceError> {
        let order = self.find_by_merchant_order_id(merchant_order_id).await?;
        if !matches!(
            order.status,
            PaymentStatus::Completed | PaymentStatus::PartiallyRefunded
        ) {
            return Err(ServiceError::InvalidOperation(format!(
                "order {} cannot be refunded in status {}",
                merchant_order_id, order.status
            )));
        }
        let remaining = order.amount - order.refunded_amount();
        if amount <= 0 || amount > remaining {
            return Err(ServiceError::ValidationError(format!(
                "refund amount must be between 1 and {}",
                remaining
            )));
        }

        let merchant_refund_id = format!(
            "REFUND_{}_{}",
            Utc::now().timestamp_millis(),
            order.refunds.len() + 1
        );
        let request = RefundRequest {
            merchant_refund_id: merchant_refund_id.clone(),
            merchant_order_id: order.merchant_order_id.clone(),
            amount,
        };

        match self.gateway.refund(&request).await {
            Ok(acceptance) => {
                self.repo
                    .append_audit(NewAuditEntry::new(
                        order.id,
                        AuditEvent::RefundInitiated,
                        order.status,
                        format!("refund of {} requested", amount),
                        json!({
                            "merchant_refund_id": merchant_refund_id,
                            "refund_id": acceptance.refund_id,
                            "amount": acceptance.amount,
                            "raw": acceptance.raw,
                        }),
                    ))
                    .await?;
                info!(%merchant_refund_id, amount, "refund requested");
                Ok(RefundResponse {
                    merchant_order_id: order.merchant_order_id,
                    merchant_refund_id,
                    refund_id: acceptance.refund_id,
                    amount: acceptance.amount,
                })
            }
            Err(err) => {
                counter!("payment_orders.gateway.error", 1);
                self.record_error(
                    &order,
                    format!("refund request failed: {}", err),
                    json!({"operation": "refund", "amount": amount, "error": err.to_string()}),
                )
                .await;
                Err(ServiceError::Gateway(err))
            }
        }
    }

    pub async fn find_by_merchant_order_id(
        &self,
        merchant_order_id: &str,
    ) -> Result<PaymentOrder, ServiceError> {
        self.repo
            .find_by_merchant_order_id(merchant_order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment order {}", merchant_order_id)))
    }

    pub async fn audit_trail(
        &self,
        merchant_order_id: &str,
    ) -> Result<(PaymentOrder, Vec<PaymentAuditLogEntry>), ServiceError> {
        let order = self.find_by_merchant_order_id(merchant_order_id).await?;
        let entries = self.repo.audit_trail(order.id).await?;
        Ok((order, entries))
    }

    /// Appends `ERROR_OCCURRED`. A failure to record is logged, never returned,
    /// so it cannot mask the error being recorded.
    pub async fn record_error(&self, order: &PaymentOrder, description: String, metadata: Value) {
        let entry = NewAuditEntry::new(
            order.id,
            AuditEvent::ErrorOccurred,
            order.status,
            description,
            metadata,
        );
        if let Err(err) = self.repo.append_audit(entry).await {
            error!(
                merchant_order_id = %order.merchant_order_id,
                error = %err,
                "failed to append error audit entry"
            );
        }
    }
}
