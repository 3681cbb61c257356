use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::gateway::GatewayError;
use crate::models::{
    Observation, ObservationSource, ObservedState, OrderStatusView, PaymentOrder, PaymentStatus,
};
use crate::services::order_manager::OrderManager;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Open orders untouched for this long are polled by the sweep.
    pub stale_after: Duration,
    pub batch_size: u64,
    /// Time a completed order may wait for its case before the sweep retries provisioning.
    pub provisioning_grace: Duration,
    pub sweep_interval: Duration,
}

impl From<&AppConfig> for ReconcilerSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            stale_after: Duration::from_secs(cfg.reconciler.stale_after_secs),
            batch_size: cfg.reconciler.batch_size,
            provisioning_grace: Duration::from_secs(cfg.reconciler.provisioning_grace_secs),
            sweep_interval: Duration::from_secs(cfg.reconciler.sweep_interval_secs),
        }
    }
}

/// Counts from one background pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct SweepReport {
    pub checked: usize,
    pub transitioned: usize,
    pub expired: usize,
    pub provisioned: usize,
    pub errors: usize,
}

/// Pulls ground truth from the gateway when webhooks do not arrive.
///
/// Never writes orders itself; every result goes through [`OrderManager::apply_observation`].
#[derive(Clone)]
pub struct Reconciler {
    manager: OrderManager,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(manager: OrderManager, settings: ReconcilerSettings) -> Self {
        Self { manager, settings }
    }

    /// Status query: reconciles an open order, then returns the projection.
    #[instrument(skip(self))]
    pub async fn check_status(&self, merchant_order_id: &str) -> Result<OrderStatusView, ServiceError> {
        let order = self.manager.find_by_merchant_order_id(merchant_order_id).await?;
        let order = self.reconcile_order(&order).await?;
        Ok(order.view())
    }

    /// Brings one open order up to date. Gateway failures are recorded and absorbed.
    #[instrument(skip(self, order), fields(merchant_order_id = %order.merchant_order_id))]
    pub async fn reconcile_order(&self, order: &PaymentOrder) -> Result<PaymentOrder, ServiceError> {
        if !order.status.is_open() {
            return Ok(order.clone());
        }

        let now = Utc::now();
        if order.is_expired(now) {
            info!(expire_at = %order.expire_at, "order expired without confirmation");
            let applied = self
                .manager
                .apply_observation(
                    order.id,
                    Observation::new(ObservationSource::Poll, ObservedState::Expired),
                    json!({"expire_at": order.expire_at, "checked_at": now}),
                )
                .await?;
            return Ok(applied.order);
        }

        match self.manager.gateway().poll_status(&order.merchant_order_id).await {
            Ok(remote) => {
                let (observation, raw) = remote.into_observation(ObservationSource::Poll);
                let applied = self
                    .manager
                    .apply_observation(order.id, observation, raw)
                    .await?;
                Ok(applied.order)
            }
            Err(GatewayError::NotFound) if order.status == PaymentStatus::Pending => {
                debug!("gateway has no record of the order yet");
                self.manager
                    .record_error(
                        order,
                        "status check: order unknown to gateway".to_string(),
                        json!({"operation": "poll_status", "error": GatewayError::NotFound.to_string()}),
                    )
                    .await;
                Ok(order.clone())
            }
            Err(err) => {
                counter!("payment_orders.gateway.error", 1);
                warn!(error = %err, "status poll failed");
                self.manager
                    .record_error(
                        order,
                        format!("status check failed: {}", err),
                        json!({
                            "operation": "poll_status",
                            "error": err.to_string(),
                            "outcome_unknown": err.is_outcome_unknown(),
                        }),
                    )
                    .await;
                Ok(order.clone())
            }
        }
    }

    /// One background pass: stale or expired open orders, then orders still waiting for a case.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport, ServiceError> {
        let now = Utc::now();
        let stale_before = now - chrono::Duration::seconds(self.settings.stale_after.as_secs() as i64);
        let mut report = SweepReport::default();

        let candidates = self
            .manager
            .repository()
            .find_reconcilable(stale_before, now, self.settings.batch_size)
            .await?;
        for order in candidates {
            report.checked += 1;
            let expired = order.is_expired(now);
            match self.reconcile_order(&order).await {
                Ok(updated) if updated.status != order.status => {
                    report.transitioned += 1;
                    if expired && updated.status == PaymentStatus::Failed {
                        report.expired += 1;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    report.errors += 1;
                    error!(merchant_order_id = %order.merchant_order_id, error = %err, "reconciliation failed");
                }
            }
        }

        let grace_before =
            now - chrono::Duration::seconds(self.settings.provisioning_grace.as_secs() as i64);
        let waiting = self
            .manager
            .repository()
            .find_pending_provisioning(grace_before, self.settings.batch_size)
            .await?;
        for order in waiting {
            match self.manager.provision_pending(order.id).await {
                Ok(updated) if updated.case_id.is_some() => report.provisioned += 1,
                Ok(_) => report.errors += 1,
                Err(err) => {
                    report.errors += 1;
                    error!(merchant_order_id = %order.merchant_order_id, error = %err, "provisioning retry failed");
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                checked = report.checked,
                transitioned = report.transitioned,
                expired = report.expired,
                provisioned = report.provisioned,
                errors = report.errors,
                "reconciliation sweep finished"
            );
        }
        Ok(report)
    }

    /// Runs `sweep` every `sweep_interval` until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        info!(
            interval_secs = self.settings.sweep_interval.as_secs(),
            "starting reconciliation worker"
        );
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.sweep().await {
                    error!("reconciliation sweep error: {}", e);
                }
                tokio::select! {
                    _ = sleep(self.settings.sweep_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("reconciliation worker stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
