use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{CustomerInfo, PaymentOrder, SelectedItem};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisioningError {
    #[error("case service unavailable: {0}")]
    Unavailable(String),
    #[error("case service rejected the request: {0}")]
    Rejected(String),
    #[error("unexpected case service response: {0}")]
    Decode(String),
}

/// Creates the downstream case for a paid order.
///
/// Implementations must be idempotent per `merchant_order_id`: the caller
/// delivers at least once across restarts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaseProvisioner: Send + Sync {
    async fn provision_case(&self, order: &PaymentOrder) -> Result<String, ProvisioningError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateCaseRequest<'a> {
    merchant_order_id: &'a str,
    amount: i64,
    customer: &'a CustomerInfo,
    selected_items: &'a [SelectedItem],
    transaction_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCaseResponse {
    #[serde(alias = "id")]
    case_id: String,
}

/// Case service reached over HTTP. The merchant order id doubles as the idempotency key.
pub struct HttpCaseProvisioner {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpCaseProvisioner {
    pub fn new(
        base_url: String,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProvisioningError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProvisioningError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }
}

#[async_trait]
impl CaseProvisioner for HttpCaseProvisioner {
    #[instrument(skip(self, order), fields(merchant_order_id = %order.merchant_order_id))]
    async fn provision_case(&self, order: &PaymentOrder) -> Result<String, ProvisioningError> {
        let body = CreateCaseRequest {
            merchant_order_id: &order.merchant_order_id,
            amount: order.amount,
            customer: &order.customer_info,
            selected_items: &order.selected_items,
            transaction_id: order.gateway_transaction_id.as_deref(),
        };
        let mut request = self
            .client
            .post(format!("{}/cases", self.base_url.trim_end_matches('/')))
            .header("Idempotency-Key", &order.merchant_order_id)
            .json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProvisioningError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(ProvisioningError::Unavailable(format!(
                "case service returned {}",
                status
            )));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProvisioningError::Rejected(format!("{}: {}", status, message)));
        }
        let created: CreateCaseResponse = response
            .json()
            .await
            .map_err(|e| ProvisioningError::Decode(e.to_string()))?;
        info!(case_id = %created.case_id, "case provisioned");
        Ok(created.case_id)
    }
}

/// Process-local provisioner used when no case service is configured and in tests.
#[derive(Default)]
pub struct InMemoryCaseProvisioner {
    cases: DashMap<String, String>,
    invocations: AtomicUsize,
    failures_remaining: AtomicUsize,
}

impl InMemoryCaseProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` calls with `Unavailable`.
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Calls received, including failed and repeated ones.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Distinct cases created.
    pub fn cases_created(&self) -> usize {
        self.cases.len()
    }

    pub fn case_for(&self, merchant_order_id: &str) -> Option<String> {
        self.cases.get(merchant_order_id).map(|c| c.value().clone())
    }
}

#[async_trait]
impl CaseProvisioner for InMemoryCaseProvisioner {
    async fn provision_case(&self, order: &PaymentOrder) -> Result<String, ProvisioningError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(ProvisioningError::Unavailable(
                "case service unavailable".to_string(),
            ));
        }
        let case_id = self
            .cases
            .entry(order.merchant_order_id.clone())
            .or_insert_with(|| {
                let id = Uuid::new_v4().simple().to_string();
                format!("CASE-{}", id[..8].to_ascii_uppercase())
            })
            .value()
            .clone();
        Ok(case_id)
    }
}
