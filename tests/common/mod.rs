#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use dashmap::DashMap;
use http::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use uuid::Uuid;

use payment_orders::config::AppConfig;
use payment_orders::gateway::signature::{credentials_digest, AUTHORIZATION_HEADER};
use payment_orders::gateway::{
    GatewayError, GatewayObservation, GatewayOrder, GatewaySettings, HttpPaymentGateway,
    InitiationRequest, PaymentGateway, RefundAcceptance, RefundRequest, SignatureError,
    VerifiedPayload, WebhookAuth,
};
use payment_orders::models::{CustomerInfo, ObservedState, PaymentMethod, PaymentOrder};
use payment_orders::repositories::{InMemoryPaymentOrderRepository, PaymentOrderRepository};
use payment_orders::services::case_provisioner::InMemoryCaseProvisioner;
use payment_orders::services::order_manager::{
    CreateOrderRequest, CreateOrderResponse, OrderManager, OrderSettings,
};
use payment_orders::services::price_catalog::{InMemoryPriceCatalog, PriceComponent};
use payment_orders::services::reconciler::{Reconciler, ReconcilerSettings};
use payment_orders::webhooks::{PaymentWebhookHandler, WebhookAck};
use payment_orders::AppState;

pub const WEBHOOK_USERNAME: &str = "merchant-hook";
pub const WEBHOOK_PASSWORD: &str = "hook-secret";

enum InitiateScript {
    Fail(GatewayError),
    /// The remote order is created but the caller sees `GatewayError`.
    LoseResponse(GatewayError),
}

/// Scriptable stand-in for the payment gateway.
///
/// Initiation results are popped from a queue (accepting by default), the
/// remote order state is a map the test mutates, and webhook authentication
/// is delegated to the real HTTP client's verifier.
pub struct FakeGateway {
    verifier: HttpPaymentGateway,
    initiate_script: Mutex<VecDeque<InitiateScript>>,
    poll_script: Mutex<VecDeque<GatewayError>>,
    remote: DashMap<String, GatewayObservation>,
    poll_delay: Mutex<Duration>,
    pub initiate_calls: AtomicUsize,
    pub poll_calls: AtomicUsize,
    pub refunds: Mutex<Vec<RefundRequest>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        let verifier = HttpPaymentGateway::new(GatewaySettings {
            base_url: "http://127.0.0.1:9".into(),
            client_id: "test".into(),
            client_secret: "test".into(),
            client_version: "1".into(),
            request_timeout: Duration::from_secs(1),
            max_read_retries: 0,
            retry_backoff: Duration::from_millis(1),
            webhook_auth: WebhookAuth::Credentials {
                username: WEBHOOK_USERNAME.into(),
                password: WEBHOOK_PASSWORD.into(),
            },
        })
        .expect("gateway client");
        Self {
            verifier,
            initiate_script: Mutex::new(VecDeque::new()),
            poll_script: Mutex::new(VecDeque::new()),
            remote: DashMap::new(),
            poll_delay: Mutex::new(Duration::ZERO),
            initiate_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
            refunds: Mutex::new(Vec::new()),
        }
    }

    /// Makes the next initiation fail with `err`.
    pub fn fail_next_initiation(&self, err: GatewayError) {
        self.initiate_script
            .lock()
            .unwrap()
            .push_back(InitiateScript::Fail(err));
    }

    /// Makes the next initiation fail with `err` although the gateway did create the order.
    pub fn lose_next_initiation_response(&self, err: GatewayError) {
        self.initiate_script
            .lock()
            .unwrap()
            .push_back(InitiateScript::LoseResponse(err));
    }

    pub fn fail_next_poll(&self, err: GatewayError) {
        self.poll_script.lock().unwrap().push_back(err);
    }

    pub fn set_poll_delay(&self, delay: Duration) {
        *self.poll_delay.lock().unwrap() = delay;
    }

    /// Sets what a status poll reports for `merchant_order_id`.
    pub fn set_remote_state(
        &self,
        merchant_order_id: &str,
        state: ObservedState,
        transaction_id: Option<&str>,
        method: Option<PaymentMethod>,
    ) {
        let mut observation = GatewayObservation::new(state, json!({"source": "fake"}));
        observation.gateway_order_id = Some(format!("OMO-{}", merchant_order_id));
        observation.transaction_id = transaction_id.map(str::to_string);
        observation.payment_method = method;
        self.remote.insert(merchant_order_id.to_string(), observation);
    }

    pub fn initiations(&self) -> usize {
        self.initiate_calls.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn initiate(&self, request: &InitiationRequest) -> Result<GatewayOrder, GatewayError> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.initiate_script.lock().unwrap().pop_front();
        match scripted {
            Some(InitiateScript::Fail(err)) => return Err(err),
            Some(InitiateScript::LoseResponse(err)) => {
                self.set_remote_state(&request.merchant_order_id, ObservedState::Accepted, None, None);
                return Err(err);
            }
            None => {}
        }
        self.set_remote_state(&request.merchant_order_id, ObservedState::Accepted, None, None);
        Ok(GatewayOrder {
            gateway_order_id: format!("OMO-{}", request.merchant_order_id),
            redirect_url: format!("https://pay.example/checkout/{}", request.merchant_order_id),
            expire_at: Utc::now() + chrono::Duration::seconds(request.expire_after_secs as i64),
            raw: json!({"orderId": format!("OMO-{}", request.merchant_order_id), "state": "PENDING"}),
        })
    }

    async fn poll_status(
        &self,
        merchant_order_id: &str,
    ) -> Result<GatewayObservation, GatewayError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.poll_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.poll_script.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.remote
            .get(merchant_order_id)
            .map(|o| o.value().clone())
            .ok_or(GatewayError::NotFound)
    }

    async fn refund(&self, request: &RefundRequest) -> Result<RefundAcceptance, GatewayError> {
        self.refunds.lock().unwrap().push(request.clone());
        Ok(RefundAcceptance {
            refund_id: format!("OMR-{}", request.merchant_refund_id),
            amount: request.amount,
            raw: json!({"state": "PENDING"}),
        })
    }

    fn validate_inbound_signature(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<VerifiedPayload, SignatureError> {
        self.verifier.validate_inbound_signature(headers, body)
    }
}

pub struct TestApp {
    pub repo: Arc<InMemoryPaymentOrderRepository>,
    pub gateway: Arc<FakeGateway>,
    pub provisioner: Arc<InMemoryCaseProvisioner>,
    pub catalog: Arc<InMemoryPriceCatalog>,
    pub manager: OrderManager,
    pub reconciler: Arc<Reconciler>,
    pub webhooks: PaymentWebhookHandler,
    pub consultation: PriceComponent,
    pub drafting: PriceComponent,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(1200))
    }

    pub fn with_ttl(order_ttl: Duration) -> Self {
        let service_id = Uuid::new_v4();
        let consultation = PriceComponent {
            id: Uuid::new_v4(),
            service_id,
            name: "Consultation fee".into(),
            price: 40_000,
            discount: 0,
            is_compulsory: true,
        };
        let drafting = PriceComponent {
            id: Uuid::new_v4(),
            service_id,
            name: "Document drafting".into(),
            price: 15_000,
            discount: 5_000,
            is_compulsory: false,
        };

        let repo = Arc::new(InMemoryPaymentOrderRepository::new());
        let gateway = Arc::new(FakeGateway::new());
        let provisioner = Arc::new(InMemoryCaseProvisioner::new());
        let catalog = Arc::new(InMemoryPriceCatalog::with_components([
            consultation.clone(),
            drafting.clone(),
        ]));
        let manager = OrderManager::new(
            repo.clone(),
            gateway.clone(),
            provisioner.clone(),
            catalog.clone(),
            OrderSettings {
                order_ttl,
                default_redirect_url: "https://merchant.example/payment/status".into(),
                max_commit_attempts: 10,
            },
        );
        let reconciler = Arc::new(Reconciler::new(
            manager.clone(),
            ReconcilerSettings {
                stale_after: Duration::ZERO,
                batch_size: 100,
                provisioning_grace: Duration::ZERO,
                sweep_interval: Duration::from_secs(60),
            },
        ));
        let webhooks = PaymentWebhookHandler::new(gateway.clone(), manager.clone());

        Self {
            repo,
            gateway,
            provisioner,
            catalog,
            manager,
            reconciler,
            webhooks,
            consultation,
            drafting,
        }
    }

    pub fn state(&self) -> AppState {
        AppState {
            manager: self.manager.clone(),
            reconciler: self.reconciler.clone(),
            webhook_handler: self.webhooks.clone(),
            db: None,
        }
    }

    pub fn router(&self) -> Router {
        payment_orders::build_router(self.state(), &AppConfig::default())
    }

    pub fn order_request(&self) -> CreateOrderRequest {
        CreateOrderRequest {
            customer_info: customer(),
            selected_price_component_ids: vec![self.consultation.id, self.drafting.id],
            redirect_url: None,
        }
    }

    /// Creates an order for 50000 (40000 + 15000 - 5000).
    pub async fn create_order(&self) -> CreateOrderResponse {
        self.manager
            .create_order(self.order_request())
            .await
            .expect("order creation")
    }

    pub async fn order(&self, merchant_order_id: &str) -> PaymentOrder {
        self.repo
            .find_by_merchant_order_id(merchant_order_id)
            .await
            .expect("lookup")
            .expect("order exists")
    }

    pub async fn deliver(&self, body: &Value) -> WebhookAck {
        let raw = body.to_string();
        self.webhooks
            .handle(&signed_headers(), raw.as_bytes())
            .await
    }
}

pub fn customer() -> CustomerInfo {
    CustomerInfo {
        name: "Priya Sharma".into(),
        email: "priya@example.com".into(),
        phone: "+919876543210".into(),
    }
}

pub fn signed_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION_HEADER,
        HeaderValue::from_str(&credentials_digest(WEBHOOK_USERNAME, WEBHOOK_PASSWORD))
            .expect("header value"),
    );
    headers
}

pub fn order_webhook(event: &str, merchant_order_id: &str, transaction_id: &str, mode: &str) -> Value {
    json!({
        "type": event,
        "payload": {
            "originalMerchantOrderId": merchant_order_id,
            "orderId": format!("OMO-{}", merchant_order_id),
            "paymentDetails": [{"transactionId": transaction_id, "paymentMode": mode}]
        }
    })
}

pub fn refund_webhook(event: &str, merchant_order_id: &str, refund_id: &str, amount: i64) -> Value {
    json!({
        "type": event,
        "payload": {
            "originalMerchantOrderId": merchant_order_id,
            "refundId": refund_id,
            "amount": amount
        }
    })
}
