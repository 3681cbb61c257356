use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::signature::WebhookAuth;
use super::wire::{self, MerchantUrls, PayRequest, PaymentFlow, RefundRequestBody};
use super::{
    GatewayError, GatewayObservation, GatewayOrder, InitiationRequest, PaymentGateway,
    RefundAcceptance, RefundRequest, SignatureError, VerifiedPayload,
};

/// Tokens are refreshed this long before the gateway says they expire.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub client_version: String,
    pub request_timeout: Duration,
    pub max_read_retries: u32,
    pub retry_backoff: Duration,
    pub webhook_auth: WebhookAuth,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Gateway client speaking the checkout v2 HTTP API.
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    settings: GatewaySettings,
    token: Mutex<Option<CachedToken>>,
}

impl HttpPaymentGateway {
    pub fn new(settings: GatewaySettings) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            settings,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at - chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) > Utc::now() {
                return Ok(token.value.clone());
            }
        }

        let form = [
            ("client_id", self.settings.client_id.as_str()),
            ("client_version", self.settings.client_version.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ];
        let response = self
            .client
            .post(self.url("/v1/oauth/token"))
            .form(&form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::Authentication(format!(
                "token request returned {}",
                response.status()
            )));
        }
        let token: wire::TokenResponse = response.json().await?;
        let expires_at = DateTime::from_timestamp(token.expires_at, 0)
            .ok_or_else(|| GatewayError::Decode("invalid token expiry".to_string()))?;
        debug!(%expires_at, "refreshed gateway access token");
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at,
        });
        Ok(token.access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, GatewayError> {
        let token = self.access_token().await?;
        let response = request
            .header("Authorization", format!("O-Bearer {}", token))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let code = status.as_u16();
        match code {
            401 | 403 => {
                self.invalidate_token().await;
                Err(GatewayError::Authentication(format!(
                    "gateway returned {}",
                    code
                )))
            }
            404 => Err(GatewayError::NotFound),
            400..=499 => {
                let message = response.text().await.unwrap_or_default();
                Err(GatewayError::Rejected {
                    status: code,
                    message,
                })
            }
            _ => Err(GatewayError::Upstream { status: code }),
        }
    }

    async fn fetch_status(&self, merchant_order_id: &str) -> Result<Value, GatewayError> {
        let request = self.client.get(self.url(&format!(
            "/checkout/v2/order/{}/status",
            merchant_order_id
        )));
        self.send_json(request).await
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, request), fields(merchant_order_id = %request.merchant_order_id))]
    async fn initiate(&self, request: &InitiationRequest) -> Result<GatewayOrder, GatewayError> {
        let body = PayRequest {
            merchant_order_id: &request.merchant_order_id,
            amount: request.amount,
            expire_after: request.expire_after_secs,
            payment_flow: PaymentFlow {
                flow_type: "PG_CHECKOUT",
                merchant_urls: MerchantUrls {
                    redirect_url: &request.redirect_url,
                },
            },
        };
        let raw: Value = self
            .send_json(self.client.post(self.url("/checkout/v2/pay")).json(&body))
            .await?;
        wire::gateway_order(raw)
    }

    #[instrument(skip(self))]
    async fn poll_status(
        &self,
        merchant_order_id: &str,
    ) -> Result<GatewayObservation, GatewayError> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_status(merchant_order_id).await {
                Ok(raw) => return wire::status_observation(raw),
                Err(err) if err.is_outcome_unknown() && attempt < self.settings.max_read_retries => {
                    let backoff = self.settings.retry_backoff * 2u32.pow(attempt);
                    attempt += 1;
                    warn!(
                        error = %err,
                        attempt,
                        max_retries = self.settings.max_read_retries,
                        "status lookup failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    #[instrument(skip(self, request), fields(merchant_order_id = %request.merchant_order_id))]
    async fn refund(&self, request: &RefundRequest) -> Result<RefundAcceptance, GatewayError> {
        let body = RefundRequestBody {
            merchant_refund_id: &request.merchant_refund_id,
            original_merchant_order_id: &request.merchant_order_id,
            amount: request.amount,
        };
        let raw: Value = self
            .send_json(self.client.post(self.url("/payments/v2/refund")).json(&body))
            .await?;
        let response: wire::RefundResponse = serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::Decode(e.to_string()))?;
        Ok(RefundAcceptance {
            refund_id: response.refund_id,
            amount: response.amount,
            raw,
        })
    }

    fn validate_inbound_signature(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<VerifiedPayload, SignatureError> {
        self.settings.webhook_auth.verify(headers, body)?;
        wire::webhook_payload(body)
    }
}
