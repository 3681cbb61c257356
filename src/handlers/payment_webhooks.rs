use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use crate::errors::ErrorResponse;
use crate::webhooks::WebhookAck;
use crate::AppState;

// POST /api/v1/payments/webhook
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body = String,
    responses(
        (status = 200, description = "Webhook acknowledged"),
        (status = 401, description = "Invalid signature or credentials", body = ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match state.webhook_handler.handle(&headers, &body).await {
        WebhookAck::Accepted { disposition } => (
            StatusCode::OK,
            Json(json!({"received": true, "disposition": disposition})),
        )
            .into_response(),
        WebhookAck::Unauthorized(_) => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "Unauthorized".to_string(),
                message: "invalid webhook signature".to_string(),
                details: None,
                timestamp: chrono::Utc::now().to_rfc3339(),
            }),
        )
            .into_response(),
    }
}
