use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::errors::ServiceError;
use crate::models::{OrderStatusView, PaymentAuditLogEntry};
use crate::services::order_manager::{
    CreateOrderRequest, CreateOrderResponse, RefundResponse, RetryOutcome,
};
use crate::services::state_machine::{self, ReplayedState};
use crate::{ApiResponse, AppState};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"amount": 20000}))]
pub struct RefundOrderRequest {
    /// Amount to refund in minor units
    #[schema(example = 20000)]
    pub amount: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuditTrailResponse {
    pub order: OrderStatusView,
    pub entries: Vec<PaymentAuditLogEntry>,
    /// Status and case reconstructed from `entries`
    pub replay: ReplayedState,
    /// Whether the replay agrees with the stored order
    pub consistent: bool,
}

/// Create a payment order and initiate it with the gateway
#[utoipa::path(
    post,
    path = "/api/v1/payments/orders",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created and initiated", body = ApiResponse<CreateOrderResponse>),
        (status = 400, description = "Invalid selection or customer details", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway failure; order left pending", body = crate::errors::ErrorResponse),
        (status = 504, description = "Gateway timeout; order left pending", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CreateOrderResponse>>), ServiceError> {
    let response = state.manager.create_order(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(response))))
}

/// Current order status; open orders are reconciled with the gateway first
#[utoipa::path(
    get,
    path = "/api/v1/payments/orders/{merchant_order_id}",
    params(("merchant_order_id" = String, Path, description = "Merchant order id")),
    responses(
        (status = 200, description = "Order status", body = ApiResponse<OrderStatusView>),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn get_order_status(
    State(state): State<AppState>,
    Path(merchant_order_id): Path<String>,
) -> Result<Json<ApiResponse<OrderStatusView>>, ServiceError> {
    let view = state.reconciler.check_status(&merchant_order_id).await?;
    Ok(Json(ApiResponse::success(view)))
}

/// Audit trail of an order with a replay consistency check
#[utoipa::path(
    get,
    path = "/api/v1/payments/orders/{merchant_order_id}/audit",
    params(("merchant_order_id" = String, Path, description = "Merchant order id")),
    responses(
        (status = 200, description = "Audit trail", body = ApiResponse<AuditTrailResponse>),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn get_audit_trail(
    State(state): State<AppState>,
    Path(merchant_order_id): Path<String>,
) -> Result<Json<ApiResponse<AuditTrailResponse>>, ServiceError> {
    let (order, entries) = state.manager.audit_trail(&merchant_order_id).await?;
    let replay = state_machine::replay(&entries);
    let consistent = replay.matches(&order);
    Ok(Json(ApiResponse::success(AuditTrailResponse {
        order: order.view(),
        entries,
        replay,
        consistent,
    })))
}

/// Retry initiation of an order left pending; adopts the remote order if one exists
#[utoipa::path(
    post,
    path = "/api/v1/payments/orders/{merchant_order_id}/retry",
    params(("merchant_order_id" = String, Path, description = "Merchant order id")),
    responses(
        (status = 200, description = "Order recovered or initiated", body = ApiResponse<RetryOutcome>),
        (status = 400, description = "Order is not pending or has expired", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway failure", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn retry_initiation(
    State(state): State<AppState>,
    Path(merchant_order_id): Path<String>,
) -> Result<Json<ApiResponse<RetryOutcome>>, ServiceError> {
    let outcome = state.manager.retry_initiation(&merchant_order_id).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

/// Request a full or partial refund of a paid order
#[utoipa::path(
    post,
    path = "/api/v1/payments/orders/{merchant_order_id}/refunds",
    params(("merchant_order_id" = String, Path, description = "Merchant order id")),
    request_body = RefundOrderRequest,
    responses(
        (status = 202, description = "Refund accepted by the gateway", body = ApiResponse<RefundResponse>),
        (status = 400, description = "Order not refundable or amount out of range", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway failure", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn request_refund(
    State(state): State<AppState>,
    Path(merchant_order_id): Path<String>,
    Json(request): Json<RefundOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<RefundResponse>>), ServiceError> {
    let response = state
        .manager
        .request_refund(&merchant_order_id, request.amount)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(response))))
}

/// Payment order routes, nested under `/api/v1/payments`
pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:merchant_order_id", get(get_order_status))
        .route("/orders/:merchant_order_id/audit", get(get_audit_trail))
        .route("/orders/:merchant_order_id/retry", post(retry_initiation))
        .route("/orders/:merchant_order_id/refunds", post(request_refund))
        .route(
            "/webhook",
            post(super::payment_webhooks::payment_webhook),
        )
}
