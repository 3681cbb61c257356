use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Payment Orders API",
        version = "0.1.0",
        description = r#"
# Payment Orders

Creates payment orders for selected service price components, hands them to the
payment gateway and tracks each order to a terminal state.

- Order status is driven by gateway webhooks and by status polls; both feed one
  transition function, so duplicate or out-of-order notifications are harmless.
- Every transition attempt, including ignored ones, is written to the order's
  audit trail.
- A completed payment provisions exactly one downstream case.

## Error Handling

```json
{
  "error": "Bad Request",
  "message": "Validation error: compulsory price components missing: Filing fee",
  "timestamp": "2024-01-01T00:00:00Z"
}
```
        "#
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Payments", description = "Payment order lifecycle endpoints"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        crate::handlers::payments::create_order,
        crate::handlers::payments::get_order_status,
        crate::handlers::payments::get_audit_trail,
        crate::handlers::payments::retry_initiation,
        crate::handlers::payments::request_refund,
        crate::handlers::payment_webhooks::payment_webhook,
        crate::handlers::health::liveness_check,
        crate::handlers::health::readiness_check,
    ),
    components(
        schemas(
            crate::services::order_manager::CreateOrderRequest,
            crate::services::order_manager::CreateOrderResponse,
            crate::services::order_manager::RefundResponse,
            crate::services::order_manager::RetryOutcome,
            crate::handlers::payments::RefundOrderRequest,
            crate::handlers::payments::AuditTrailResponse,
            crate::models::OrderStatusView,
            crate::models::PaymentAuditLogEntry,
            crate::webhooks::WebhookDisposition,
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}
