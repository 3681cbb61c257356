//! Payment order lifecycle engine
//!
//! Creates payment orders, initiates them with an external gateway, reconciles
//! their status from webhooks and polls through a single transition function,
//! keeps an append-only audit trail and provisions one downstream case per
//! completed payment.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod migrator;
pub mod models;
pub mod openapi;
pub mod repositories;
pub mod services;
pub mod webhooks;

use std::sync::Arc;

use axum::{routing::get, Router};
use chrono::Utc;
use http::HeaderValue;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use utoipa::ToSchema;

use crate::services::order_manager::OrderManager;
use crate::services::reconciler::Reconciler;
use crate::webhooks::PaymentWebhookHandler;

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub manager: OrderManager,
    pub reconciler: Arc<Reconciler>,
    pub webhook_handler: PaymentWebhookHandler,
    /// `None` with the in-memory storage backend.
    pub db: Option<Arc<DatabaseConnection>>,
}

// Common response wrapper
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResponseMeta {
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            meta: Some(ResponseMeta::capture()),
        }
    }
}

/// Routes under `/api/v1`.
pub fn api_v1_routes() -> Router<AppState> {
    Router::new().nest("/payments", handlers::payments::payment_routes())
}

/// CORS from configured origins, permissive in development when none are set.
pub fn cors_layer(cfg: &config::AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = cfg
        .cors_origins()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if !origins.is_empty() {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else if cfg.is_development() {
        info!("Using permissive CORS because explicit origins were not configured");
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    }
}

/// Full application router: health, v1 API and Swagger UI.
pub fn build_router(state: AppState, cfg: &config::AppConfig) -> Router {
    Router::<AppState>::new()
        .route("/", get(|| async { "payment-orders up" }))
        .nest("/health", handlers::health::health_routes())
        .nest("/api/v1", api_v1_routes())
        .merge(openapi::swagger_ui())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cfg))
        .with_state(state)
}
