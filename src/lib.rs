//! Enrollment API Library
//!
//! Lead capture, checkout session orchestration, payment status polling and
//! promotion code consistency for the course enrollment funnel.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod handlers;
pub mod middleware_helpers;
pub mod migrator;
pub mod models;
pub mod openapi;
pub mod provider;
pub mod services;
pub mod tracing;
pub mod validation;
pub mod webhooks;

use axum::Router;
use std::sync::Arc;
use tower_http::timeout::TimeoutLayer;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::provider::PaymentProvider;
use crate::services::{
    checkout::{CheckoutService, ProviderPromotionValidator},
    leads::{LeadService, SeaOrmLeadStore},
    payment_status::PaymentStatusService,
};
use crate::webhooks::SpreadsheetRelay;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: Arc<AppConfig>,
    pub provider: Arc<dyn PaymentProvider>,
    pub lead_service: LeadService,
    pub checkout_service: CheckoutService,
    pub payment_status_service: PaymentStatusService,
}

impl AppState {
    /// Wires every service from its collaborators.
    pub fn new(
        config: AppConfig,
        db: Arc<DbPool>,
        provider: Arc<dyn PaymentProvider>,
        relay: SpreadsheetRelay,
    ) -> Self {
        let lead_service = LeadService::new(Arc::new(SeaOrmLeadStore::new(db.clone())), relay);
        let checkout_service = CheckoutService::new(
            provider.clone(),
            Arc::new(ProviderPromotionValidator),
            config.payment.clone(),
            config.pricing.clone(),
        );
        let payment_status_service = PaymentStatusService::new(provider.clone());

        Self {
            db,
            config: Arc::new(config),
            provider,
            lead_service,
            checkout_service,
            payment_status_service,
        }
    }
}

/// Public routes of the funnel.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/course", handlers::leads::lead_routes())
        .nest("/payment", handlers::payments::payment_routes())
        .nest("/health", handlers::health::health_routes())
}

/// The full application: routes plus request id, tracing and timeout layers.
/// CORS is added by the binary since its policy depends on deployment.
pub fn build_app(state: AppState) -> Router {
    let timeout = state.config.request_timeout();

    Router::new()
        .merge(api_routes())
        .merge(openapi::openapi_routes())
        // HTTP tracing layer for consistent request/response telemetry
        .layer(crate::tracing::configure_http_tracing())
        .layer(TimeoutLayer::new(timeout))
        // Ensure every request carries a request id for traceability
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id::request_id_middleware,
        ))
        .with_state(state)
}

pub mod prelude {
    pub use crate::config::AppConfig;
    pub use crate::errors::{ServiceError, ServiceResult};
    pub use crate::models::*;
    pub use crate::provider::PaymentProvider;
    pub use crate::AppState;
}
