#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use enrollment_api::{
    config::AppConfig, db, provider::InMemoryPaymentProvider, webhooks::SpreadsheetRelay,
    AppState,
};
use serde_json::Value;
use tower::ServiceExt;

/// A payment intent id that passes reference validation.
pub const PAYMENT_INTENT_ID: &str = "pi_3NkXwTLkdIwHu7ix0abcDEF1";

/// Helper harness for spinning up the application backed by an in-memory
/// SQLite database and the in-memory payment provider.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub provider: InMemoryPaymentProvider,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Like [`TestApp::new`], after `configure` adjusts the configuration.
    pub async fn with_config(configure: impl FnOnce(&mut AppConfig)) -> Self {
        Self::build(configure, SpreadsheetRelay::disabled()).await
    }

    pub async fn with_relay(relay: SpreadsheetRelay) -> Self {
        Self::build(|_| {}, relay).await
    }

    async fn build(configure: impl FnOnce(&mut AppConfig), relay: SpreadsheetRelay) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        // every sqlite::memory: connection is its own database
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.payment.backend = "in-memory".to_string();
        cfg.payment.retry_backoff_ms = 1;
        configure(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let provider = InMemoryPaymentProvider::seeded(&cfg.pricing.tiers, &cfg.pricing.currency);
        let state = AppState::new(cfg, Arc::new(pool), Arc::new(provider.clone()), relay);
        let router = enrollment_api::build_app(state.clone());

        Self {
            router,
            state,
            provider,
        }
    }

    /// Send a request against the router, with a JSON body when given.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        self.send(builder.body(body).expect("failed to build request"))
            .await
    }

    /// Send a prepared request.
    pub async fn send(&self, request: Request<Body>) -> axum::response::Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Send a request and decode the JSON response.
    pub async fn request_json(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let response = self.request(method, uri, body).await;
        let status = response.status();
        (status, json_body(response).await)
    }
}

pub async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    serde_json::from_slice(&bytes).expect("response body is not JSON")
}
