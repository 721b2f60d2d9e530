mod common;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use common::{json_body, TestApp};
use enrollment_api::{
    config::TestEmailRule,
    provider::in_memory::ProviderFault,
    services::leads::{LeadStore, SeaOrmLeadStore},
};
use serde_json::json;
use uuid::Uuid;

fn signup() -> serde_json::Value {
    json!({
        "name": "  Ada Lovelace ",
        "email": "Ada@Example.COM",
        "phone": "+1 (555) 123-4567"
    })
}

async fn stored_leads(app: &TestApp) -> u64 {
    SeaOrmLeadStore::new(app.state.db.clone())
        .count()
        .await
        .expect("count leads")
}

#[tokio::test]
async fn join_saves_lead_and_returns_checkout() {
    let app = TestApp::new().await;

    let (status, body) = app
        .request_json(Method::POST, "/course/join", Some(signup()))
        .await;

    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["success"], true);
    assert!(body["sessionId"].as_str().unwrap().starts_with("cs_test_"));
    assert!(body["checkoutUrl"].as_str().unwrap().starts_with("https://"));

    let lead_id: Uuid = body["leadId"].as_str().unwrap().parse().unwrap();
    let record = app.state.lead_service.find_lead(lead_id).await.unwrap();
    assert_eq!(record.lead.name, "Ada Lovelace");
    assert_eq!(record.lead.email, "ada@example.com");

    let sessions = app.provider.sessions();
    assert_eq!(sessions.len(), 1);
    let request = &sessions[0].1;
    assert_eq!(request.customer_email.as_deref(), Some("ada@example.com"));
    assert_eq!(request.metadata.get("lead_id"), Some(&lead_id.to_string()));
}

#[tokio::test]
async fn join_forwards_canonical_promotion_code() {
    let app = TestApp::new().await;
    let mut body = signup();
    body["promotionCode"] = json!(" early36 ");
    body["utmSource"] = json!("newsletter");

    let (status, _) = app
        .request_json(Method::POST, "/course/join", Some(body))
        .await;

    assert_eq!(status, StatusCode::CREATED);
    let sessions = app.provider.sessions();
    assert_eq!(sessions[0].1.promotion_code.as_deref(), Some("EARLY36"));
}

#[tokio::test]
async fn missing_fields_are_reported_and_nothing_is_stored() {
    let app = TestApp::new().await;

    let (status, body) = app
        .request_json(
            Method::POST,
            "/course/join",
            Some(json!({"name": "Ada Lovelace", "email": "  "})),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "required fields missing");
    let fields: Vec<&str> = body["errors"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["field"].as_str().unwrap())
        .collect();
    assert_eq!(fields, vec!["email", "phone"]);

    assert_eq!(stored_leads(&app).await, 0);
    assert!(app.provider.sessions().is_empty());
}

#[tokio::test]
async fn invalid_fields_are_all_listed() {
    let app = TestApp::new().await;

    let (status, body) = app
        .request_json(
            Method::POST,
            "/course/join",
            Some(json!({"name": "A", "email": "not-an-email", "phone": "12"})),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Validation failed");
    assert_eq!(body["errors"].as_array().unwrap().len(), 3);
    assert_eq!(stored_leads(&app).await, 0);
}

#[tokio::test]
async fn non_json_body_is_an_input_shape_error() {
    let app = TestApp::new().await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/course/join")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from("name=Ada"))
        .unwrap();
    let response = app.send(request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("Unexpected input shape"));
}

#[tokio::test]
async fn configured_test_domains_are_rejected() {
    let app = TestApp::with_config(|cfg| {
        cfg.leads.test_email_rule = TestEmailRule::RejectDomains {
            domains: vec!["example.com".into()],
        };
    })
    .await;

    let (status, body) = app
        .request_json(Method::POST, "/course/join", Some(signup()))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"][0]["field"], "email");
}

#[tokio::test]
async fn duplicate_signups_are_kept() {
    let app = TestApp::new().await;

    for _ in 0..2 {
        let (status, _) = app
            .request_json(Method::POST, "/course/join", Some(signup()))
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    assert_eq!(stored_leads(&app).await, 2);
}

#[tokio::test]
async fn provider_rejection_hides_detail_but_keeps_lead() {
    let app = TestApp::new().await;
    let mut body = signup();
    body["promotionCode"] = json!("BOGUS");

    let (status, body) = app
        .request_json(Method::POST, "/course/join", Some(body))
        .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(
        body["message"],
        "Payment could not be started, please try again"
    );
    assert!(!body.to_string().contains("BOGUS"));
    assert!(body["requestId"].is_string());
    assert_eq!(stored_leads(&app).await, 1);
}

#[tokio::test]
async fn one_provider_timeout_is_absorbed_by_retry() {
    let app = TestApp::new().await;
    app.provider.push_checkout_fault(ProviderFault::Timeout);

    let (status, _) = app
        .request_json(Method::POST, "/course/join", Some(signup()))
        .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(app.provider.sessions().len(), 1);
}

#[tokio::test]
async fn persistent_provider_timeouts_surface_as_gateway_timeout() {
    let app = TestApp::new().await;
    app.provider.push_checkout_fault(ProviderFault::Timeout);
    app.provider.push_checkout_fault(ProviderFault::Timeout);

    let (status, body) = app
        .request_json(Method::POST, "/course/join", Some(signup()))
        .await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["success"], false);
}
