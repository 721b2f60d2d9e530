use axum::{routing::get, Json, Router};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Enrollment API",
        version = "0.1.0",
        description = r#"
# Course Enrollment API

Backend of the course enrollment funnel.

- **Course signup**: validate and store a lead, then start a hosted checkout
- **Checkout**: start a hosted checkout directly from the pricing page
- **Payment status**: poll the status of a payment intent after redirect-back

## Error Handling

Every error uses the same body. Validation failures list the offending fields:

```json
{
  "success": false,
  "error": "Bad Request",
  "message": "required fields missing",
  "errors": [{"field": "email", "message": "email is required"}],
  "requestId": "5f0c...",
  "timestamp": "2024-01-01T00:00:00Z"
}
```
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Course", description = "Lead capture"),
        (name = "Payment", description = "Checkout and payment status"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        crate::handlers::leads::join_course,
        crate::handlers::payments::payment_status,
        crate::handlers::payments::create_checkout_session,
        crate::handlers::health::liveness_check,
        crate::handlers::health::readiness_check,
    ),
    components(
        schemas(
            crate::models::LeadSubmission,
            crate::models::PaymentStatus,
            crate::handlers::leads::JoinResponse,
            crate::handlers::payments::PaymentStatusResponse,
            crate::handlers::payments::CreateCheckoutRequest,
            crate::handlers::payments::CreateCheckoutResponse,
            crate::errors::ErrorResponse,
            crate::errors::FieldError
        )
    )
)]
pub struct ApiDoc;

/// Serves the generated document at `/api-docs/openapi.json`.
pub fn openapi_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route(
        "/api-docs/openapi.json",
        get(|| async { Json(ApiDoc::openapi()) }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_public_endpoints() {
        let json = serde_json::to_string(&ApiDoc::openapi()).unwrap();
        assert!(json.contains("/course/join"));
        assert!(json.contains("/payment/status"));
        assert!(json.contains("/payment/create-checkout-session"));
        assert!(json.contains("ErrorResponse"));
    }
}
