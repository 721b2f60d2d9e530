use super::common::{success_response, OptionalJson};
use crate::errors::ServiceError;
use crate::models::PaymentStatus;
use crate::validation::validate_email;
use crate::AppState;
use axum::{
    extract::{Query, State},
    response::Response,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct PaymentStatusParams {
    /// Payment intent id from the return URL
    #[param(example = "pi_3NkXwTLkdIwHu7ix0abcDEF1")]
    pub payment_intent_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[schema(example = json!({"success": true, "status": "succeeded"}))]
pub struct PaymentStatusResponse {
    pub success: bool,
    pub status: PaymentStatus,
}

/// Optional body of a pricing-page checkout.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({"promotionCode": "SAVE70", "email": "ada@example.com"}))]
pub struct CreateCheckoutRequest {
    pub promotion_code: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({
    "success": true,
    "sessionId": "cs_test_a1b2c3",
    "checkoutUrl": "https://checkout.stripe.com/c/pay/cs_test_a1b2c3"
}))]
pub struct CreateCheckoutResponse {
    pub success: bool,
    pub session_id: String,
    pub checkout_url: String,
}

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(payment_status))
        .route("/create-checkout-session", post(create_checkout_session))
}

/// Report the status of a payment intent
#[utoipa::path(
    get,
    path = "/payment/status",
    params(PaymentStatusParams),
    responses(
        (status = 200, description = "Current payment status", body = PaymentStatusResponse),
        (status = 400, description = "Malformed payment reference", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown payment intent", body = crate::errors::ErrorResponse),
        (status = 503, description = "Payment provider unavailable", body = crate::errors::ErrorResponse)
    ),
    tag = "Payment"
)]
pub async fn payment_status(
    State(state): State<AppState>,
    Query(params): Query<PaymentStatusParams>,
) -> Result<Response, ServiceError> {
    let reference = params.payment_intent_id.unwrap_or_default();
    let status = state.payment_status_service.status(&reference).await?;
    Ok(success_response(PaymentStatusResponse {
        success: true,
        status,
    }))
}

/// Start checkout without capturing a lead first
#[utoipa::path(
    post,
    path = "/payment/create-checkout-session",
    request_body(content = Option<CreateCheckoutRequest>, description = "Optional promotion code and email"),
    responses(
        (status = 200, description = "Checkout session created", body = CreateCheckoutResponse),
        (status = 400, description = "Invalid input", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment could not be started", body = crate::errors::ErrorResponse),
        (status = 504, description = "Payment provider timed out", body = crate::errors::ErrorResponse)
    ),
    tag = "Payment"
)]
pub async fn create_checkout_session(
    State(state): State<AppState>,
    OptionalJson(request): OptionalJson<CreateCheckoutRequest>,
) -> Result<Response, ServiceError> {
    let email = request
        .email
        .as_deref()
        .filter(|e| !e.trim().is_empty())
        .map(validate_email)
        .transpose()?;

    let session = state
        .checkout_service
        .create_guest_checkout_session(email, request.promotion_code.as_deref())
        .await?;

    Ok(success_response(CreateCheckoutResponse {
        success: true,
        session_id: session.session_id,
        checkout_url: session.redirect_url,
    }))
}
