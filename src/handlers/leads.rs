use super::common::{created_response, AppJson};
use crate::errors::ServiceError;
use crate::models::LeadSubmission;
use crate::validation::validate_lead;
use crate::AppState;
use axum::{extract::State, response::Response, routing::post, Router};
use serde::Serialize;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

/// Body of a successful course signup.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({
    "success": true,
    "leadId": "550e8400-e29b-41d4-a716-446655440000",
    "sessionId": "cs_test_a1b2c3",
    "checkoutUrl": "https://checkout.stripe.com/c/pay/cs_test_a1b2c3"
}))]
pub struct JoinResponse {
    pub success: bool,
    pub lead_id: Uuid,
    pub session_id: String,
    pub checkout_url: String,
}

pub fn lead_routes() -> Router<AppState> {
    Router::new().route("/join", post(join_course))
}

/// Capture a lead and start checkout for it
#[utoipa::path(
    post,
    path = "/course/join",
    request_body = LeadSubmission,
    responses(
        (status = 201, description = "Lead saved and checkout session created", body = JoinResponse,
            headers(("X-Request-Id" = String, description = "Unique request identifier"))
        ),
        (status = 400, description = "Missing or invalid fields", body = crate::errors::ErrorResponse),
        (status = 500, description = "Lead could not be saved", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment could not be started", body = crate::errors::ErrorResponse),
        (status = 504, description = "Payment provider timed out", body = crate::errors::ErrorResponse)
    ),
    tag = "Course"
)]
pub async fn join_course(
    State(state): State<AppState>,
    AppJson(submission): AppJson<LeadSubmission>,
) -> Result<Response, ServiceError> {
    let lead = validate_lead(&submission, &state.config.leads.test_email_rule)?;
    let record = state.lead_service.save_lead(lead).await?;

    let session = state
        .checkout_service
        .create_checkout_session(Some(&record), submission.promotion_code.as_deref())
        .await?;

    info!(lead_id = %record.id, session_id = %session.session_id, "Course signup completed");

    Ok(created_response(JoinResponse {
        success: true,
        lead_id: record.id,
        session_id: session.session_id,
        checkout_url: session.redirect_url,
    }))
}
