//! HTTP Handlers

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use pagemint_delivery::{
    DeliveryError, DeliveryStatus, DownloadLink, EmailOutcome, EmailStatus, FulfillmentService,
    PaymentVerification, Requester, StartCheckout, WebhookOutcome,
};

use crate::state::AppState;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub stripe_configured: bool,
    pub webhooks_configured: bool,
    pub store: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentRequest {
    #[serde(default)]
    pub session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentResponse {
    #[serde(flatten)]
    pub verification: PaymentVerification,
    pub has_delivery: bool,
    pub files: Vec<DownloadLink>,
}

/// Failure body for the verify endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyFailure {
    pub success: bool,
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(flatten)]
    pub outcome: WebhookOutcome,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Download endpoint error body for every rejected token
const DOWNLOAD_REJECTED: &str = "Download link expired or invalid";

// ============================================================================
// Error Mapping
// ============================================================================

/// HTTP status for a pipeline error
pub fn status_code(error: &DeliveryError) -> StatusCode {
    match error {
        DeliveryError::Validation(_)
        | DeliveryError::PaymentNotCompleted { .. }
        | DeliveryError::TokenRejected(_)
        | DeliveryError::WebhookSignature(_)
        | DeliveryError::WebhookParse(_)
        | DeliveryError::Json(_) => StatusCode::BAD_REQUEST,
        DeliveryError::UnknownProduct(_)
        | DeliveryError::SessionNotFound(_)
        | DeliveryError::DeliveryNotFound(_)
        | DeliveryError::FileNotFound(_) => StatusCode::NOT_FOUND,
        DeliveryError::DeliveryExists(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(error: &DeliveryError) -> ApiError {
    let status = status_code(error);
    if status.is_server_error() {
        tracing::error!(error = %error, code = error.code(), "Request failed");
    } else {
        tracing::debug!(error = %error, code = error.code(), "Request rejected");
    }

    (
        status,
        Json(ErrorResponse {
            error: error.user_message(),
            code: error.code().to_string(),
        }),
    )
}

/// Malformed or non-JSON request body
fn invalid_body(rejection: &JsonRejection) -> ApiError {
    tracing::debug!(error = %rejection.body_text(), "Invalid request body");
    (
        rejection.status(),
        Json(ErrorResponse {
            error: format!("Invalid request body: {}", rejection.body_text()),
            code: "INVALID_BODY".into(),
        }),
    )
}

fn payments_disabled() -> ApiError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: "Payments not configured".into(),
            code: "PAYMENTS_DISABLED".into(),
        }),
    )
}

fn fulfillment(state: &AppState) -> Result<&Arc<FulfillmentService>, ApiError> {
    state.fulfillment.as_ref().ok_or_else(payments_disabled)
}

/// Client details from proxy headers
fn requester(headers: &HeaderMap) -> Requester {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let ip_address = header_value("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .or_else(|| header_value("client-ip"))
        .map(str::to_string);

    Requester {
        user_agent: header_value(header::USER_AGENT.as_str()).map(str::to_string),
        ip_address,
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        stripe_configured: state.fulfillment.is_some(),
        webhooks_configured: state.webhooks.is_some(),
        store: state.store.name().to_string(),
    })
}

/// Create Stripe checkout session
pub async fn create_checkout(
    State(state): State<AppState>,
    payload: Result<Json<StartCheckout>, JsonRejection>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let service = fulfillment(&state)?;
    let Json(payload) = payload.map_err(|e| invalid_body(&e))?;

    let session = service
        .start_checkout(payload)
        .await
        .map_err(|e| api_error(&e))?;

    Ok(Json(CheckoutResponse {
        session_id: session.id,
        url: session.checkout_url,
    }))
}

/// Verify a checkout session from the success page
///
/// A paid session is fulfilled on the spot (idempotently), so the page can
/// show download links even if the webhook has not arrived yet.
pub async fn verify_payment(
    State(state): State<AppState>,
    payload: Result<Json<VerifyPaymentRequest>, JsonRejection>,
) -> Result<Json<VerifyPaymentResponse>, (StatusCode, Json<VerifyFailure>)> {
    let without_session = |(status, Json(body)): ApiError| {
        (
            status,
            Json(VerifyFailure {
                success: false,
                error: body.error,
                code: body.code,
                session_id: None,
            }),
        )
    };
    let service = fulfillment(&state).map_err(without_session)?;
    let Json(payload) = payload.map_err(|e| without_session(invalid_body(&e)))?;

    let failure = |e: &DeliveryError| {
        let (status, Json(body)) = api_error(e);
        (
            status,
            Json(VerifyFailure {
                success: false,
                error: body.error,
                code: body.code,
                session_id: (!payload.session_id.is_empty()).then(|| payload.session_id.clone()),
            }),
        )
    };

    let verification = service
        .verify(&payload.session_id)
        .await
        .map_err(|e| failure(&e))?;

    if !verification.success {
        return Err(failure(&DeliveryError::PaymentNotCompleted {
            session_id: verification.session_id,
            status: verification.payment_status,
        }));
    }

    let files = match service.fulfill(&verification.session_id).await {
        Ok(fulfillment) => fulfillment.links,
        Err(e) => {
            tracing::warn!(
                session_id = %verification.session_id,
                error = %e,
                "Verified payment could not be fulfilled"
            );
            Vec::new()
        }
    };

    Ok(Json(VerifyPaymentResponse {
        has_delivery: !files.is_empty(),
        verification,
        files,
    }))
}

/// Redeem a download token and redirect to the file
pub async fn download(
    State(state): State<AppState>,
    Path((token, filename)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let requester = requester(&headers);

    match state.downloads.redeem(&token, &filename, &requester).await {
        Ok(granted) => (
            StatusCode::FOUND,
            [
                (header::LOCATION, granted.location),
                (header::CACHE_CONTROL, "no-cache".to_string()),
            ],
        )
            .into_response(),
        Err(e @ (DeliveryError::TokenRejected(_) | DeliveryError::FileNotFound(_))) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: DOWNLOAD_REJECTED.into(),
                code: e.code().to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Download handler error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Download failed".into(),
                    code: e.code().to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Delivery summary for the success page
pub async fn delivery_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<DeliveryStatus>, ApiError> {
    let service = fulfillment(&state)?;

    service
        .delivery_status(&session_id)
        .await
        .map(Json)
        .map_err(|e| api_error(&e))
}

/// Re-send the delivery email for a fulfilled session
pub async fn resend_delivery_email(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<EmailOutcome>, ApiError> {
    let service = fulfillment(&state)?;

    let outcome = service
        .resend_email(&session_id)
        .await
        .map_err(|e| api_error(&e))?;

    if outcome.status == EmailStatus::Failed {
        return Err((
            StatusCode::BAD_GATEWAY,
            Json(ErrorResponse {
                error: "Failed to send delivery email".into(),
                code: "EMAIL_FAILED".into(),
            }),
        ));
    }

    Ok(Json(outcome))
}

/// Stripe webhook handler
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let handler = state.webhooks.as_ref().ok_or_else(payments_disabled)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "Missing Stripe signature".into(),
                    code: "MISSING_SIGNATURE".into(),
                }),
            )
        })?;

    let event = handler.parse_event(&body, signature).map_err(|e| {
        tracing::warn!(error = %e, "Webhook rejected");
        api_error(&e)
    })?;

    let outcome = handler.handle(event).await.map_err(|e| {
        tracing::error!(error = %e, "Webhook processing error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Webhook processing failed".into(),
                code: "WEBHOOK_ERROR".into(),
            }),
        )
    })?;

    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagemint_delivery::TokenRejection;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            status_code(&DeliveryError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_code(&DeliveryError::SessionNotFound("cs".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_code(&DeliveryError::TokenRejected(TokenRejection::Used)),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_code(&DeliveryError::Gateway("down".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_requester_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        headers.insert("client-ip", "198.51.100.2".parse().unwrap());
        headers.insert(header::USER_AGENT, "curl/8.0".parse().unwrap());

        let requester = requester(&headers);
        assert_eq!(requester.ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(requester.user_agent.as_deref(), Some("curl/8.0"));
    }

    #[test]
    fn test_requester_falls_back_to_client_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("client-ip", "198.51.100.2".parse().unwrap());
        assert_eq!(
            requester(&headers).ip_address.as_deref(),
            Some("198.51.100.2")
        );
        assert!(requester(&HeaderMap::new()).ip_address.is_none());
    }
}
