//! Route table

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers::{
    create_checkout, delivery_status, download, health_check, resend_delivery_email,
    stripe_webhook, verify_payment,
};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        // Checkout & verification
        .route("/api/create-checkout", post(create_checkout))
        .route("/api/verify-payment", post(verify_payment))
        .route("/api/delivery/{session_id}", get(delivery_status))
        .route("/api/delivery/{session_id}/resend", post(resend_delivery_email))
        // Downloads
        .route("/api/download/{token}/{filename}", get(download))
        // Stripe
        .route("/webhook/stripe", post(stripe_webhook))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
