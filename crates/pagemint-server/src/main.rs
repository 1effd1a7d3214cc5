//! PageMint HTTP Server
//!
//! Axum-based server for checkout, payment verification, Stripe webhooks
//! and tokenized template downloads.

mod handlers;
mod router;
mod state;

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pagemint_delivery::{
    DeliveryConfig, DeliveryStore, LogMailer, Mailer, MemoryDeliveryStore, PaymentGateway,
    ResendMailer, StripeClient, SupabaseStore,
};

use crate::router::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(DeliveryConfig::from_env()?);
    tracing::info!(
        site_url = %config.site_url,
        ttl_hours = config.download_ttl.num_hours(),
        max_downloads = config.max_downloads,
        "Delivery configured"
    );

    // Storage
    let store: Arc<dyn DeliveryStore> = match SupabaseStore::from_env() {
        Ok(store) => {
            tracing::info!("✓ Supabase storage configured");
            Arc::new(store)
        }
        Err(_) => {
            tracing::warn!("⚠ Supabase not configured - using in-memory storage");
            Arc::new(MemoryDeliveryStore::new())
        }
    };

    // Email
    let mailer: Arc<dyn Mailer> = match ResendMailer::from_env() {
        Ok(mailer) => {
            tracing::info!("✓ Resend email configured");
            Arc::new(mailer)
        }
        Err(_) => {
            tracing::warn!("⚠ RESEND_API_KEY not set - delivery emails are simulated");
            Arc::new(LogMailer)
        }
    };

    // Payments
    let stripe = StripeClient::from_env().ok();
    let webhook_secret = stripe
        .as_ref()
        .map(|s| s.webhook_secret().to_string())
        .filter(|s| !s.is_empty());

    if stripe.is_some() {
        tracing::info!("✓ Stripe configured");
    } else {
        tracing::warn!("⚠ Stripe not configured - payments disabled");
        tracing::warn!("  Set STRIPE_SECRET_KEY and STRIPE_WEBHOOK_SECRET in .env");
    }

    let gateway = stripe.map(|s| Arc::new(s) as Arc<dyn PaymentGateway>);
    let state = AppState::new(config, store, mailer, gateway, webhook_secret);
    let app = build_router(state);

    // Start server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🚀 pagemint-server running on http://{}", addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health                          - Health check");
    tracing::info!("  POST /api/create-checkout             - Create Stripe checkout");
    tracing::info!("  POST /api/verify-payment              - Verify checkout session");
    tracing::info!("  GET  /api/delivery/{{session_id}}       - Delivery status");
    tracing::info!("  POST /api/delivery/{{session_id}}/resend - Re-send delivery email");
    tracing::info!("  GET  /api/download/{{token}}/{{file}}     - Redeem download token");
    tracing::info!("  POST /webhook/stripe                  - Stripe webhook");

    axum::serve(listener, app).await?;

    Ok(())
}
