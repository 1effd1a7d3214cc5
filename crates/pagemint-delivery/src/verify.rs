//! Payment Verification
//!
//! Read-only confirmation that a checkout session was paid, normalized for
//! the success page and the fulfillment path.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::Product;
use crate::checkout::{GatewaySession, PaymentGateway};
use crate::config::PriceCatalog;
use crate::error::{DeliveryError, Result};

/// Metadata keys checked, in order, for the purchased product
const PRODUCT_METADATA_KEYS: [&str; 3] = ["product_id", "priceId", "stripe_price_id"];

/// Normalized verification result
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentVerification {
    pub success: bool,
    pub session_id: String,
    pub customer_email: Option<String>,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub product_id: Option<Product>,
    pub payment_status: String,
    pub metadata: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PaymentVerification {
    /// Build the result from the gateway's session view
    ///
    /// `success` is true only for a "paid" session, whatever the metadata says.
    pub fn from_session(session: GatewaySession, prices: &PriceCatalog) -> Self {
        let success = session.is_paid();
        let product_id = resolve_product(&session.metadata, prices);

        Self {
            success,
            error: (!success).then(|| "Payment not completed".to_string()),
            session_id: session.id,
            customer_email: session.customer_email,
            amount_total: session.amount_total,
            currency: session.currency,
            product_id,
            payment_status: session.payment_status,
            metadata: session.metadata,
        }
    }

    /// Purchased product, required once payment is confirmed
    pub fn product(&self) -> Result<Product> {
        self.product_id.ok_or_else(|| {
            DeliveryError::UnknownProduct(format!(
                "no product in metadata of session {}",
                self.session_id
            ))
        })
    }
}

/// First metadata value that names a catalog product or configured price
fn resolve_product(metadata: &HashMap<String, String>, prices: &PriceCatalog) -> Option<Product> {
    PRODUCT_METADATA_KEYS
        .iter()
        .filter_map(|key| metadata.get(*key))
        .find_map(|value| prices.resolve(value).ok())
}

/// Confirms checkout sessions against the payment gateway
#[derive(Clone)]
pub struct PaymentVerifier {
    gateway: Arc<dyn PaymentGateway>,
    prices: PriceCatalog,
}

impl PaymentVerifier {
    pub fn new(gateway: Arc<dyn PaymentGateway>, prices: PriceCatalog) -> Self {
        Self { gateway, prices }
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    /// Verify a session id taken from the success redirect
    ///
    /// Unpaid sessions yield `success: false`; unknown sessions and gateway
    /// failures are errors.
    pub async fn verify(&self, session_id: &str) -> Result<PaymentVerification> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(DeliveryError::Validation("Session ID is required".into()));
        }

        let session = self.gateway.retrieve_session(session_id).await?;
        let verification = PaymentVerification::from_session(session, &self.prices);

        tracing::info!(
            session_id = %verification.session_id,
            payment_status = %verification.payment_status,
            success = verification.success,
            product = ?verification.product_id,
            "Verified checkout session"
        );

        Ok(verification)
    }
}
