//! Stripe Checkout Integration
//!
//! Hosted Checkout in one-time `payment` mode. The `PaymentGateway` trait
//! keeps the rest of the pipeline independent of the Stripe SDK; tests and
//! local demos use `MockGateway`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use stripe::{
    CheckoutSession as StripeCheckoutSession, CheckoutSessionId, CheckoutSessionMode, Client,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCustomer, Customer, CustomerId,
    ListCustomers, StripeError,
};

use crate::catalog::Product;
use crate::error::{DeliveryError, Result};

/// Request to create a checkout session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutRequest {
    /// Stripe price id to charge
    pub price_id: String,

    /// Product being purchased, recorded in session metadata
    pub product: Product,

    /// Prefill for the checkout form
    #[serde(default)]
    pub customer_email: Option<String>,

    /// Existing gateway customer to attach; takes the place of the email prefill
    #[serde(default)]
    pub customer_id: Option<String>,

    /// URL to redirect after successful payment
    pub success_url: String,

    /// URL to redirect if checkout is cancelled
    pub cancel_url: String,
}

/// Result of creating a checkout session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// Stripe session ID
    pub id: String,

    /// URL to redirect user to
    pub checkout_url: String,
}

/// Gateway-side view of a checkout session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatewaySession {
    pub id: String,
    pub payment_status: String,
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl GatewaySession {
    pub fn is_paid(&self) -> bool {
        self.payment_status == "paid"
    }
}

/// Payment gateway trait (Strategy pattern)
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a hosted checkout session
    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutSession>;

    /// Find the customer with this email, creating one if there is none
    async fn customer_for_email(&self, email: &str) -> Result<String>;

    /// Retrieve a checkout session; `SessionNotFound` if it does not exist
    async fn retrieve_session(&self, session_id: &str) -> Result<GatewaySession>;

    /// Gateway name
    fn name(&self) -> &str;
}

/// Stripe client wrapper
pub struct StripeClient {
    client: Client,
    webhook_secret: String,
}

impl StripeClient {
    /// Create a new Stripe client
    pub fn new(secret_key: &str, webhook_secret: &str) -> Self {
        Self {
            client: Client::new(secret_key),
            webhook_secret: webhook_secret.to_string(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| DeliveryError::Config("STRIPE_SECRET_KEY not set".into()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| DeliveryError::Config("STRIPE_WEBHOOK_SECRET not set".into()))?;

        Ok(Self::new(&secret_key, &webhook_secret))
    }

    /// Get the webhook secret
    pub fn webhook_secret(&self) -> &str {
        &self.webhook_secret
    }
}

fn is_not_found(err: &StripeError) -> bool {
    matches!(err, StripeError::Stripe(request) if request.http_status == 404)
}

#[async_trait]
impl PaymentGateway for StripeClient {
    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutSession> {
        let customer = request
            .customer_id
            .as_deref()
            .map(str::parse::<CustomerId>)
            .transpose()
            .map_err(|_| DeliveryError::Gateway("invalid customer id".into()))?;

        let mut params = CreateCheckoutSession::new();
        // Stripe accepts either a customer or an email prefill, not both
        match customer {
            Some(customer) => params.customer = Some(customer),
            None => params.customer_email = request.customer_email.as_deref(),
        }
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.mode = Some(CheckoutSessionMode::Payment);
        params.allow_promotion_codes = Some(true);

        // Metadata drives product resolution during fulfillment
        let mut metadata = HashMap::new();
        metadata.insert("priceId".to_string(), request.price_id.clone());
        metadata.insert("product_id".to_string(), request.product.as_str().to_string());
        if let Some(ref email) = request.customer_email {
            metadata.insert("customer_email".to_string(), email.clone());
        }
        params.metadata = Some(metadata);

        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);

        let session = StripeCheckoutSession::create(&self.client, params)
            .await
            .map_err(|e| DeliveryError::Gateway(e.to_string()))?;

        let checkout_url = session
            .url
            .ok_or_else(|| DeliveryError::Gateway("No checkout URL returned".into()))?;

        Ok(CheckoutSession {
            id: session.id.to_string(),
            checkout_url,
        })
    }

    async fn customer_for_email(&self, email: &str) -> Result<String> {
        let mut query = ListCustomers::new();
        query.email = Some(email);
        query.limit = Some(1);

        let existing = Customer::list(&self.client, &query)
            .await
            .map_err(|e| DeliveryError::Gateway(e.to_string()))?;

        if let Some(customer) = existing.data.into_iter().next() {
            tracing::debug!(customer_id = %customer.id, "Reusing Stripe customer");
            return Ok(customer.id.to_string());
        }

        let mut params = CreateCustomer::new();
        params.email = Some(email);
        params.metadata = Some(HashMap::from([(
            "source".to_string(),
            "pagemint_website".to_string(),
        )]));

        let customer = Customer::create(&self.client, params)
            .await
            .map_err(|e| DeliveryError::Gateway(e.to_string()))?;
        tracing::info!(customer_id = %customer.id, "Stripe customer created");

        Ok(customer.id.to_string())
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<GatewaySession> {
        let id: CheckoutSessionId = session_id
            .parse()
            .map_err(|_| DeliveryError::SessionNotFound(session_id.to_string()))?;

        let session = StripeCheckoutSession::retrieve(&self.client, &id, &[])
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    DeliveryError::SessionNotFound(session_id.to_string())
                } else {
                    DeliveryError::Gateway(e.to_string())
                }
            })?;

        let customer_email = session
            .customer_details
            .as_ref()
            .and_then(|d| d.email.clone())
            .or_else(|| session.customer_email.clone());

        Ok(GatewaySession {
            id: session.id.to_string(),
            payment_status: session.payment_status.as_str().to_string(),
            customer_email,
            customer_id: session.customer.as_ref().map(|c| c.id().to_string()),
            amount_total: session.amount_total,
            currency: session.currency.map(|c| c.to_string()),
            metadata: session.metadata.clone().unwrap_or_default(),
        })
    }

    fn name(&self) -> &str {
        "stripe"
    }
}

/// In-memory gateway with scripted sessions (for testing and demos)
pub struct MockGateway {
    sessions: RwLock<HashMap<String, GatewaySession>>,
    /// Customer ids by email
    customers: RwLock<HashMap<String, String>>,
    unavailable: std::sync::atomic::AtomicBool,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            customers: RwLock::new(HashMap::new()),
            unavailable: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Register or replace a session
    pub fn insert(&self, session: GatewaySession) -> Result<()> {
        self.sessions.write()?.insert(session.id.clone(), session);
        Ok(())
    }

    /// Register a paid session for a product
    pub fn insert_paid(&self, session_id: &str, product: Product, email: &str) -> Result<()> {
        let mut metadata = HashMap::new();
        metadata.insert("priceId".to_string(), product.as_str().to_string());

        self.insert(GatewaySession {
            id: session_id.to_string(),
            payment_status: "paid".into(),
            customer_email: Some(email.to_string()),
            customer_id: None,
            amount_total: Some(product.price_cents()),
            currency: Some("usd".into()),
            metadata,
        })
    }

    /// Simulate a gateway outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable
            .store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DeliveryError::Gateway("mock gateway unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutSession> {
        self.check_available()?;

        let id = format!("cs_test_{}", uuid::Uuid::new_v4().simple());
        let mut metadata = HashMap::new();
        metadata.insert("priceId".to_string(), request.price_id.clone());
        metadata.insert("product_id".to_string(), request.product.as_str().to_string());

        self.insert(GatewaySession {
            id: id.clone(),
            payment_status: "unpaid".into(),
            customer_email: request.customer_email.clone(),
            customer_id: request.customer_id.clone(),
            amount_total: Some(request.product.price_cents()),
            currency: Some("usd".into()),
            metadata,
        })?;

        Ok(CheckoutSession {
            checkout_url: format!("https://checkout.stripe.com/c/pay/{id}"),
            id,
        })
    }

    async fn customer_for_email(&self, email: &str) -> Result<String> {
        self.check_available()?;

        let mut customers = self.customers.write()?;
        let id = customers
            .entry(email.to_string())
            .or_insert_with(|| format!("cus_test_{}", uuid::Uuid::new_v4().simple()));
        Ok(id.clone())
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<GatewaySession> {
        self.check_available()?;

        self.sessions
            .read()?
            .get(session_id)
            .cloned()
            .ok_or_else(|| DeliveryError::SessionNotFound(session_id.to_string()))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CheckoutRequest {
        CheckoutRequest {
            price_id: "price_pro".into(),
            product: Product::ProPack,
            customer_email: Some("buyer@example.com".into()),
            customer_id: None,
            success_url: "https://pagemint.com/success".into(),
            cancel_url: "https://pagemint.com/cancel".into(),
        }
    }

    #[tokio::test]
    async fn test_mock_checkout_creates_unpaid_session() {
        let gateway = MockGateway::new();
        let session = gateway.create_checkout(&request()).await.unwrap();

        assert!(session.id.starts_with("cs_test_"));
        assert!(session.checkout_url.ends_with(&session.id));

        let stored = gateway.retrieve_session(&session.id).await.unwrap();
        assert!(!stored.is_paid());
        assert_eq!(stored.metadata.get("product_id").map(String::as_str), Some("PRO_PACK"));
    }

    #[tokio::test]
    async fn test_mock_customer_reused_by_email() {
        let gateway = MockGateway::new();
        let first = gateway.customer_for_email("buyer@example.com").await.unwrap();
        let again = gateway.customer_for_email("buyer@example.com").await.unwrap();
        let other = gateway.customer_for_email("other@example.com").await.unwrap();

        assert!(first.starts_with("cus_test_"));
        assert_eq!(first, again);
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn test_mock_unknown_session() {
        let gateway = MockGateway::new();
        let result = gateway.retrieve_session("cs_missing").await;
        assert!(matches!(result, Err(DeliveryError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_mock_outage() {
        let gateway = MockGateway::new();
        gateway.set_unavailable(true);
        let result = gateway.retrieve_session("cs_any").await;
        assert!(matches!(result, Err(DeliveryError::Gateway(_))));
    }
}
