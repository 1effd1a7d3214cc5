//! Fulfillment
//!
//! The single server-side path from "checkout session paid" to "files
//! delivered". Webhooks and the success page both call `fulfill`, which is
//! idempotent per checkout session: a second call returns the delivery the
//! first one created instead of issuing another token or email.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::catalog::Product;
use crate::checkout::{CheckoutRequest, CheckoutSession, PaymentGateway};
use crate::config::DeliveryConfig;
use crate::delivery::{DeliveryRecord, DownloadLink, Order, OrderStatus, TokenState};
use crate::error::{DeliveryError, Result};
use crate::notify::{
    render_delivery_email, EmailContext, EmailOutcome, Mailer, NotificationDispatcher,
};
use crate::store::DeliveryStore;
use crate::token::TokenIssuer;
use crate::verify::{PaymentVerification, PaymentVerifier};

/// Placeholder Stripe substitutes with the real session id
const SESSION_ID_PLACEHOLDER: &str = "{CHECKOUT_SESSION_ID}";

/// Checkout input as received from the storefront
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCheckout {
    /// Stripe price id or catalog product id
    #[serde(default)]
    pub price_id: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub success_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
}

/// A completed (or previously completed) delivery
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fulfillment {
    pub delivery: DeliveryRecord,
    pub links: Vec<DownloadLink>,
    /// `None` when no email was attempted
    pub email: Option<EmailOutcome>,
    /// True when an earlier call already fulfilled this session
    pub already_fulfilled: bool,
}

/// Delivery summary for the success page
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStatus {
    pub session_id: String,
    pub product_id: Product,
    pub product_name: &'static str,
    pub customer_email: Option<String>,
    pub state: TokenState,
    pub download_count: u32,
    pub max_downloads: u32,
    pub remaining_downloads: u32,
    pub expires_at: DateTime<Utc>,
    pub files: Vec<DownloadLink>,
    pub download_instructions: &'static [&'static str],
    pub support_email: String,
}

/// Orchestrates checkout, verification, token issuance and notification
pub struct FulfillmentService {
    verifier: PaymentVerifier,
    issuer: TokenIssuer,
    store: Arc<dyn DeliveryStore>,
    notifier: NotificationDispatcher,
    config: Arc<DeliveryConfig>,
}

impl FulfillmentService {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn DeliveryStore>,
        mailer: Arc<dyn Mailer>,
        config: Arc<DeliveryConfig>,
    ) -> Self {
        Self {
            verifier: PaymentVerifier::new(gateway, config.prices.clone()),
            issuer: TokenIssuer::new(config.download_ttl),
            notifier: NotificationDispatcher::new(mailer, store.clone()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn notifier(&self) -> &NotificationDispatcher {
        &self.notifier
    }

    /// Create a hosted checkout session and record a pending order
    pub async fn start_checkout(&self, input: StartCheckout) -> Result<CheckoutSession> {
        let price_id = input.price_id.trim();
        if price_id.is_empty() {
            return Err(DeliveryError::Validation("Price ID is required".into()));
        }

        let product = self.config.prices.resolve(price_id)?;

        // A catalog id needs the configured Stripe price behind it
        let stripe_price = if price_id.parse::<Product>().is_ok() {
            self.config
                .prices
                .price_for(product)
                .ok_or_else(|| {
                    DeliveryError::Config(format!("No Stripe price configured for {product}"))
                })?
                .to_string()
        } else {
            price_id.to_string()
        };

        let customer_email = input
            .customer_email
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());

        let gateway = self.verifier.gateway();
        let customer_id = match customer_email.as_deref() {
            Some(email) => match gateway.customer_for_email(email).await {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!(error = %e, "Customer lookup failed; falling back to email prefill");
                    None
                }
            },
            None => None,
        };

        let request = CheckoutRequest {
            price_id: stripe_price,
            product,
            customer_email: customer_email.clone(),
            customer_id,
            success_url: input.success_url.unwrap_or_else(|| {
                self.config
                    .site_link(&format!("/success?session_id={SESSION_ID_PLACEHOLDER}"))
            }),
            cancel_url: input
                .cancel_url
                .unwrap_or_else(|| self.config.site_link("/cancel")),
        };

        let session = gateway.create_checkout(&request).await?;

        let mut order = Order::pending(&session.id, Some(product));
        order.customer_email = customer_email;
        self.store.save_order(&order).await?;

        tracing::info!(
            session_id = %session.id,
            product = %product,
            "Checkout session created"
        );

        Ok(session)
    }

    /// Read-only payment check for the success page
    pub async fn verify(&self, session_id: &str) -> Result<PaymentVerification> {
        self.verifier.verify(session_id).await
    }

    /// Turn a paid checkout session into a delivery
    pub async fn fulfill(&self, session_id: &str) -> Result<Fulfillment> {
        let verification = self.verifier.verify(session_id).await?;
        if !verification.success {
            return Err(DeliveryError::PaymentNotCompleted {
                session_id: verification.session_id,
                status: verification.payment_status,
            });
        }

        if let Some(existing) = self.store.delivery_for_session(&verification.session_id).await? {
            tracing::info!(
                session_id = %verification.session_id,
                delivery_id = %existing.id,
                "Session already fulfilled"
            );
            return Ok(self.existing(existing));
        }

        let product = verification.product()?;
        product.deliverables()?;

        let order = self.complete_order(&verification, product).await?;
        let customer_email = verification
            .customer_email
            .clone()
            .or(order.customer_email);

        let issued = self
            .issuer
            .issue(product, &verification.session_id, Utc::now());
        let delivery = DeliveryRecord::new(issued, customer_email, self.config.max_downloads);

        match self.store.create_delivery(&delivery).await {
            Ok(()) => {}
            Err(DeliveryError::DeliveryExists(_)) => {
                // Lost a race with a concurrent fulfillment of the same session
                let existing = self
                    .store
                    .delivery_for_session(&verification.session_id)
                    .await?
                    .ok_or_else(|| DeliveryError::DeliveryNotFound(verification.session_id.clone()))?;
                return Ok(self.existing(existing));
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            session_id = %delivery.session_id,
            delivery_id = %delivery.id,
            product = %product,
            expires_at = %delivery.expires_at,
            "Delivery issued"
        );

        let links = delivery.download_links(&self.config);
        let email = match delivery.customer_email.as_deref() {
            Some(to) => Some(self.send_delivery_email(to, &delivery, &links).await),
            None => {
                tracing::warn!(
                    session_id = %delivery.session_id,
                    "No customer email on session; skipping delivery email"
                );
                None
            }
        };

        Ok(Fulfillment {
            delivery,
            links,
            email,
            already_fulfilled: false,
        })
    }

    /// Send the delivery email again for an already fulfilled session
    ///
    /// The email is rendered from the stored delivery, so it carries the
    /// original token and expiry. Dead tokens are refused.
    pub async fn resend_email(&self, session_id: &str) -> Result<EmailOutcome> {
        let delivery = self
            .store
            .delivery_for_session(session_id)
            .await?
            .ok_or_else(|| DeliveryError::DeliveryNotFound(session_id.to_string()))?;

        let to = delivery.customer_email.as_deref().ok_or_else(|| {
            DeliveryError::Validation("No customer email on this delivery".into())
        })?;
        delivery
            .check_redeemable(Utc::now())
            .map_err(DeliveryError::TokenRejected)?;

        let links = delivery.download_links(&self.config);
        let outcome = self.send_delivery_email(to, &delivery, &links).await;
        tracing::info!(
            session_id,
            delivery_id = %delivery.id,
            status = ?outcome.status,
            "Delivery email re-sent"
        );

        Ok(outcome)
    }

    /// Delivery summary for a fulfilled session
    pub async fn delivery_status(&self, session_id: &str) -> Result<DeliveryStatus> {
        let delivery = self
            .store
            .delivery_for_session(session_id)
            .await?
            .ok_or_else(|| DeliveryError::DeliveryNotFound(session_id.to_string()))?;

        Ok(DeliveryStatus {
            session_id: delivery.session_id.clone(),
            product_id: delivery.product,
            product_name: delivery.product.display_name(),
            customer_email: delivery.customer_email.clone(),
            state: delivery.token_state(Utc::now()),
            download_count: delivery.download_count,
            max_downloads: delivery.max_downloads,
            remaining_downloads: delivery.remaining_downloads(),
            expires_at: delivery.expires_at,
            files: delivery.download_links(&self.config),
            download_instructions: delivery.product.download_instructions(),
            support_email: self.config.support_email.clone(),
        })
    }

    /// Mark a session's order failed (async payment failure, expiry)
    pub async fn mark_failed(&self, session_id: &str) -> Result<Option<Order>> {
        let Some(mut order) = self.store.get_order(session_id).await? else {
            tracing::debug!(session_id, "No order to mark failed");
            return Ok(None);
        };

        if order.status == OrderStatus::Completed {
            tracing::warn!(session_id, "Ignoring failure for completed order");
            return Ok(Some(order));
        }

        order.set_status(OrderStatus::Failed);
        self.store.save_order(&order).await?;
        tracing::info!(session_id, order_id = %order.id, "Order marked failed");

        Ok(Some(order))
    }

    async fn complete_order(
        &self,
        verification: &PaymentVerification,
        product: Product,
    ) -> Result<Order> {
        let mut order = match self.store.get_order(&verification.session_id).await? {
            Some(order) => order,
            None => Order::pending(&verification.session_id, Some(product)),
        };

        order.product = Some(product);
        if verification.customer_email.is_some() {
            order.customer_email = verification.customer_email.clone();
        }
        order.amount_total = verification.amount_total.or(order.amount_total);
        order.currency = verification.currency.clone().or(order.currency);
        order.set_status(OrderStatus::Completed);

        self.store.save_order(&order).await?;
        Ok(order)
    }

    async fn send_delivery_email(
        &self,
        to: &str,
        delivery: &DeliveryRecord,
        links: &[DownloadLink],
    ) -> EmailOutcome {
        let email = render_delivery_email(&EmailContext {
            customer_email: to,
            product: delivery.product,
            links,
            expires_at: delivery.expires_at,
            support_email: &self.config.support_email,
            now: Utc::now(),
        });
        self.notifier.dispatch(&email).await
    }

    fn existing(&self, delivery: DeliveryRecord) -> Fulfillment {
        Fulfillment {
            links: delivery.download_links(&self.config),
            delivery,
            email: None,
            already_fulfilled: true,
        }
    }
}
