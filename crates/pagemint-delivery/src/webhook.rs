//! Stripe Webhook Handling
//!
//! Verifies `Stripe-Signature` headers and routes checkout events into the
//! fulfillment service. Stripe retries deliveries that fail, so handling is
//! idempotent and only retryable failures are reported back as errors.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;

use crate::error::{DeliveryError, Result};
use crate::fulfillment::FulfillmentService;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed payload, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Allowed clock skew for timestamps from the future, in seconds
const FUTURE_SKEW_SECS: i64 = 60;

/// Verify a `t=<unix>,v1=<hex>` signature header against the raw body
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| DeliveryError::WebhookSignature("missing timestamp".into()))?;
    if signatures.is_empty() {
        return Err(DeliveryError::WebhookSignature("missing v1 signature".into()));
    }

    let signed_at: i64 = timestamp
        .parse()
        .map_err(|_| DeliveryError::WebhookSignature("malformed timestamp".into()))?;
    let age = now.timestamp().checked_sub(signed_at);
    if !age.is_some_and(|age| (-FUTURE_SKEW_SECS..=SIGNATURE_TOLERANCE_SECS).contains(&age)) {
        return Err(DeliveryError::WebhookSignature(
            "timestamp outside tolerance".into(),
        ));
    }

    let matches = signatures.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    });

    if matches {
        Ok(())
    } else {
        Err(DeliveryError::WebhookSignature("signature mismatch".into()))
    }
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

/// Parsed webhook event
#[derive(Clone, Debug, PartialEq)]
pub enum WebhookEvent {
    /// `checkout.session.completed`
    CheckoutCompleted {
        session_id: String,
        payment_status: String,
        customer_email: Option<String>,
    },

    /// `checkout.session.async_payment_succeeded`
    AsyncPaymentSucceeded {
        session_id: String,
        customer_email: Option<String>,
    },

    /// `checkout.session.async_payment_failed` or `checkout.session.expired`
    CheckoutFailed { session_id: String, reason: String },

    /// Unhandled event type
    Other { event_type: String },
}

impl WebhookEvent {
    /// Parse a Stripe event body
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let raw: RawEvent = serde_json::from_slice(payload)
            .map_err(|e| DeliveryError::WebhookParse(e.to_string()))?;
        tracing::debug!(event_id = %raw.id, event_type = %raw.event_type, "Parsed Stripe event");

        let object = &raw.data.object;
        let session_id = || -> Result<String> {
            object
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| DeliveryError::WebhookParse("checkout session without id".into()))
        };
        let customer_email = || {
            object
                .pointer("/customer_details/email")
                .and_then(|v| v.as_str())
                .or_else(|| object.get("customer_email").and_then(|v| v.as_str()))
                .map(str::to_string)
        };

        let event = match raw.event_type.as_str() {
            "checkout.session.completed" => WebhookEvent::CheckoutCompleted {
                session_id: session_id()?,
                payment_status: object
                    .get("payment_status")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                customer_email: customer_email(),
            },
            "checkout.session.async_payment_succeeded" => WebhookEvent::AsyncPaymentSucceeded {
                session_id: session_id()?,
                customer_email: customer_email(),
            },
            "checkout.session.async_payment_failed" => WebhookEvent::CheckoutFailed {
                session_id: session_id()?,
                reason: "async_payment_failed".into(),
            },
            "checkout.session.expired" => WebhookEvent::CheckoutFailed {
                session_id: session_id()?,
                reason: "expired".into(),
            },
            other => WebhookEvent::Other {
                event_type: other.to_string(),
            },
        };

        Ok(event)
    }
}

/// What the handler did with an event
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Fulfilled {
        session_id: String,
        already_fulfilled: bool,
    },
    /// Completed checkout still awaiting an async payment
    Deferred {
        session_id: String,
        payment_status: String,
    },
    MarkedFailed { session_id: String },
    /// Fulfillment failed for a reason a retry will not fix
    FulfillmentFailed { session_id: String, error: String },
    Ignored { event_type: String },
}

/// Webhook handler
pub struct WebhookHandler {
    fulfillment: Arc<FulfillmentService>,
    secret: String,
}

impl WebhookHandler {
    pub fn new(fulfillment: Arc<FulfillmentService>, secret: impl Into<String>) -> Self {
        Self {
            fulfillment,
            secret: secret.into(),
        }
    }

    /// Verify the signature header and parse the event
    pub fn parse_event(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent> {
        verify_signature(payload, signature, &self.secret, Utc::now())?;
        WebhookEvent::parse(payload)
    }

    /// Process a webhook event
    ///
    /// Returns an error only when Stripe should retry the delivery.
    pub async fn handle(&self, event: WebhookEvent) -> Result<WebhookOutcome> {
        match event {
            WebhookEvent::CheckoutCompleted {
                session_id,
                payment_status,
                customer_email,
            } => {
                if payment_status != "paid" {
                    tracing::info!(
                        session_id = %session_id,
                        payment_status = %payment_status,
                        "Checkout completed; awaiting payment"
                    );
                    return Ok(WebhookOutcome::Deferred {
                        session_id,
                        payment_status,
                    });
                }
                self.fulfill(session_id, customer_email).await
            }

            WebhookEvent::AsyncPaymentSucceeded {
                session_id,
                customer_email,
            } => self.fulfill(session_id, customer_email).await,

            WebhookEvent::CheckoutFailed { session_id, reason } => {
                tracing::warn!(session_id = %session_id, reason = %reason, "Checkout failed");
                self.fulfillment.mark_failed(&session_id).await?;
                Ok(WebhookOutcome::MarkedFailed { session_id })
            }

            WebhookEvent::Other { event_type } => {
                tracing::debug!(event_type = %event_type, "Unhandled webhook event");
                Ok(WebhookOutcome::Ignored { event_type })
            }
        }
    }

    async fn fulfill(
        &self,
        session_id: String,
        customer_email: Option<String>,
    ) -> Result<WebhookOutcome> {
        match self.fulfillment.fulfill(&session_id).await {
            Ok(fulfillment) => Ok(WebhookOutcome::Fulfilled {
                session_id,
                already_fulfilled: fulfillment.already_fulfilled,
            }),
            Err(e) => {
                tracing::error!(
                    session_id = %session_id,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Webhook fulfillment failed"
                );

                let recipient = customer_email
                    .unwrap_or_else(|| self.fulfillment.config().support_email.clone());
                self.fulfillment
                    .notifier()
                    .report_failure(&recipient, &e)
                    .await;

                if e.is_retryable() {
                    return Err(e);
                }
                Ok(WebhookOutcome::FulfillmentFailed {
                    session_id,
                    error: e.to_string(),
                })
            }
        }
    }
}
