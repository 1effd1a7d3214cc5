//! # pagemint-delivery
//!
//! Checkout, payment verification and secure download delivery for PageMint
//! template packs.
//!
//! ## Flow
//!
//! ```text
//! ┌────────────┐   ┌─────────────────┐   ┌──────────────────┐   ┌──────────────┐
//! │  Checkout  │──▶│ Stripe (hosted) │──▶│ Webhook / success│──▶│ Fulfillment  │
//! │  creator   │   │  checkout page  │   │  page verify     │   │ token + email│
//! └────────────┘   └─────────────────┘   └──────────────────┘   └──────┬───────┘
//!                                                                      │
//!                                     ┌────────────────────────────────┘
//!                                     ▼
//!                        /api/download/{token}/{file} ──▶ redeem ──▶ 302
//! ```
//!
//! Fulfillment is idempotent per checkout session: the webhook and the
//! success page may both trigger it and the buyer still gets one token and
//! one email. Redemption is atomic in the store, so a token's download limit
//! holds under concurrent requests.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pagemint_delivery::*;
//! use std::sync::Arc;
//!
//! let config = Arc::new(DeliveryConfig::from_env()?);
//! let store = Arc::new(MemoryDeliveryStore::new());
//! let fulfillment = FulfillmentService::new(
//!     Arc::new(StripeClient::from_env()?),
//!     store.clone(),
//!     Arc::new(LogMailer),
//!     config.clone(),
//! );
//!
//! let delivery = fulfillment.fulfill("cs_test_123").await?;
//! for link in &delivery.links {
//!     println!("{} -> {}", link.name, link.secure_url);
//! }
//! ```

mod catalog;
mod checkout;
mod config;
mod delivery;
mod error;
mod fulfillment;
mod notify;
mod redeem;
mod store;
mod supabase;
mod token;
mod verify;
mod webhook;

pub use catalog::{DeliverableFile, FileKind, Product, TROUBLESHOOTING_TIPS};
pub use checkout::{
    CheckoutRequest, CheckoutSession, GatewaySession, MockGateway, PaymentGateway, StripeClient,
};
pub use config::{DeliveryConfig, PriceCatalog};
pub use delivery::{
    DeliveryRecord, DownloadAnalyticsEvent, DownloadLink, EmailLogEntry, EmailStatus, EmailType,
    Order, OrderStatus, Redemption, TokenState,
};
pub use error::{DeliveryError, Result};
pub use fulfillment::{DeliveryStatus, Fulfillment, FulfillmentService, StartCheckout};
pub use notify::{
    DeliveryEmail, EmailContext, EmailOutcome, LogMailer, Mailer, NotificationDispatcher,
    ResendMailer, SendReceipt, delivery_subject, render_delivery_email,
};
pub use redeem::{DownloadService, GrantedDownload, Requester};
pub use store::{DeliveryStore, MemoryDeliveryStore};
pub use supabase::{SCHEMA_SQL, SupabaseStore};
pub use token::{DownloadToken, IssuedToken, TokenIssuer, TokenRejection};
pub use verify::{PaymentVerification, PaymentVerifier};
pub use webhook::{
    SIGNATURE_TOLERANCE_SECS, WebhookEvent, WebhookHandler, WebhookOutcome, verify_signature,
};
