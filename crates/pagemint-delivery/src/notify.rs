//! Delivery Notifications
//!
//! Renders the "your templates are ready" email and hands it to a `Mailer`.
//! Sending is best-effort: a failure is logged and recorded in the email log
//! but never undoes token issuance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;

use crate::catalog::{Product, TROUBLESHOOTING_TIPS};
use crate::delivery::{DownloadLink, EmailLogEntry, EmailStatus, EmailType};
use crate::error::{DeliveryError, Result};
use crate::store::DeliveryStore;

const RESEND_API_URL: &str = "https://api.resend.com";

/// A rendered email ready to send
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeliveryEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Everything the delivery template needs
pub struct EmailContext<'a> {
    pub customer_email: &'a str,
    pub product: Product,
    pub links: &'a [DownloadLink],
    pub expires_at: DateTime<Utc>,
    pub support_email: &'a str,
    pub now: DateTime<Utc>,
}

pub fn delivery_subject(product: Product) -> String {
    format!("Your PageMint {} Templates Are Ready!", product.display_name())
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Hours until expiry, rounded up
fn hours_remaining(ctx: &EmailContext<'_>) -> i64 {
    let minutes = (ctx.expires_at - ctx.now).num_minutes().max(0);
    (minutes + 59) / 60
}

/// Render the HTML and plain-text bodies of a delivery email
pub fn render_delivery_email(ctx: &EmailContext<'_>) -> DeliveryEmail {
    let product_name = ctx.product.display_name();
    let hours = hours_remaining(ctx);
    let expiry = ctx.expires_at.format("%Y-%m-%d %H:%M UTC");

    let mut html = String::new();
    let _ = write!(
        html,
        "<!DOCTYPE html><html><head><meta charset=\"UTF-8\"><title>Your PageMint Templates</title></head>\
         <body style=\"font-family: Inter, -apple-system, sans-serif; background-color: #f8fafc;\">\
         <div style=\"max-width: 600px; margin: 0 auto; background-color: #ffffff;\">\
         <h1>Your Templates Are Ready!</h1>\
         <p>Your <strong>{product}</strong> purchase was successful! \
         You now have access to {count} template files.</p>",
        product = escape_html(product_name),
        count = ctx.links.len(),
    );

    html.push_str("<h3>Your Template Files</h3>");
    for link in ctx.links {
        let _ = write!(
            html,
            "<div><h4>{description}</h4><p>Size: {size}</p>\
             <a href=\"{url}\">Download</a></div>",
            description = escape_html(&link.description),
            size = escape_html(&link.size),
            url = escape_html(&link.secure_url),
        );
    }

    let _ = write!(
        html,
        "<div style=\"background-color: #fef3c7;\"><strong>Download links expire in {hours} hours</strong> \
         ({expiry}). Please download your files promptly.</div>",
    );

    html.push_str("<h3>Getting Started</h3><ol>");
    for step in ctx.product.download_instructions() {
        let _ = write!(html, "<li>{}</li>", escape_html(step));
    }
    html.push_str("</ol><h3>Troubleshooting</h3><ul>");
    for tip in TROUBLESHOOTING_TIPS {
        let _ = write!(html, "<li>{}</li>", escape_html(tip));
    }
    let _ = write!(
        html,
        "</ul><p>Need help? Email <a href=\"mailto:{support}\">{support}</a> with your order details.</p>\
         <p style=\"color: #64748b;\">Sent to {email}</p></div></body></html>",
        support = escape_html(ctx.support_email),
        email = escape_html(ctx.customer_email),
    );

    let mut text = String::new();
    let _ = writeln!(text, "Your PageMint {product_name} purchase was successful!\n");
    let _ = writeln!(text, "Your files ({}):", ctx.links.len());
    for (i, link) in ctx.links.iter().enumerate() {
        let _ = writeln!(text, "  {}. {} ({})", i + 1, link.description, link.size);
        let _ = writeln!(text, "     {}", link.secure_url);
    }
    let _ = writeln!(text, "\nLinks expire in {hours} hours ({expiry}).\n");
    let _ = writeln!(text, "Getting started:");
    for (i, step) in ctx.product.download_instructions().iter().enumerate() {
        let _ = writeln!(text, "  {}. {step}", i + 1);
    }
    let _ = writeln!(text, "\nNeed help? Email {} with your order details.", ctx.support_email);

    DeliveryEmail {
        to: ctx.customer_email.to_string(),
        subject: delivery_subject(ctx.product),
        html,
        text,
    }
}

/// Provider acknowledgement
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SendReceipt {
    pub provider_id: Option<String>,
    pub simulated: bool,
}

/// Transactional email provider (Strategy pattern)
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &DeliveryEmail) -> Result<SendReceipt>;

    fn name(&self) -> &str;
}

/// Resend HTTP API mailer
pub struct ResendMailer {
    client: reqwest::Client,
    api_key: String,
    from: String,
    base_url: String,
}

#[derive(Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct ResendResponse {
    id: Option<String>,
}

impl ResendMailer {
    pub fn new(api_key: impl Into<String>, from_email: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            from: format!("PageMint <{from_email}>"),
            base_url: RESEND_API_URL.into(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Create from `RESEND_API_KEY` and `FROM_EMAIL`; empty values count as unset
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| DeliveryError::Config(format!("{key} not set")))
        };
        let api_key = var("RESEND_API_KEY")?;
        let from = var("FROM_EMAIL")?;

        Ok(Self::new(api_key, from.trim()))
    }

    /// Point at a different API host
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, email: &DeliveryEmail) -> Result<SendReceipt> {
        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&ResendRequest {
                from: &self.from,
                to: [&email.to],
                subject: &email.subject,
                html: &email.html,
                text: &email.text,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Email(format!("Resend API error {status}: {body}")));
        }

        let body: ResendResponse = response.json().await?;
        Ok(SendReceipt {
            provider_id: body.id,
            simulated: false,
        })
    }

    fn name(&self) -> &str {
        "resend"
    }
}

/// Mailer that only logs the rendered email
#[derive(Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &DeliveryEmail) -> Result<SendReceipt> {
        tracing::info!(
            to = %email.to,
            subject = %email.subject,
            "Simulated delivery email"
        );
        tracing::debug!(body = %email.text, "Email preview");

        Ok(SendReceipt {
            provider_id: None,
            simulated: true,
        })
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Result of a notification attempt
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailOutcome {
    pub status: EmailStatus,
    pub recipient: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sends delivery emails and keeps the email log
#[derive(Clone)]
pub struct NotificationDispatcher {
    mailer: Arc<dyn Mailer>,
    store: Arc<dyn DeliveryStore>,
}

impl NotificationDispatcher {
    pub fn new(mailer: Arc<dyn Mailer>, store: Arc<dyn DeliveryStore>) -> Self {
        Self { mailer, store }
    }

    pub fn mailer_name(&self) -> &str {
        self.mailer.name()
    }

    /// Send an email; never fails, the outcome says what happened
    pub async fn dispatch(&self, email: &DeliveryEmail) -> EmailOutcome {
        let (status, error) = match self.mailer.send(email).await {
            Ok(receipt) => {
                tracing::info!(
                    to = %email.to,
                    mailer = self.mailer.name(),
                    provider_id = ?receipt.provider_id,
                    "Delivery email sent"
                );
                let status = if receipt.simulated {
                    EmailStatus::Simulated
                } else {
                    EmailStatus::Sent
                };
                (status, None)
            }
            Err(e) => {
                tracing::error!(to = %email.to, error = %e, "Failed to send delivery email");
                (EmailStatus::Failed, Some(e.to_string()))
            }
        };

        let entry = EmailLogEntry::new(
            EmailType::Delivery,
            &email.to,
            &email.subject,
            status,
            error.clone(),
        );
        if let Err(e) = self.store.log_email(&entry).await {
            tracing::warn!(error = %e, "Failed to record email log entry");
        }

        EmailOutcome {
            status,
            recipient: email.to.clone(),
            error,
        }
    }

    /// Record a fulfillment failure for the support team
    pub async fn report_failure(&self, recipient: &str, error: &DeliveryError) {
        let entry = EmailLogEntry::new(
            EmailType::DeliveryError,
            recipient,
            "Delivery Error",
            EmailStatus::Failed,
            Some(error.to_string()),
        );
        if let Err(e) = self.store.log_email(&entry).await {
            tracing::warn!(error = %e, "Failed to record delivery error");
        }
    }
}
