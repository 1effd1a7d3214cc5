//! Delivery Records
//!
//! Persistent state owned by the delivery subsystem: deliveries, orders,
//! download analytics and the email audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{DeliverableFile, FileKind, Product};
use crate::config::DeliveryConfig;
use crate::token::{DownloadToken, IssuedToken, TokenRejection};

/// Token lifecycle as seen at a given instant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Issued,
    Redeemed,
    Expired,
}

/// One fulfilled purchase and its download capability
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    #[serde(default)]
    pub order_item_id: Option<Uuid>,
    pub session_id: String,
    pub product: Product,
    #[serde(default)]
    pub customer_email: Option<String>,
    pub download_token: DownloadToken,
    pub download_count: u32,
    pub max_downloads: u32,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_expired: bool,
    #[serde(default)]
    pub last_downloaded_at: Option<DateTime<Utc>>,
}

impl DeliveryRecord {
    /// Create the record backing an issued token
    pub fn new(issued: IssuedToken, customer_email: Option<String>, max_downloads: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_item_id: None,
            session_id: issued.session_id,
            product: issued.product,
            customer_email,
            download_token: issued.token,
            download_count: 0,
            max_downloads,
            issued_at: issued.issued_at,
            expires_at: issued.expires_at,
            is_expired: false,
            last_downloaded_at: None,
        }
    }

    /// Check whether one more download is allowed at `now`
    ///
    /// A token whose limit was reached reports `used`/`exhausted` even after
    /// its expiry passes.
    pub fn check_redeemable(&self, now: DateTime<Utc>) -> Result<(), TokenRejection> {
        if self.download_count >= self.max_downloads {
            return Err(if self.max_downloads == 1 {
                TokenRejection::Used
            } else {
                TokenRejection::Exhausted
            });
        }
        if now >= self.expires_at {
            return Err(TokenRejection::Expired);
        }
        Ok(())
    }

    /// Apply one successful redemption
    pub fn record_download(&mut self, now: DateTime<Utc>) {
        self.download_count += 1;
        self.last_downloaded_at = Some(now);
        self.is_expired = self.download_count >= self.max_downloads;
    }

    /// Refresh `is_expired` against the clock
    pub fn refresh_expiry(&mut self, now: DateTime<Utc>) {
        if now >= self.expires_at || self.download_count >= self.max_downloads {
            self.is_expired = true;
        }
    }

    pub fn token_state(&self, now: DateTime<Utc>) -> TokenState {
        match self.check_redeemable(now) {
            Ok(()) => TokenState::Issued,
            Err(TokenRejection::Expired) => TokenState::Expired,
            Err(_) => TokenState::Redeemed,
        }
    }

    pub fn remaining_downloads(&self) -> u32 {
        self.max_downloads.saturating_sub(self.download_count)
    }

    /// Secure per-file links for this delivery
    pub fn download_links(&self, config: &DeliveryConfig) -> Vec<DownloadLink> {
        self.product
            .files()
            .iter()
            .map(|file| DownloadLink::new(file, config, &self.download_token, self.expires_at))
            .collect()
    }
}

/// A file together with its tokenized download URL
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadLink {
    pub name: String,
    pub size: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub secure_url: String,
    pub expires_at: DateTime<Utc>,
}

impl DownloadLink {
    pub fn new(
        file: &DeliverableFile,
        config: &DeliveryConfig,
        token: &DownloadToken,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: file.name.to_string(),
            size: file.size.to_string(),
            description: file.description.to_string(),
            kind: file.kind,
            secure_url: config.site_link(&format!(
                "/api/download/{}/{}",
                token,
                urlencoding::encode(file.name)
            )),
            expires_at,
        }
    }
}

/// Outcome of an atomic redemption attempt
#[derive(Clone, Debug, PartialEq)]
pub enum Redemption {
    /// Download granted; the record reflects the incremented count
    Granted(DeliveryRecord),
    Rejected(TokenRejection),
}

/// Order lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
}

/// A purchase attempt tracked from checkout creation to fulfillment
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    #[serde(rename = "stripe_session_id")]
    pub session_id: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub product: Option<Product>,
    #[serde(rename = "total_amount_cents", default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a pending order for a new checkout session
    pub fn pending(session_id: impl Into<String>, product: Option<Product>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            customer_email: None,
            product,
            amount_total: product.map(|p| p.price_cents()),
            currency: Some("usd".into()),
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: OrderStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// One download attempt, successful or not
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadAnalyticsEvent {
    pub id: Uuid,
    /// Absent when the token matched no delivery
    #[serde(default)]
    pub delivery_id: Option<Uuid>,
    pub file_name: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(rename = "created_at")]
    pub timestamp: DateTime<Utc>,
}

/// Email category
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailType {
    Delivery,
    DeliveryError,
}

/// Email delivery outcome
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailStatus {
    Sent,
    Simulated,
    Failed,
}

/// Audit entry for a notification attempt
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmailLogEntry {
    pub id: Uuid,
    pub email_type: EmailType,
    pub recipient_email: String,
    pub subject: String,
    pub status: EmailStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EmailLogEntry {
    pub fn new(
        email_type: EmailType,
        recipient_email: impl Into<String>,
        subject: impl Into<String>,
        status: EmailStatus,
        error_message: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            email_type,
            recipient_email: recipient_email.into(),
            subject: subject.into(),
            status,
            error_message,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenIssuer;
    use chrono::Duration;

    fn record(max_downloads: u32) -> (DeliveryRecord, DateTime<Utc>) {
        let now = Utc::now();
        let issued = TokenIssuer::new(Duration::hours(24)).issue(Product::ProPack, "cs_test", now);
        (DeliveryRecord::new(issued, Some("buyer@example.com".into()), max_downloads), now)
    }

    #[test]
    fn test_single_use_reports_used() {
        let (mut record, now) = record(1);
        assert!(record.check_redeemable(now).is_ok());
        record.record_download(now);
        assert_eq!(record.check_redeemable(now), Err(TokenRejection::Used));
        assert!(record.is_expired);
    }

    #[test]
    fn test_bounded_use_reports_exhausted() {
        let (mut record, now) = record(3);
        for _ in 0..3 {
            assert!(record.check_redeemable(now).is_ok());
            record.record_download(now);
        }
        assert_eq!(record.check_redeemable(now), Err(TokenRejection::Exhausted));
        assert_eq!(record.remaining_downloads(), 0);
    }

    #[test]
    fn test_expiry_boundary() {
        let (record, _) = record(5);
        let epsilon = Duration::milliseconds(1);
        assert!(record.check_redeemable(record.expires_at - epsilon).is_ok());
        assert_eq!(
            record.check_redeemable(record.expires_at),
            Err(TokenRejection::Expired)
        );
        assert_eq!(
            record.check_redeemable(record.expires_at + epsilon),
            Err(TokenRejection::Expired)
        );
    }

    #[test]
    fn test_token_state() {
        let (mut record, now) = record(1);
        assert_eq!(record.token_state(now), TokenState::Issued);
        assert_eq!(record.token_state(record.expires_at), TokenState::Expired);
        record.record_download(now);
        assert_eq!(record.token_state(now), TokenState::Redeemed);
    }

    #[test]
    fn test_download_links_embed_token() {
        let (record, _) = record(5);
        let config = DeliveryConfig {
            site_url: "https://pagemint.com".into(),
            ..Default::default()
        };
        let links = record.download_links(&config);
        assert_eq!(links.len(), 4);
        assert_eq!(
            links[0].secure_url,
            format!("https://pagemint.com/api/download/{}/all-templates.zip", record.download_token)
        );
    }

    #[test]
    fn test_download_link_encodes_file_name() {
        let (record, _) = record(5);
        let config = DeliveryConfig {
            site_url: "https://pagemint.com".into(),
            ..Default::default()
        };
        let file = DeliverableFile {
            name: "launch kit #2.zip",
            size: "1 MB",
            description: "Launch kit",
            kind: FileKind::Template,
            storage_path: "/downloads/pro/launch-kit-2.zip",
        };

        let link = DownloadLink::new(&file, &config, &record.download_token, record.expires_at);
        assert_eq!(
            link.secure_url,
            format!(
                "https://pagemint.com/api/download/{}/launch%20kit%20%232.zip",
                record.download_token
            )
        );
        assert_eq!(link.name, "launch kit #2.zip");
    }

    #[test]
    fn test_refresh_expiry() {
        let (mut record, _) = record(5);
        record.refresh_expiry(record.expires_at);
        assert!(record.is_expired);
    }
}
