//! Download Redemption
//!
//! Resolves `/api/download/{token}/{file}` requests: validates the token,
//! consumes one download and points the client at the file. Every attempt,
//! granted or rejected, leaves exactly one analytics event.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::catalog::DeliverableFile;
use crate::config::DeliveryConfig;
use crate::delivery::{DeliveryRecord, DownloadAnalyticsEvent, Redemption};
use crate::error::{DeliveryError, Result};
use crate::store::DeliveryStore;
use crate::token::{DownloadToken, TokenRejection};

/// Client details captured for analytics
#[derive(Clone, Debug, Default)]
pub struct Requester {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

/// A granted download
#[derive(Clone, Debug)]
pub struct GrantedDownload {
    /// Where the client should be redirected for the file bytes
    pub location: String,
    /// Delivery state after this download was counted
    pub delivery: DeliveryRecord,
    pub file: &'static DeliverableFile,
}

/// Validates download tokens and records analytics
#[derive(Clone)]
pub struct DownloadService {
    store: Arc<dyn DeliveryStore>,
    config: Arc<DeliveryConfig>,
}

impl DownloadService {
    pub fn new(store: Arc<dyn DeliveryStore>, config: Arc<DeliveryConfig>) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn DeliveryStore> {
        &self.store
    }

    /// Redeem a token for one file, now
    pub async fn redeem(
        &self,
        token: &str,
        file_name: &str,
        requester: &Requester,
    ) -> Result<GrantedDownload> {
        self.redeem_at(token, file_name, requester, Utc::now()).await
    }

    /// Redeem a token for one file at a given instant
    pub async fn redeem_at(
        &self,
        token: &str,
        file_name: &str,
        requester: &Requester,
        now: DateTime<Utc>,
    ) -> Result<GrantedDownload> {
        let token = DownloadToken::from_string(token);
        let known = self.store.delivery_for_token(&token).await;

        let outcome = match known {
            Ok(known) => self.try_redeem(known, &token, file_name, now).await,
            Err(e) => Err((None, e)),
        };

        let delivery_id = match &outcome {
            Ok(granted) => Some(granted.delivery.id),
            Err((id, _)) => *id,
        };
        let failure_reason = outcome.as_ref().err().map(|(_, e)| e.code().to_string());
        self.track(delivery_id, file_name, requester, failure_reason, now)
            .await;

        match outcome {
            Ok(granted) => {
                tracing::info!(
                    delivery_id = %granted.delivery.id,
                    file = file_name,
                    download_count = granted.delivery.download_count,
                    max_downloads = granted.delivery.max_downloads,
                    "Download granted"
                );
                Ok(granted)
            }
            Err((_, e)) => {
                tracing::warn!(file = file_name, reason = e.code(), "Download rejected");
                Err(e)
            }
        }
    }

    /// Download attempts for a fulfilled session, oldest first
    pub async fn history(&self, session_id: &str) -> Result<Vec<DownloadAnalyticsEvent>> {
        let delivery = self
            .store
            .delivery_for_session(session_id)
            .await?
            .ok_or_else(|| DeliveryError::DeliveryNotFound(session_id.to_string()))?;

        self.store.download_events(delivery.id).await
    }

    async fn try_redeem(
        &self,
        known: Option<DeliveryRecord>,
        token: &DownloadToken,
        file_name: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<GrantedDownload, (Option<Uuid>, DeliveryError)> {
        let Some(known) = known else {
            return Err((None, DeliveryError::TokenRejected(TokenRejection::NotFound)));
        };
        let delivery_id = Some(known.id);

        // Asking for a file outside the bundle does not consume a download
        let file = known
            .product
            .file(file_name)
            .ok_or_else(|| (delivery_id, DeliveryError::FileNotFound(file_name.to_string())))?;

        match self.store.redeem(token, now).await {
            Ok(Redemption::Granted(delivery)) => Ok(GrantedDownload {
                location: self.config.site_link(file.storage_path),
                delivery,
                file,
            }),
            Ok(Redemption::Rejected(rejection)) => {
                Err((delivery_id, DeliveryError::TokenRejected(rejection)))
            }
            Err(e) => Err((delivery_id, e)),
        }
    }

    async fn track(
        &self,
        delivery_id: Option<Uuid>,
        file_name: &str,
        requester: &Requester,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
    ) {
        let event = DownloadAnalyticsEvent {
            id: Uuid::new_v4(),
            delivery_id,
            file_name: file_name.to_string(),
            user_agent: requester.user_agent.clone(),
            ip_address: requester.ip_address.clone(),
            success: failure_reason.is_none(),
            failure_reason,
            timestamp: now,
        };

        if let Err(e) = self.store.record_download(&event).await {
            tracing::warn!(error = %e, "Failed to record download analytics");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Product;
    use crate::store::MemoryDeliveryStore;
    use crate::token::TokenIssuer;
    use chrono::Duration;

    struct Harness {
        store: Arc<MemoryDeliveryStore>,
        service: DownloadService,
        delivery: DeliveryRecord,
    }

    async fn harness(max_downloads: u32) -> Harness {
        let store = Arc::new(MemoryDeliveryStore::new());
        let config = Arc::new(DeliveryConfig {
            site_url: "https://pagemint.com".into(),
            ..Default::default()
        });
        let issued =
            TokenIssuer::new(Duration::hours(24)).issue(Product::StarterPack, "cs_dl", Utc::now());
        let delivery = DeliveryRecord::new(issued, Some("buyer@example.com".into()), max_downloads);
        store.create_delivery(&delivery).await.unwrap();

        Harness {
            service: DownloadService::new(store.clone(), config),
            store,
            delivery,
        }
    }

    fn requester() -> Requester {
        Requester {
            user_agent: Some("curl/8.0".into()),
            ip_address: Some("203.0.113.7".into()),
        }
    }

    #[tokio::test]
    async fn test_granted_download_points_at_file() {
        let h = harness(5).await;
        let granted = h
            .service
            .redeem(h.delivery.download_token.as_str(), "setup-guide.pdf", &requester())
            .await
            .unwrap();

        assert_eq!(granted.delivery.download_count, 1);
        assert_eq!(
            granted.location,
            format!("https://pagemint.com{}", granted.file.storage_path)
        );

        let events = h.store.all_download_events().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].success);
        assert_eq!(events[0].delivery_id, Some(h.delivery.id));
        assert_eq!(events[0].ip_address.as_deref(), Some("203.0.113.7"));
    }

    #[tokio::test]
    async fn test_expired_token_records_failure() {
        let h = harness(5).await;
        let later = h.delivery.expires_at + Duration::seconds(1);

        let result = h
            .service
            .redeem_at(
                h.delivery.download_token.as_str(),
                "setup-guide.pdf",
                &requester(),
                later,
            )
            .await;
        assert!(matches!(
            result,
            Err(DeliveryError::TokenRejected(TokenRejection::Expired))
        ));

        let events = h.store.all_download_events().unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
        assert_eq!(events[0].failure_reason.as_deref(), Some("expired"));
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let h = harness(5).await;
        let result = h
            .service
            .redeem("not-a-token", "setup-guide.pdf", &requester())
            .await;
        assert!(matches!(
            result,
            Err(DeliveryError::TokenRejected(TokenRejection::NotFound))
        ));

        let events = h.store.all_download_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].delivery_id, None);
        assert_eq!(events[0].failure_reason.as_deref(), Some("not_found"));
    }

    #[tokio::test]
    async fn test_file_outside_bundle_keeps_download() {
        let h = harness(1).await;
        let token = h.delivery.download_token.as_str();

        let result = h.service.redeem(token, "figma-files.zip", &requester()).await;
        assert!(matches!(result, Err(DeliveryError::FileNotFound(_))));

        let granted = h
            .service
            .redeem(token, "setup-guide.pdf", &requester())
            .await;
        assert!(granted.is_ok());
    }

    #[tokio::test]
    async fn test_single_use_second_attempt_used() {
        let h = harness(1).await;
        let token = h.delivery.download_token.as_str();

        h.service
            .redeem(token, "setup-guide.pdf", &requester())
            .await
            .unwrap();
        let second = h
            .service
            .redeem(token, "setup-guide.pdf", &requester())
            .await;
        assert!(matches!(
            second,
            Err(DeliveryError::TokenRejected(TokenRejection::Used))
        ));

        let history = h.service.history("cs_dl").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].success);
        assert_eq!(history[1].failure_reason.as_deref(), Some("used"));
    }
}
