//! Delivery Storage
//!
//! Persistence for orders, deliveries, download analytics and email logs.
//! `redeem` is the only state transition that must be atomic: the check
//! (unexpired, under the download limit) and the increment happen as one
//! operation so two concurrent requests can never both pass the check.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::delivery::{
    DeliveryRecord, DownloadAnalyticsEvent, EmailLogEntry, Order, Redemption,
};
use crate::error::{DeliveryError, Result};
use crate::token::{DownloadToken, TokenRejection};

/// Delivery storage trait
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert or replace an order, keyed by checkout session id
    async fn save_order(&self, order: &Order) -> Result<()>;

    /// Get order by checkout session id
    async fn get_order(&self, session_id: &str) -> Result<Option<Order>>;

    /// Insert a new delivery; fails with `DeliveryExists` if the session
    /// already has one
    async fn create_delivery(&self, delivery: &DeliveryRecord) -> Result<()>;

    /// Get delivery by checkout session id
    async fn delivery_for_session(&self, session_id: &str) -> Result<Option<DeliveryRecord>>;

    /// Get delivery by download token
    async fn delivery_for_token(&self, token: &DownloadToken) -> Result<Option<DeliveryRecord>>;

    /// Atomically validate and consume one download
    async fn redeem(&self, token: &DownloadToken, now: DateTime<Utc>) -> Result<Redemption>;

    /// Append a download analytics event
    async fn record_download(&self, event: &DownloadAnalyticsEvent) -> Result<()>;

    /// Analytics events for a delivery, oldest first
    async fn download_events(&self, delivery_id: Uuid) -> Result<Vec<DownloadAnalyticsEvent>>;

    /// Append an email log entry
    async fn log_email(&self, entry: &EmailLogEntry) -> Result<()>;

    /// Email log entries for a recipient, oldest first
    async fn email_log(&self, recipient: &str) -> Result<Vec<EmailLogEntry>>;

    /// Backend name for health reporting
    fn name(&self) -> &str;
}

#[derive(Default)]
struct MemoryState {
    orders: HashMap<String, Order>,
    deliveries: HashMap<DownloadToken, DeliveryRecord>,
    by_session: HashMap<String, DownloadToken>,
    analytics: Vec<DownloadAnalyticsEvent>,
    emails: Vec<EmailLogEntry>,
}

/// In-memory delivery store (for development and tests)
///
/// All tables sit behind one lock, so every trait method is atomic.
pub struct MemoryDeliveryStore {
    state: RwLock<MemoryState>,
}

impl Default for MemoryDeliveryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDeliveryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    /// Every analytics event recorded so far
    pub fn all_download_events(&self) -> Result<Vec<DownloadAnalyticsEvent>> {
        Ok(self.state.read()?.analytics.clone())
    }
}

#[async_trait]
impl DeliveryStore for MemoryDeliveryStore {
    async fn save_order(&self, order: &Order) -> Result<()> {
        let mut state = self.state.write()?;
        state.orders.insert(order.session_id.clone(), order.clone());
        Ok(())
    }

    async fn get_order(&self, session_id: &str) -> Result<Option<Order>> {
        let state = self.state.read()?;
        Ok(state.orders.get(session_id).cloned())
    }

    async fn create_delivery(&self, delivery: &DeliveryRecord) -> Result<()> {
        let mut state = self.state.write()?;

        if state.by_session.contains_key(&delivery.session_id) {
            return Err(DeliveryError::DeliveryExists(delivery.session_id.clone()));
        }

        state
            .by_session
            .insert(delivery.session_id.clone(), delivery.download_token.clone());
        state
            .deliveries
            .insert(delivery.download_token.clone(), delivery.clone());

        Ok(())
    }

    async fn delivery_for_session(&self, session_id: &str) -> Result<Option<DeliveryRecord>> {
        let state = self.state.read()?;

        Ok(state
            .by_session
            .get(session_id)
            .and_then(|token| state.deliveries.get(token))
            .cloned())
    }

    async fn delivery_for_token(&self, token: &DownloadToken) -> Result<Option<DeliveryRecord>> {
        let state = self.state.read()?;
        Ok(state.deliveries.get(token).cloned())
    }

    async fn redeem(&self, token: &DownloadToken, now: DateTime<Utc>) -> Result<Redemption> {
        let mut state = self.state.write()?;

        let Some(delivery) = state.deliveries.get_mut(token) else {
            return Ok(Redemption::Rejected(TokenRejection::NotFound));
        };

        if let Err(rejection) = delivery.check_redeemable(now) {
            delivery.refresh_expiry(now);
            return Ok(Redemption::Rejected(rejection));
        }

        delivery.record_download(now);
        Ok(Redemption::Granted(delivery.clone()))
    }

    async fn record_download(&self, event: &DownloadAnalyticsEvent) -> Result<()> {
        let mut state = self.state.write()?;
        state.analytics.push(event.clone());
        Ok(())
    }

    async fn download_events(&self, delivery_id: Uuid) -> Result<Vec<DownloadAnalyticsEvent>> {
        let state = self.state.read()?;

        Ok(state
            .analytics
            .iter()
            .filter(|e| e.delivery_id == Some(delivery_id))
            .cloned()
            .collect())
    }

    async fn log_email(&self, entry: &EmailLogEntry) -> Result<()> {
        let mut state = self.state.write()?;
        state.emails.push(entry.clone());
        Ok(())
    }

    async fn email_log(&self, recipient: &str) -> Result<Vec<EmailLogEntry>> {
        let state = self.state.read()?;

        Ok(state
            .emails
            .iter()
            .filter(|e| e.recipient_email == recipient)
            .cloned()
            .collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Product;
    use crate::delivery::OrderStatus;
    use crate::token::TokenIssuer;
    use chrono::Duration;
    use std::sync::Arc;

    fn delivery(session_id: &str, max_downloads: u32) -> DeliveryRecord {
        let issued = TokenIssuer::new(Duration::hours(24)).issue(Product::ProPack, session_id, Utc::now());
        DeliveryRecord::new(issued, Some("buyer@example.com".into()), max_downloads)
    }

    #[tokio::test]
    async fn test_redeem_single_use_twice() {
        let store = MemoryDeliveryStore::new();
        let record = delivery("cs_1", 1);
        store.create_delivery(&record).await.unwrap();

        let now = Utc::now();
        let first = store.redeem(&record.download_token, now).await.unwrap();
        assert!(matches!(first, Redemption::Granted(ref r) if r.download_count == 1));

        let second = store.redeem(&record.download_token, now).await.unwrap();
        assert_eq!(second, Redemption::Rejected(TokenRejection::Used));
    }

    #[tokio::test]
    async fn test_redeem_bounded_use() {
        let store = MemoryDeliveryStore::new();
        let record = delivery("cs_2", 3);
        store.create_delivery(&record).await.unwrap();

        let now = Utc::now();
        for _ in 0..3 {
            let outcome = store.redeem(&record.download_token, now).await.unwrap();
            assert!(matches!(outcome, Redemption::Granted(_)));
        }

        let outcome = store.redeem(&record.download_token, now).await.unwrap();
        assert_eq!(outcome, Redemption::Rejected(TokenRejection::Exhausted));
    }

    #[tokio::test]
    async fn test_redeem_unknown_token() {
        let store = MemoryDeliveryStore::new();
        let outcome = store
            .redeem(&DownloadToken::generate(), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, Redemption::Rejected(TokenRejection::NotFound));
    }

    #[tokio::test]
    async fn test_redeem_expiry_boundary() {
        let store = MemoryDeliveryStore::new();
        let record = delivery("cs_3", 5);
        store.create_delivery(&record).await.unwrap();
        let epsilon = Duration::seconds(1);

        let late = store
            .redeem(&record.download_token, record.expires_at + epsilon)
            .await
            .unwrap();
        assert_eq!(late, Redemption::Rejected(TokenRejection::Expired));

        let stored = store
            .delivery_for_token(&record.download_token)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_expired);
        assert_eq!(stored.download_count, 0);

        let early = store
            .redeem(&record.download_token, record.expires_at - epsilon)
            .await
            .unwrap();
        assert!(matches!(early, Redemption::Granted(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_redemption_single_winner() {
        for _ in 0..50 {
            let store = Arc::new(MemoryDeliveryStore::new());
            let record = delivery("cs_race", 1);
            store.create_delivery(&record).await.unwrap();

            let barrier = Arc::new(tokio::sync::Barrier::new(2));
            let mut handles = Vec::new();
            for _ in 0..2 {
                let store = store.clone();
                let token = record.download_token.clone();
                let barrier = barrier.clone();
                handles.push(tokio::spawn(async move {
                    barrier.wait().await;
                    store.redeem(&token, Utc::now()).await.unwrap()
                }));
            }

            let mut granted = 0;
            let mut used = 0;
            for handle in handles {
                match handle.await.unwrap() {
                    Redemption::Granted(_) => granted += 1,
                    Redemption::Rejected(TokenRejection::Used) => used += 1,
                    other => panic!("unexpected outcome: {other:?}"),
                }
            }
            assert_eq!((granted, used), (1, 1));
        }
    }

    #[tokio::test]
    async fn test_one_delivery_per_session() {
        let store = MemoryDeliveryStore::new();
        store.create_delivery(&delivery("cs_dup", 5)).await.unwrap();

        let result = store.create_delivery(&delivery("cs_dup", 5)).await;
        assert!(matches!(result, Err(DeliveryError::DeliveryExists(id)) if id == "cs_dup"));
    }

    #[tokio::test]
    async fn test_order_roundtrip() {
        let store = MemoryDeliveryStore::new();
        let mut order = Order::pending("cs_order", Some(Product::StarterPack));
        store.save_order(&order).await.unwrap();

        order.set_status(OrderStatus::Completed);
        store.save_order(&order).await.unwrap();

        let loaded = store.get_order("cs_order").await.unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Completed);
        assert_eq!(loaded.amount_total, Some(2900));
    }
}
