//! Supabase Storage
//!
//! `DeliveryStore` over Supabase's PostgREST API. Redemption goes through the
//! `redeem_digital_delivery` database function so the check and the counter
//! update run in one transaction (`SELECT ... FOR UPDATE` on the row).
//! The tables and the function ship in `migrations/0001_delivery_schema.sql`
//! (also available as [`SCHEMA_SQL`]); apply it before pointing the server
//! at a project.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::delivery::{DeliveryRecord, DownloadAnalyticsEvent, EmailLogEntry, Order, Redemption};
use crate::error::{DeliveryError, Result};
use crate::store::DeliveryStore;
use crate::token::{DownloadToken, TokenRejection};

const ORDERS: &str = "orders";
const DELIVERIES: &str = "digital_deliveries";
const ANALYTICS: &str = "download_analytics";
const EMAIL_LOGS: &str = "email_logs";
const REDEEM_FN: &str = "redeem_digital_delivery";

/// Tables and database functions this store expects
pub const SCHEMA_SQL: &str = include_str!("../migrations/0001_delivery_schema.sql");

/// Row returned by the redeem function
#[derive(Deserialize)]
struct RedeemRow {
    status: String,
    #[serde(default)]
    delivery: Option<DeliveryRecord>,
}

/// Supabase-backed delivery store
pub struct SupabaseStore {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl SupabaseStore {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
        }
    }

    /// Create from `SUPABASE_URL` and `SUPABASE_SERVICE_ROLE_KEY`
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Create from an arbitrary variable lookup; empty values count as unset
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| DeliveryError::Config(format!("{key} not set")))
        };
        Ok(Self::new(var("SUPABASE_URL")?, var("SUPABASE_SERVICE_ROLE_KEY")?))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/rest/v1/{}", self.base_url, path))
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Storage(format!("supabase returned {status}: {body}")))
    }

    async fn select<T: DeserializeOwned>(&self, table: &str, query: &[(&str, String)]) -> Result<Vec<T>> {
        let response = self
            .request(reqwest::Method::GET, table)
            .query(&[("select", "*")])
            .query(query)
            .send()
            .await?;

        Ok(Self::check(response).await?.json().await?)
    }

    async fn insert<T: serde::Serialize + ?Sized>(&self, table: &str, row: &T) -> Result<Response> {
        Ok(self
            .request(reqwest::Method::POST, table)
            .header("Prefer", "return=minimal")
            .json(row)
            .send()
            .await?)
    }
}

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{value}")
}

fn rejection_for(status: &str) -> Result<TokenRejection> {
    match status {
        "not_found" => Ok(TokenRejection::NotFound),
        "expired" => Ok(TokenRejection::Expired),
        "used" => Ok(TokenRejection::Used),
        "exhausted" => Ok(TokenRejection::Exhausted),
        other => Err(DeliveryError::Storage(format!("unexpected redeem status: {other}"))),
    }
}

#[async_trait]
impl DeliveryStore for SupabaseStore {
    async fn save_order(&self, order: &Order) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, ORDERS)
            .query(&[("on_conflict", "stripe_session_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(order)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get_order(&self, session_id: &str) -> Result<Option<Order>> {
        let rows: Vec<Order> = self
            .select(ORDERS, &[("stripe_session_id", eq(session_id))])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn create_delivery(&self, delivery: &DeliveryRecord) -> Result<()> {
        let response = self.insert(DELIVERIES, delivery).await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(DeliveryError::DeliveryExists(delivery.session_id.clone()));
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn delivery_for_session(&self, session_id: &str) -> Result<Option<DeliveryRecord>> {
        let rows: Vec<DeliveryRecord> = self
            .select(DELIVERIES, &[("session_id", eq(session_id))])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn delivery_for_token(&self, token: &DownloadToken) -> Result<Option<DeliveryRecord>> {
        let rows: Vec<DeliveryRecord> = self
            .select(DELIVERIES, &[("download_token", eq(token))])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn redeem(&self, token: &DownloadToken, now: DateTime<Utc>) -> Result<Redemption> {
        let response = self
            .request(reqwest::Method::POST, &format!("rpc/{REDEEM_FN}"))
            .json(&serde_json::json!({
                "p_token": token.as_str(),
                "p_now": now,
            }))
            .send()
            .await?;
        let row: RedeemRow = Self::check(response).await?.json().await?;

        if row.status == "granted" {
            let delivery = row.delivery.ok_or_else(|| {
                DeliveryError::Storage("granted redemption without delivery row".into())
            })?;
            return Ok(Redemption::Granted(delivery));
        }

        Ok(Redemption::Rejected(rejection_for(&row.status)?))
    }

    async fn record_download(&self, event: &DownloadAnalyticsEvent) -> Result<()> {
        Self::check(self.insert(ANALYTICS, event).await?).await?;
        Ok(())
    }

    async fn download_events(&self, delivery_id: Uuid) -> Result<Vec<DownloadAnalyticsEvent>> {
        let response = self
            .request(reqwest::Method::GET, ANALYTICS)
            .query(&[
                ("select", "*".to_string()),
                ("delivery_id", eq(delivery_id)),
                ("order", "created_at.asc".to_string()),
            ])
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn log_email(&self, entry: &EmailLogEntry) -> Result<()> {
        Self::check(self.insert(EMAIL_LOGS, entry).await?).await?;
        Ok(())
    }

    async fn email_log(&self, recipient: &str) -> Result<Vec<EmailLogEntry>> {
        let response = self
            .request(reqwest::Method::GET, EMAIL_LOGS)
            .query(&[
                ("select", "*".to_string()),
                ("recipient_email", eq(recipient)),
                ("order", "created_at.asc".to_string()),
            ])
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    fn name(&self) -> &str {
        "supabase"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Product;
    use crate::token::TokenIssuer;
    use chrono::Duration;
    use mockito::Matcher;

    fn delivery() -> DeliveryRecord {
        let issued = TokenIssuer::new(Duration::hours(24)).issue(Product::ProPack, "cs_sb", Utc::now());
        DeliveryRecord::new(issued, Some("buyer@example.com".into()), 5)
    }

    #[test]
    fn test_from_vars_rejects_empty_values() {
        fn vars(url: &'static str, key: &'static str) -> impl Fn(&str) -> Option<String> {
            move |name| match name {
                "SUPABASE_URL" => Some(url.to_string()),
                "SUPABASE_SERVICE_ROLE_KEY" => Some(key.to_string()),
                _ => None,
            }
        }

        assert!(matches!(
            SupabaseStore::from_vars(vars("", "")),
            Err(DeliveryError::Config(_))
        ));
        assert!(SupabaseStore::from_vars(vars("https://x.supabase.co", " ")).is_err());
        assert!(SupabaseStore::from_vars(|_| None).is_err());

        let store = SupabaseStore::from_vars(vars("https://x.supabase.co/", "key")).unwrap();
        assert_eq!(store.base_url, "https://x.supabase.co");
    }

    #[test]
    fn test_schema_defines_store_objects() {
        for table in [ORDERS, DELIVERIES, ANALYTICS, EMAIL_LOGS] {
            assert!(SCHEMA_SQL.contains(&format!("create table if not exists public.{table} (")));
        }
        assert!(SCHEMA_SQL.contains(&format!("function public.{REDEEM_FN}(")));

        for status in ["not_found", "used", "exhausted", "expired"] {
            assert!(SCHEMA_SQL.contains(&format!("'{status}'")));
            assert!(rejection_for(status).is_ok());
        }
        assert!(SCHEMA_SQL.contains("'granted'"));
        assert!(SCHEMA_SQL.contains("session_id text not null unique"));
    }

    #[tokio::test]
    async fn test_redeem_granted() {
        let mut server = mockito::Server::new_async().await;
        let mut record = delivery();
        record.download_count = 1;

        let mock = server
            .mock("POST", "/rest/v1/rpc/redeem_digital_delivery")
            .match_header("apikey", "service-key")
            .match_header("authorization", "Bearer service-key")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "p_token": record.download_token.as_str(),
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({ "status": "granted", "delivery": record }).to_string(),
            )
            .create_async()
            .await;

        let store = SupabaseStore::new(server.url(), "service-key");
        let outcome = store.redeem(&record.download_token, Utc::now()).await.unwrap();

        mock.assert_async().await;
        assert!(matches!(outcome, Redemption::Granted(r) if r.download_count == 1));
    }

    #[tokio::test]
    async fn test_redeem_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/rest/v1/rpc/redeem_digital_delivery")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"expired","delivery":null}"#)
            .create_async()
            .await;

        let store = SupabaseStore::new(server.url(), "service-key");
        let outcome = store
            .redeem(&DownloadToken::generate(), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, Redemption::Rejected(TokenRejection::Expired));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_conflict() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/rest/v1/digital_deliveries")
            .with_status(409)
            .with_body(r#"{"code":"23505","message":"duplicate key"}"#)
            .create_async()
            .await;

        let store = SupabaseStore::new(server.url(), "service-key");
        let result = store.create_delivery(&delivery()).await;
        assert!(matches!(result, Err(DeliveryError::DeliveryExists(id)) if id == "cs_sb"));
    }

    #[tokio::test]
    async fn test_delivery_lookup_by_session() {
        let mut server = mockito::Server::new_async().await;
        let record = delivery();
        server
            .mock("GET", "/rest/v1/digital_deliveries")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("select".into(), "*".into()),
                Matcher::UrlEncoded("session_id".into(), "eq.cs_sb".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(serde_json::json!([record]).to_string())
            .create_async()
            .await;

        let store = SupabaseStore::new(server.url(), "service-key");
        let found = store.delivery_for_session("cs_sb").await.unwrap();
        assert_eq!(found.map(|d| d.id), Some(record.id));
    }

    #[tokio::test]
    async fn test_server_error_is_storage_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/rest/v1/email_logs")
            .with_status(500)
            .create_async()
            .await;

        let store = SupabaseStore::new(server.url(), "service-key");
        let entry = EmailLogEntry::new(
            crate::delivery::EmailType::Delivery,
            "buyer@example.com",
            "subject",
            crate::delivery::EmailStatus::Sent,
            None,
        );
        let result = store.log_email(&entry).await;
        assert!(matches!(result, Err(ref e @ DeliveryError::Storage(_)) if e.is_retryable()));
    }
}
