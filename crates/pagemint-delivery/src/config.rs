//! Delivery Configuration
//!
//! Settings are read from the environment (see `.env.example`). Every value
//! has a development default except the Stripe price ids, which are only
//! needed when checkout is given a catalog id instead of a price id.

use chrono::Duration;

use crate::catalog::Product;
use crate::error::{DeliveryError, Result};

pub const DEFAULT_SITE_URL: &str = "http://localhost:3000";
pub const DEFAULT_SUPPORT_EMAIL: &str = "support@pagemint.com";
pub const DEFAULT_TTL_HOURS: i64 = 24;
pub const DEFAULT_MAX_DOWNLOADS: u32 = 5;
/// One year
pub const MAX_TTL_HOURS: i64 = 8760;

/// Maps Stripe price ids to catalog products
#[derive(Clone, Debug, Default)]
pub struct PriceCatalog {
    pub starter: Option<String>,
    pub pro: Option<String>,
}

impl PriceCatalog {
    /// Stripe price id configured for a product
    pub fn price_for(&self, product: Product) -> Option<&str> {
        match product {
            Product::StarterPack => self.starter.as_deref(),
            Product::ProPack => self.pro.as_deref(),
        }
    }

    /// Product sold under a Stripe price id
    pub fn product_for_price(&self, price_id: &str) -> Option<Product> {
        Product::ALL
            .into_iter()
            .find(|p| self.price_for(*p) == Some(price_id))
    }

    /// Resolve either a catalog id (`PRO_PACK`) or a Stripe price id
    pub fn resolve(&self, value: &str) -> Result<Product> {
        value
            .parse::<Product>()
            .or_else(|_| {
                self.product_for_price(value)
                    .ok_or_else(|| DeliveryError::UnknownProduct(value.to_string()))
            })
    }
}

/// Pipeline configuration
#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    /// Public site origin used for download links and checkout redirects
    pub site_url: String,

    /// Lifetime of a download token
    pub download_ttl: Duration,

    /// Successful redemptions allowed per token (1 = single-use)
    pub max_downloads: u32,

    /// Address shown to customers for help
    pub support_email: String,

    pub prices: PriceCatalog,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            site_url: DEFAULT_SITE_URL.into(),
            download_ttl: Duration::hours(DEFAULT_TTL_HOURS),
            max_downloads: DEFAULT_MAX_DOWNLOADS,
            support_email: DEFAULT_SUPPORT_EMAIL.into(),
            prices: PriceCatalog::default(),
        }
    }
}

impl DeliveryConfig {
    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Create from an arbitrary variable lookup
    ///
    /// Empty values count as unset.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let site_url = var("SITE_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_SITE_URL.into());

        let ttl_hours = match var("DOWNLOAD_TTL_HOURS") {
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|h| (1..=MAX_TTL_HOURS).contains(h))
                .ok_or_else(|| DeliveryError::Config(format!("DOWNLOAD_TTL_HOURS invalid: {raw}")))?,
            None => DEFAULT_TTL_HOURS,
        };

        let max_downloads = match var("MAX_DOWNLOADS") {
            Some(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| DeliveryError::Config(format!("MAX_DOWNLOADS invalid: {raw}")))?,
            None => DEFAULT_MAX_DOWNLOADS,
        };

        Ok(Self {
            site_url,
            download_ttl: Duration::hours(ttl_hours),
            max_downloads,
            support_email: var("SUPPORT_EMAIL").unwrap_or_else(|| DEFAULT_SUPPORT_EMAIL.into()),
            prices: PriceCatalog {
                starter: var("STRIPE_PRICE_STARTER"),
                pro: var("STRIPE_PRICE_PRO"),
            },
        })
    }

    /// Absolute URL of a path on the public site
    pub fn site_link(&self, path: &str) -> String {
        format!("{}{}", self.site_url, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DeliveryConfig::from_vars(lookup(&[])).unwrap();
        assert_eq!(config.download_ttl, Duration::hours(24));
        assert_eq!(config.max_downloads, 5);
        assert_eq!(config.site_url, DEFAULT_SITE_URL);
    }

    #[test]
    fn test_overrides() {
        let config = DeliveryConfig::from_vars(lookup(&[
            ("SITE_URL", "https://pagemint.com/"),
            ("DOWNLOAD_TTL_HOURS", "48"),
            ("MAX_DOWNLOADS", "1"),
            ("STRIPE_PRICE_PRO", "price_pro_123"),
        ]))
        .unwrap();

        assert_eq!(config.site_url, "https://pagemint.com");
        assert_eq!(config.download_ttl, Duration::hours(48));
        assert_eq!(config.max_downloads, 1);
        assert_eq!(config.prices.price_for(Product::ProPack), Some("price_pro_123"));
    }

    #[test]
    fn test_ttl_bounds() {
        for raw in ["0", "-1", "8761", "10000000000", "soon"] {
            let result = DeliveryConfig::from_vars(lookup(&[("DOWNLOAD_TTL_HOURS", raw)]));
            assert!(
                matches!(result, Err(DeliveryError::Config(_))),
                "DOWNLOAD_TTL_HOURS={raw} must be rejected"
            );
        }

        let config =
            DeliveryConfig::from_vars(lookup(&[("DOWNLOAD_TTL_HOURS", "8760")])).unwrap();
        assert_eq!(config.download_ttl, Duration::hours(MAX_TTL_HOURS));
    }

    #[test]
    fn test_empty_values_use_defaults() {
        let config = DeliveryConfig::from_vars(lookup(&[
            ("SITE_URL", ""),
            ("DOWNLOAD_TTL_HOURS", ""),
            ("STRIPE_PRICE_PRO", " "),
        ]))
        .unwrap();

        assert_eq!(config.site_url, DEFAULT_SITE_URL);
        assert_eq!(config.download_ttl, Duration::hours(DEFAULT_TTL_HOURS));
        assert_eq!(config.prices.pro, None);
    }

    #[test]
    fn test_invalid_max_downloads() {
        let result = DeliveryConfig::from_vars(lookup(&[("MAX_DOWNLOADS", "0")]));
        assert!(matches!(result, Err(DeliveryError::Config(_))));
    }

    #[test]
    fn test_resolve_price_or_product() {
        let prices = PriceCatalog {
            starter: Some("price_starter".into()),
            pro: None,
        };
        assert_eq!(prices.resolve("price_starter").unwrap(), Product::StarterPack);
        assert_eq!(prices.resolve("PRO_PACK").unwrap(), Product::ProPack);
        assert!(prices.resolve("price_unknown").is_err());
    }
}
