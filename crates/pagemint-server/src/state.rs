//! Application State

use std::sync::Arc;

use pagemint_delivery::{
    DeliveryConfig, DeliveryStore, DownloadService, FulfillmentService, Mailer, PaymentGateway,
    WebhookHandler,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<DeliveryConfig>,

    /// Orders, deliveries and analytics
    pub store: Arc<dyn DeliveryStore>,

    /// Token redemption for the download endpoint
    pub downloads: DownloadService,

    /// Checkout and fulfillment (None if Stripe is not configured)
    pub fulfillment: Option<Arc<FulfillmentService>>,

    /// Stripe webhook receiver (None without a webhook secret)
    pub webhooks: Option<Arc<WebhookHandler>>,
}

impl AppState {
    pub fn new(
        config: Arc<DeliveryConfig>,
        store: Arc<dyn DeliveryStore>,
        mailer: Arc<dyn Mailer>,
        gateway: Option<Arc<dyn PaymentGateway>>,
        webhook_secret: Option<String>,
    ) -> Self {
        let fulfillment = gateway.map(|gateway| {
            Arc::new(FulfillmentService::new(
                gateway,
                store.clone(),
                mailer,
                config.clone(),
            ))
        });

        let webhooks = fulfillment
            .as_ref()
            .zip(webhook_secret)
            .map(|(fulfillment, secret)| Arc::new(WebhookHandler::new(fulfillment.clone(), secret)));

        Self {
            downloads: DownloadService::new(store.clone(), config.clone()),
            config,
            store,
            fulfillment,
            webhooks,
        }
    }
}
