//! Delivery Error Types

use thiserror::Error;

use crate::catalog::Product;
use crate::token::TokenRejection;

/// Result type alias
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised anywhere in the payment-to-delivery pipeline
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Missing or malformed request input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Product id (or Stripe price id) is not part of the catalog
    #[error("Unknown product: {0}")]
    UnknownProduct(String),

    /// Product exists but has nothing to deliver
    #[error("No deliverable files for product {0}")]
    NoDeliverables(Product),

    /// Checkout session unknown to the payment gateway
    #[error("Checkout session not found: {0}")]
    SessionNotFound(String),

    /// No delivery has been issued for this session
    #[error("Delivery not found: {0}")]
    DeliveryNotFound(String),

    /// Requested file is not part of the delivered bundle
    #[error("File not found in delivery: {0}")]
    FileNotFound(String),

    /// Token exists but cannot be redeemed (or does not exist)
    #[error("Download token rejected: {0}")]
    TokenRejected(TokenRejection),

    /// Gateway reports the session as anything but paid
    #[error("Payment not completed for session {session_id} (status: {status})")]
    PaymentNotCompleted { session_id: String, status: String },

    /// A delivery was already created for the session
    #[error("Delivery already exists for session {0}")]
    DeliveryExists(String),

    /// Payment gateway (Stripe) failure
    #[error("Payment gateway error: {0}")]
    Gateway(String),

    /// Transactional email provider failure
    #[error("Email provider error: {0}")]
    Email(String),

    /// Webhook signature verification failed
    #[error("Webhook signature invalid: {0}")]
    WebhookSignature(String),

    /// Webhook payload parsing failed
    #[error("Webhook parse error: {0}")]
    WebhookParse(String),

    /// Persistence layer failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl DeliveryError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::Gateway(_)
                | DeliveryError::Email(_)
                | DeliveryError::Storage(_)
                | DeliveryError::Http(_)
        )
    }

    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &str {
        match self {
            DeliveryError::Validation(_) => "VALIDATION_ERROR",
            DeliveryError::UnknownProduct(_) => "UNKNOWN_PRODUCT",
            DeliveryError::NoDeliverables(_) => "NO_DELIVERABLES",
            DeliveryError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            DeliveryError::DeliveryNotFound(_) => "DELIVERY_NOT_FOUND",
            DeliveryError::FileNotFound(_) => "FILE_NOT_FOUND",
            DeliveryError::TokenRejected(rejection) => rejection.code(),
            DeliveryError::PaymentNotCompleted { .. } => "PAYMENT_NOT_COMPLETED",
            DeliveryError::DeliveryExists(_) => "DELIVERY_EXISTS",
            DeliveryError::Gateway(_) => "GATEWAY_ERROR",
            DeliveryError::Email(_) => "EMAIL_ERROR",
            DeliveryError::WebhookSignature(_) => "INVALID_SIGNATURE",
            DeliveryError::WebhookParse(_) => "INVALID_PAYLOAD",
            DeliveryError::Storage(_) => "STORAGE_ERROR",
            DeliveryError::Config(_) => "CONFIG_ERROR",
            DeliveryError::Json(_) => "JSON_ERROR",
            DeliveryError::Http(_) => "HTTP_ERROR",
        }
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            DeliveryError::Validation(msg) => msg.clone(),
            DeliveryError::UnknownProduct(_) => "Product not found.".into(),
            DeliveryError::SessionNotFound(id) => format!(
                "We couldn't find checkout session {id}. Please contact support with this session id."
            ),
            DeliveryError::PaymentNotCompleted { session_id, .. } => format!(
                "Payment not completed. If you were charged, contact support with session id {session_id}."
            ),
            DeliveryError::DeliveryNotFound(_) => "No delivery found for this purchase.".into(),
            DeliveryError::FileNotFound(_) => "File not found in this delivery.".into(),
            DeliveryError::TokenRejected(_) => "Download link expired or invalid".into(),
            DeliveryError::Gateway(_) => "Payment processing failed. Please try again.".into(),
            DeliveryError::WebhookSignature(_) => "Invalid signature".into(),
            DeliveryError::Config(_) => "Service configuration error.".into(),
            _ => "An error occurred processing your request.".into(),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for DeliveryError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DeliveryError::Storage(format!("lock poisoned: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(DeliveryError::Gateway("timeout".into()).is_retryable());
        assert!(DeliveryError::Storage("down".into()).is_retryable());
        assert!(!DeliveryError::TokenRejected(TokenRejection::Expired).is_retryable());
        assert!(!DeliveryError::WebhookSignature("bad".into()).is_retryable());
    }

    #[test]
    fn test_session_message_mentions_support() {
        let err = DeliveryError::SessionNotFound("cs_test_missing".into());
        let message = err.user_message();
        assert!(message.contains("cs_test_missing"));
        assert!(message.contains("support"));
    }

    #[test]
    fn test_token_rejection_code_passthrough() {
        let err = DeliveryError::TokenRejected(TokenRejection::Used);
        assert_eq!(err.code(), "used");
    }
}
