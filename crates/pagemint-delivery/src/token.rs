//! Download Tokens
//!
//! Tokens are 256 bits from the thread-local CSPRNG, base64url encoded. They
//! carry no structure: all state (product, session, expiry, usage) lives in
//! the store, keyed by the token value.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::catalog::Product;

const TOKEN_BYTES: usize = 32;

/// Opaque download capability
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadToken(String);

impl DownloadToken {
    /// Generate a new random token
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Wrap a token received from a client
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DownloadToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a token could not be redeemed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenRejection {
    NotFound,
    Expired,
    /// Single-use token already redeemed
    Used,
    /// Bounded-use token reached its download limit
    Exhausted,
}

impl TokenRejection {
    pub fn code(&self) -> &'static str {
        match self {
            TokenRejection::NotFound => "not_found",
            TokenRejection::Expired => "expired",
            TokenRejection::Used => "used",
            TokenRejection::Exhausted => "exhausted",
        }
    }
}

impl std::fmt::Display for TokenRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A freshly minted token bound to {product, session}
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssuedToken {
    pub token: DownloadToken,
    pub product: Product,
    pub session_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Mints tokens with a fixed lifetime
#[derive(Clone, Debug)]
pub struct TokenIssuer {
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a token valid from `now` until `now + ttl` (exclusive)
    pub fn issue(&self, product: Product, session_id: &str, now: DateTime<Utc>) -> IssuedToken {
        IssuedToken {
            token: DownloadToken::generate(),
            product,
            session_id: session_id.to_string(),
            issued_at: now,
            expires_at: now + self.ttl,
        }
    }
}
