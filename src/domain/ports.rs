//! Ports: interfaces the application core depends on, implemented by
//! infrastructure adapters (or by the deployment for concerns that live
//! outside this service).

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::errors::MarketDataError;
use crate::domain::market::{
    AssetDetails, Candle, CandleRequest, PriceSnapshot, SentimentSnapshot, VolatilitySnapshot,
};

/// Capability set a provider implements. Not every vendor serves every
/// capability; the router checks before dispatching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub price: bool,
    pub candles: bool,
    pub sentiment: bool,
    pub volatility: bool,
    pub asset_details: bool,
}

/// A normalized market data vendor.
///
/// Contract: candle results are oldest-first and never null; an empty
/// window is an empty vector. Symbols arrive already canonicalized; the
/// adapter applies its own vendor rewrites.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    async fn price(&self, symbol: &str) -> Result<PriceSnapshot, MarketDataError>;

    async fn candles(&self, request: &CandleRequest) -> Result<Vec<Candle>, MarketDataError>;

    async fn sentiment(
        &self,
        _symbol: &str,
    ) -> Result<Option<SentimentSnapshot>, MarketDataError> {
        Ok(None)
    }

    async fn volatility(
        &self,
        _symbol: &str,
    ) -> Result<Option<VolatilitySnapshot>, MarketDataError> {
        Ok(None)
    }

    async fn asset_details(&self, _symbol: &str) -> Result<Option<AssetDetails>, MarketDataError> {
        Ok(None)
    }
}

/// Distributed cache layer (Redis-like). Wired only when the deployment
/// provides an implementation; the in-process L1/L2 layers work without it.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<serde_json::Value>;
    async fn set(&self, key: &str, value: serde_json::Value, ttl_seconds: u64);
    async fn delete(&self, key: &str);
}

/// Outcome of a gateway charge.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeReceipt {
    pub reference: String,
    pub amount_cents: i64,
}

/// Payment provider used by the monthly billing cycle. The concrete
/// processor integration lives outside this service.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge_royalties(
        &self,
        user_id: &str,
        user_email: &str,
        amount_cents: i64,
        description: &str,
    ) -> Result<ChargeReceipt>;
}

/// Symmetric cipher for group messages at rest. The deployment installs a
/// real cipher keyed from its secret store.
pub trait MessageCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Identity cipher for tests and local development.
pub struct PlainCipher;

impl MessageCipher for PlainCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        plaintext.to_vec()
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}
