//! Shared fixtures: a scripted market data provider and canned candle
//! frames, wired into a real queue + router stack.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};

use tradebrain::domain::errors::MarketDataError;
use tradebrain::domain::market::types::{Candle, CandleRequest, PriceSnapshot};
use tradebrain::domain::ports::{Capabilities, MarketDataProvider};
use tradebrain::infrastructure::market_data::{
    MarketDataCache, ProviderRouter, RequestQueue,
};
use tradebrain::infrastructure::observability::Metrics;

/// Provider that serves one mutable price and one fixed candle frame for
/// every symbol.
pub struct ScriptedProvider {
    price: Mutex<Decimal>,
    candles: Vec<Candle>,
}

impl ScriptedProvider {
    pub fn new(price: Decimal, candles: Vec<Candle>) -> Self {
        Self {
            price: Mutex::new(price),
            candles,
        }
    }

    pub fn set_price(&self, price: Decimal) {
        *self.price.lock().unwrap() = price;
    }
}

#[async_trait]
impl MarketDataProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            price: true,
            candles: true,
            ..Default::default()
        }
    }

    async fn price(&self, symbol: &str) -> Result<PriceSnapshot, MarketDataError> {
        Ok(PriceSnapshot {
            symbol: symbol.to_string(),
            price: *self.price.lock().unwrap(),
            change_pct: 0.0,
            timestamp: Utc::now(),
            provider: "scripted".to_string(),
        })
    }

    async fn candles(&self, request: &CandleRequest) -> Result<Vec<Candle>, MarketDataError> {
        let mut candles = self.candles.clone();
        for candle in &mut candles {
            candle.symbol = request.symbol.clone();
        }
        if candles.len() > request.limit {
            let excess = candles.len() - request.limit;
            candles.drain(..excess);
        }
        Ok(candles)
    }
}

/// Queue + router stack over one scripted provider (all slots).
pub fn router_over(
    provider: Arc<ScriptedProvider>,
) -> (Arc<ProviderRouter>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(MarketDataCache::new(dir.path(), 200));
    let metrics = Metrics::new().unwrap();
    let queue = Arc::new(RequestQueue::new(cache, metrics.clone()));
    let dyn_provider: Arc<dyn MarketDataProvider> = provider;
    let router = Arc::new(
        ProviderRouter::builder(queue, metrics)
            .historical(dyn_provider.clone())
            .live_primary(dyn_provider)
            .build(),
    );
    (router, dir)
}

pub fn candle(close: f64, index: usize) -> Candle {
    Candle {
        symbol: "AAPL".to_string(),
        open: Decimal::from_f64_retain(close).unwrap(),
        high: Decimal::from_f64_retain(close + 0.5).unwrap(),
        low: Decimal::from_f64_retain(close - 0.5).unwrap(),
        close: Decimal::from_f64_retain(close).unwrap(),
        volume: Decimal::from_f64_retain(1000.0).unwrap(),
        timestamp: index as i64 * 86_400_000,
    }
}

/// Steady decline: every bar loses ground, driving RSI toward zero.
pub fn downtrend_frame(len: usize) -> Vec<Candle> {
    (0..len)
        .map(|i| candle(200.0 - i as f64 * 1.5, i))
        .collect()
}

/// Alternating gains and smaller losses: RSI hovers in the mid-50s.
pub fn choppy_frame(len: usize) -> Vec<Candle> {
    let mut price = 100.0;
    (0..len)
        .map(|i| {
            price += if i % 2 == 0 { 1.0 } else { -0.8 };
            candle(price, i)
        })
        .collect()
}
