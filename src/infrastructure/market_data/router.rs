//! Provider router: the strict historical-vs-live hierarchy.
//!
//! Slots: historical-primary, live-primary, live-secondary, plus a fixed
//! last-resort source. Historical intent never dispatches to live-only
//! slots. Every dispatch goes through the request queue; failures are
//! classified and retryable ones fall over to the next slot. When all
//! slots exhaust, callers either get a single structured error, a stale
//! cache read, or (on backtest paths) an empty frame; never a panic.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::errors::MarketDataError;
use crate::domain::market::{
    AssetDetails, Candle, CandleRequest, DataIntent, PriceSnapshot, SentimentSnapshot,
    VolatilitySnapshot,
};
use crate::domain::ports::MarketDataProvider;
use crate::infrastructure::market_data::cache::CacheKind;
use crate::infrastructure::market_data::queue::{Payload, RequestQueue};
use crate::infrastructure::observability::Metrics;

pub struct ProviderRouter {
    queue: Arc<RequestQueue>,
    historical: Option<Arc<dyn MarketDataProvider>>,
    live_primary: Option<Arc<dyn MarketDataProvider>>,
    live_secondary: Option<Arc<dyn MarketDataProvider>>,
    last_resort: Option<Arc<dyn MarketDataProvider>>,
    metrics: Metrics,
}

impl ProviderRouter {
    pub fn builder(queue: Arc<RequestQueue>, metrics: Metrics) -> ProviderRouterBuilder {
        ProviderRouterBuilder {
            queue,
            metrics,
            historical: None,
            live_primary: None,
            live_secondary: None,
            last_resort: None,
        }
    }

    fn slots_for(&self, intent: DataIntent) -> Vec<&Arc<dyn MarketDataProvider>> {
        let ordered: Vec<&Option<Arc<dyn MarketDataProvider>>> = match intent {
            DataIntent::Historical => vec![&self.historical, &self.last_resort],
            DataIntent::Live => vec![
                &self.live_primary,
                &self.live_secondary,
                &self.last_resort,
            ],
        };
        ordered.into_iter().flatten().collect()
    }

    pub async fn price(&self, symbol: &str) -> Result<PriceSnapshot, MarketDataError> {
        let slots = self.slots_for(DataIntent::Live);
        if slots.is_empty() {
            return Err(MarketDataError::NoProvider);
        }

        let mut last_error = None;
        let mut previous: Option<&'static str> = None;
        for provider in slots {
            if !provider.capabilities().price {
                continue;
            }
            if let Some(from) = previous {
                self.metrics
                    .provider_fallbacks_total
                    .with_label_values(&[from, provider.name()])
                    .inc();
            }
            match self.queue.price(provider, symbol).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(error) => {
                    if !error.is_retryable() {
                        return Err(error);
                    }
                    warn!(
                        "Price provider {} failed for {}: {}",
                        provider.name(),
                        symbol,
                        error
                    );
                    previous = Some(provider.name());
                    last_error = Some(error);
                }
            }
        }

        // Total failure: serve stale data if any layer still has it.
        if let Some(stale) = self.queue.cache().fallback(CacheKind::Price, symbol, None) {
            if let Ok(Payload::Price(snapshot)) = serde_json::from_value(stale) {
                debug!("Serving stale price for {} after total failure", symbol);
                return Ok(snapshot);
            }
        }

        Err(last_error.unwrap_or(MarketDataError::AllProvidersFailed {
            operation: format!("price:{}", symbol),
        })
        .into_all_failed(&format!("price:{}", symbol)))
    }

    pub async fn candles(&self, request: &CandleRequest) -> Result<Vec<Candle>, MarketDataError> {
        let slots = self.slots_for(request.intent);
        if slots.is_empty() {
            return Err(MarketDataError::NoProvider);
        }

        let mut previous: Option<&'static str> = None;
        for provider in slots {
            if !provider.capabilities().candles {
                continue;
            }
            if let Some(from) = previous {
                self.metrics
                    .provider_fallbacks_total
                    .with_label_values(&[from, provider.name()])
                    .inc();
            }
            match self.queue.candles(provider, request).await {
                Ok(candles) => return Ok(candles),
                Err(error) => {
                    if !error.is_retryable() {
                        return Err(error);
                    }
                    warn!(
                        "Candle provider {} failed for {}: {}",
                        provider.name(),
                        request.symbol,
                        error
                    );
                    previous = Some(provider.name());
                }
            }
        }

        let kind = match request.intent {
            DataIntent::Historical => CacheKind::Historical,
            DataIntent::Live => CacheKind::Candles,
        };
        let interval = QueueIntervalKey::of(request);
        if let Some(stale) = self
            .queue
            .cache()
            .fallback(kind, &request.symbol, Some(&interval))
        {
            if let Ok(Payload::Candles(candles)) = serde_json::from_value(stale) {
                debug!(
                    "Serving stale candles for {} after total failure",
                    request.symbol
                );
                return Ok(candles);
            }
        }

        Err(MarketDataError::AllProvidersFailed {
            operation: format!("candles:{}:{}", request.symbol, request.timeframe),
        })
    }

    /// Candle fetch that degrades to an empty frame instead of an error.
    /// Backtests and evolution cycles must keep progressing through vendor
    /// outages.
    pub async fn candles_or_empty(&self, request: &CandleRequest) -> Vec<Candle> {
        match self.candles(request).await {
            Ok(candles) => candles,
            Err(error) => {
                warn!(
                    "All candle sources failed for {} ({}), returning empty frame",
                    request.symbol, error
                );
                Vec::new()
            }
        }
    }

    pub async fn sentiment(
        &self,
        symbol: &str,
    ) -> Result<Option<SentimentSnapshot>, MarketDataError> {
        for provider in self.slots_for(DataIntent::Live) {
            if !provider.capabilities().sentiment {
                continue;
            }
            match self.queue.sentiment(provider, symbol).await {
                Ok(Some(snapshot)) => return Ok(Some(snapshot)),
                Ok(None) => continue,
                Err(error) if error.is_retryable() => continue,
                Err(error) => return Err(error),
            }
        }
        Ok(None)
    }

    pub async fn volatility(
        &self,
        symbol: &str,
    ) -> Result<Option<VolatilitySnapshot>, MarketDataError> {
        for provider in self.slots_for(DataIntent::Live) {
            if !provider.capabilities().volatility {
                continue;
            }
            match self.queue.volatility(provider, symbol).await {
                Ok(Some(snapshot)) => return Ok(Some(snapshot)),
                Ok(None) => continue,
                Err(error) if error.is_retryable() => continue,
                Err(error) => return Err(error),
            }
        }
        Ok(None)
    }

    pub async fn asset_details(
        &self,
        symbol: &str,
    ) -> Result<Option<AssetDetails>, MarketDataError> {
        for provider in self.slots_for(DataIntent::Live) {
            if !provider.capabilities().asset_details {
                continue;
            }
            match self.queue.asset_details(provider, symbol).await {
                Ok(Some(details)) => return Ok(Some(details)),
                Ok(None) => continue,
                Err(error) if error.is_retryable() => continue,
                Err(error) => return Err(error),
            }
        }
        Ok(None)
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    /// Provider names per slot, for the health surface.
    pub fn describe(&self) -> Vec<(&'static str, Option<&'static str>)> {
        vec![
            ("historical", self.historical.as_ref().map(|p| p.name())),
            ("live_primary", self.live_primary.as_ref().map(|p| p.name())),
            (
                "live_secondary",
                self.live_secondary.as_ref().map(|p| p.name()),
            ),
            ("last_resort", self.last_resort.as_ref().map(|p| p.name())),
        ]
    }
}

/// Mirror of the queue's candle interval key, for stale reads.
struct QueueIntervalKey;

impl QueueIntervalKey {
    fn of(request: &CandleRequest) -> String {
        format!(
            "{}:{}:{}:{}",
            request.timeframe,
            request.limit,
            request.start.map(|t| t.timestamp()).unwrap_or(0),
            request.end.map(|t| t.timestamp()).unwrap_or(0)
        )
    }
}

impl MarketDataError {
    fn into_all_failed(self, operation: &str) -> MarketDataError {
        match self {
            MarketDataError::NoProvider => self,
            _ => MarketDataError::AllProvidersFailed {
                operation: operation.to_string(),
            },
        }
    }
}

pub struct ProviderRouterBuilder {
    queue: Arc<RequestQueue>,
    metrics: Metrics,
    historical: Option<Arc<dyn MarketDataProvider>>,
    live_primary: Option<Arc<dyn MarketDataProvider>>,
    live_secondary: Option<Arc<dyn MarketDataProvider>>,
    last_resort: Option<Arc<dyn MarketDataProvider>>,
}

impl ProviderRouterBuilder {
    pub fn historical(mut self, provider: Arc<dyn MarketDataProvider>) -> Self {
        self.historical = Some(provider);
        self
    }

    pub fn live_primary(mut self, provider: Arc<dyn MarketDataProvider>) -> Self {
        self.live_primary = Some(provider);
        self
    }

    pub fn live_secondary(mut self, provider: Arc<dyn MarketDataProvider>) -> Self {
        self.live_secondary = Some(provider);
        self
    }

    pub fn last_resort(mut self, provider: Arc<dyn MarketDataProvider>) -> Self {
        self.last_resort = Some(provider);
        self
    }

    pub fn build(self) -> ProviderRouter {
        ProviderRouter {
            queue: self.queue,
            historical: self.historical,
            live_primary: self.live_primary,
            live_secondary: self.live_secondary,
            last_resort: self.last_resort,
            metrics: self.metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::Capabilities;
    use crate::infrastructure::market_data::cache::MarketDataCache;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        name: &'static str,
        calls: AtomicUsize,
        failures_before_success: usize,
        price: rust_decimal::Decimal,
    }

    impl ScriptedProvider {
        fn failing(name: &'static str) -> Self {
            Self {
                name,
                calls: AtomicUsize::new(0),
                failures_before_success: usize::MAX,
                price: dec!(0),
            }
        }

        fn healthy(name: &'static str, price: rust_decimal::Decimal) -> Self {
            Self {
                name,
                calls: AtomicUsize::new(0),
                failures_before_success: 0,
                price,
            }
        }
    }

    #[async_trait]
    impl MarketDataProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                price: true,
                candles: true,
                ..Default::default()
            }
        }

        async fn price(&self, symbol: &str) -> Result<PriceSnapshot, MarketDataError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                return Err(MarketDataError::RateLimited {
                    provider: self.name.to_string(),
                    retry_after_secs: 30,
                });
            }
            Ok(PriceSnapshot {
                symbol: symbol.to_string(),
                price: self.price,
                change_pct: 0.0,
                timestamp: Utc::now(),
                provider: self.name.to_string(),
            })
        }

        async fn candles(
            &self,
            _request: &CandleRequest,
        ) -> Result<Vec<Candle>, MarketDataError> {
            Err(MarketDataError::Upstream {
                provider: self.name.to_string(),
                status: 503,
                message: "down".to_string(),
            })
        }
    }

    fn router_with(
        primary: Arc<dyn MarketDataProvider>,
        secondary: Arc<dyn MarketDataProvider>,
    ) -> (ProviderRouter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MarketDataCache::new(dir.path(), 100));
        let metrics = Metrics::new().unwrap();
        let queue = Arc::new(RequestQueue::new(cache, metrics.clone()));
        let router = ProviderRouter::builder(queue, metrics)
            .live_primary(primary)
            .live_secondary(secondary)
            .build();
        (router, dir)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_primary_falls_over_to_secondary() {
        let primary = Arc::new(ScriptedProvider::failing("primary"));
        let secondary = Arc::new(ScriptedProvider::healthy("secondary", dec!(123.45)));
        let (router, _dir) = router_with(primary.clone(), secondary.clone());

        let snapshot = router.price("AAPL").await.unwrap();
        assert_eq!(snapshot.price, dec!(123.45));
        assert_eq!(snapshot.provider, "secondary");

        // The queue retried the primary once inside its backoff handling.
        assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
        let (failures, remaining) = router.queue().backoff_state("primary");
        assert!(failures >= 2);
        assert!(remaining.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backtest_path_returns_empty_frame_on_total_failure() {
        let primary = Arc::new(ScriptedProvider::failing("primary"));
        let secondary = Arc::new(ScriptedProvider::failing("secondary"));
        let (router, _dir) = router_with(primary, secondary);

        let request = CandleRequest::live("AAPL", crate::domain::market::Timeframe::OneDay, 50);
        let candles = router.candles_or_empty(&request).await;
        assert!(candles.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_provider_configured() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MarketDataCache::new(dir.path(), 10));
        let metrics = Metrics::new().unwrap();
        let queue = Arc::new(RequestQueue::new(cache, metrics.clone()));
        let router = ProviderRouter::builder(queue, metrics).build();

        assert!(matches!(
            router.price("AAPL").await,
            Err(MarketDataError::NoProvider)
        ));
    }
}
