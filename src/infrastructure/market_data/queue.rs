//! Global request queue in front of every market data vendor.
//!
//! Responsibilities, in order:
//! 1. Serve from cache when the entry is fresh.
//! 2. Coalesce concurrent identical requests onto a single upstream call.
//! 3. Hold requests while a provider's sliding 60s window is full.
//! 4. Back off exponentially (capped at 60s) on rate-limit class failures,
//!    with one retry after the backoff window; success resets the counter.
//!
//! The upstream call runs on a detached task, so cancelling a waiting
//! caller never abandons an in-flight vendor request mid-way; remaining
//! waiters still get the result.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::errors::MarketDataError;
use crate::domain::market::{
    AssetDetails, Candle, CandleRequest, DataIntent, PriceSnapshot, SentimentSnapshot,
    VolatilitySnapshot,
};
use crate::domain::ports::MarketDataProvider;
use crate::infrastructure::market_data::cache::{CacheKind, MarketDataCache};
use crate::infrastructure::observability::Metrics;

// Waiters must outlast a full rate-window hold (up to 60s) plus one
// backoff-and-retry pass; the origin task always broadcasts a result.
const COALESCE_TIMEOUT: Duration = Duration::from_secs(180);
const MAX_BACKOFF_SECS: u64 = 60;

/// Sliding-window request tracker for one provider.
struct RateTracker {
    max_per_minute: usize,
    timestamps: VecDeque<Instant>,
}

impl RateTracker {
    fn new(max_per_minute: usize) -> Self {
        Self {
            max_per_minute: max_per_minute.max(1),
            timestamps: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.timestamps.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Zero when under the limit, otherwise time until the oldest request
    /// ages out of the window (plus a small buffer).
    fn wait_time(&mut self, now: Instant) -> Duration {
        self.prune(now);
        if self.timestamps.len() < self.max_per_minute {
            return Duration::ZERO;
        }
        let oldest = *self.timestamps.front().expect("window is full");
        Duration::from_secs(60)
            .saturating_sub(now.duration_since(oldest))
            .saturating_add(Duration::from_millis(100))
    }

    fn record(&mut self, at: Instant) {
        self.timestamps.push_back(at);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BackoffState {
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
}

/// One queue-routable operation.
#[derive(Debug, Clone)]
pub enum QueueOp {
    Price { symbol: String },
    Candles(CandleRequest),
    Sentiment { symbol: String },
    Volatility { symbol: String },
    AssetDetails { symbol: String },
}

impl QueueOp {
    fn cache_kind(&self) -> CacheKind {
        match self {
            QueueOp::Price { .. } => CacheKind::Price,
            QueueOp::Candles(req) => match req.intent {
                DataIntent::Historical => CacheKind::Historical,
                DataIntent::Live => CacheKind::Candles,
            },
            QueueOp::Sentiment { .. } => CacheKind::Sentiment,
            QueueOp::Volatility { .. } => CacheKind::Volatility,
            QueueOp::AssetDetails { .. } => CacheKind::AssetDetails,
        }
    }

    fn symbol(&self) -> &str {
        match self {
            QueueOp::Price { symbol }
            | QueueOp::Sentiment { symbol }
            | QueueOp::Volatility { symbol }
            | QueueOp::AssetDetails { symbol } => symbol,
            QueueOp::Candles(req) => &req.symbol,
        }
    }

    fn interval(&self) -> Option<String> {
        match self {
            QueueOp::Candles(req) => Some(format!(
                "{}:{}:{}:{}",
                req.timeframe,
                req.limit,
                req.start.map(|t| t.timestamp()).unwrap_or(0),
                req.end.map(|t| t.timestamp()).unwrap_or(0)
            )),
            _ => None,
        }
    }

    /// Key identifying one (provider, function, args) tuple for coalescing.
    fn dedupe_key(&self, provider: &str) -> String {
        let args = match self {
            QueueOp::Price { symbol } => format!("price:{}", symbol),
            QueueOp::Candles(req) => format!(
                "candles:{}:{}:{}:{}:{}",
                req.symbol,
                req.timeframe,
                req.limit,
                req.start.map(|t| t.timestamp()).unwrap_or(0),
                req.end.map(|t| t.timestamp()).unwrap_or(0)
            ),
            QueueOp::Sentiment { symbol } => format!("sentiment:{}", symbol),
            QueueOp::Volatility { symbol } => format!("volatility:{}", symbol),
            QueueOp::AssetDetails { symbol } => format!("asset_details:{}", symbol),
        };
        let digest = Sha256::digest(format!("{}:{}", provider, args).as_bytes());
        hex::encode(digest)
    }
}

/// Typed payload flowing through cache and coalescing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Price(PriceSnapshot),
    Candles(Vec<Candle>),
    Sentiment(Option<SentimentSnapshot>),
    Volatility(Option<VolatilitySnapshot>),
    AssetDetails(Option<AssetDetails>),
}

type PendingMap = HashMap<String, broadcast::Sender<Result<Payload, MarketDataError>>>;

pub struct RequestQueue {
    cache: Arc<MarketDataCache>,
    rate_trackers: Mutex<HashMap<String, RateTracker>>,
    backoffs: Arc<Mutex<HashMap<String, BackoffState>>>,
    pending: Arc<Mutex<PendingMap>>,
    rate_limits: HashMap<String, usize>,
    default_rate_limit: usize,
    metrics: Metrics,
}

impl RequestQueue {
    pub fn new(cache: Arc<MarketDataCache>, metrics: Metrics) -> Self {
        Self {
            cache,
            rate_trackers: Mutex::new(HashMap::new()),
            backoffs: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            rate_limits: HashMap::new(),
            default_rate_limit: 60,
            metrics,
        }
    }

    /// Override the per-minute budget for one provider.
    pub fn with_rate_limit(mut self, provider: &str, max_per_minute: usize) -> Self {
        self.rate_limits.insert(provider.to_string(), max_per_minute);
        self
    }

    pub fn cache(&self) -> &Arc<MarketDataCache> {
        &self.cache
    }

    pub async fn price(
        &self,
        provider: &Arc<dyn MarketDataProvider>,
        symbol: &str,
    ) -> Result<PriceSnapshot, MarketDataError> {
        let op = QueueOp::Price {
            symbol: symbol.to_string(),
        };
        match self.execute(provider, op).await? {
            Payload::Price(snapshot) => Ok(snapshot),
            other => Err(unexpected_payload("price", &other)),
        }
    }

    pub async fn candles(
        &self,
        provider: &Arc<dyn MarketDataProvider>,
        request: &CandleRequest,
    ) -> Result<Vec<Candle>, MarketDataError> {
        let op = QueueOp::Candles(request.clone());
        match self.execute(provider, op).await? {
            Payload::Candles(candles) => Ok(candles),
            other => Err(unexpected_payload("candles", &other)),
        }
    }

    pub async fn sentiment(
        &self,
        provider: &Arc<dyn MarketDataProvider>,
        symbol: &str,
    ) -> Result<Option<SentimentSnapshot>, MarketDataError> {
        let op = QueueOp::Sentiment {
            symbol: symbol.to_string(),
        };
        match self.execute(provider, op).await? {
            Payload::Sentiment(snapshot) => Ok(snapshot),
            other => Err(unexpected_payload("sentiment", &other)),
        }
    }

    pub async fn volatility(
        &self,
        provider: &Arc<dyn MarketDataProvider>,
        symbol: &str,
    ) -> Result<Option<VolatilitySnapshot>, MarketDataError> {
        let op = QueueOp::Volatility {
            symbol: symbol.to_string(),
        };
        match self.execute(provider, op).await? {
            Payload::Volatility(snapshot) => Ok(snapshot),
            other => Err(unexpected_payload("volatility", &other)),
        }
    }

    pub async fn asset_details(
        &self,
        provider: &Arc<dyn MarketDataProvider>,
        symbol: &str,
    ) -> Result<Option<AssetDetails>, MarketDataError> {
        let op = QueueOp::AssetDetails {
            symbol: symbol.to_string(),
        };
        match self.execute(provider, op).await? {
            Payload::AssetDetails(details) => Ok(details),
            other => Err(unexpected_payload("asset_details", &other)),
        }
    }

    /// Consecutive failure count and remaining backoff for a provider.
    pub fn backoff_state(&self, provider: &str) -> (u32, Option<Duration>) {
        let backoffs = self.backoffs.lock().expect("backoff lock");
        match backoffs.get(provider) {
            Some(state) => {
                let remaining = state.backoff_until.map(|until| {
                    until.saturating_duration_since(Instant::now())
                });
                (
                    state.consecutive_failures,
                    remaining.filter(|d| !d.is_zero()),
                )
            }
            None => (0, None),
        }
    }

    async fn execute(
        &self,
        provider: &Arc<dyn MarketDataProvider>,
        op: QueueOp,
    ) -> Result<Payload, MarketDataError> {
        let provider_name = provider.name();
        let kind = op.cache_kind();
        let symbol = op.symbol().to_string();
        let interval = op.interval();

        if let Some(cached) = self.cache.get(kind, &symbol, interval.as_deref()).await {
            if let Ok(payload) = serde_json::from_value::<Payload>(cached) {
                self.metrics.cache_hits_total.with_label_values(&["l1"]).inc();
                return Ok(payload);
            }
        }

        // Honor an active backoff window before dispatching.
        let backoff_wait = {
            let backoffs = self.backoffs.lock().expect("backoff lock");
            backoffs
                .get(provider_name)
                .and_then(|s| s.backoff_until)
                .map(|until| until.saturating_duration_since(Instant::now()))
                .filter(|d| !d.is_zero())
        };
        if let Some(wait) = backoff_wait {
            debug!(
                "Provider {} in backoff, waiting {:?} before dispatch",
                provider_name, wait
            );
            tokio::time::sleep(wait).await;
        }

        // Coalesce onto an identical in-flight request if one exists.
        let request_key = op.dedupe_key(provider_name);
        let mut rx = {
            let mut pending = self.pending.lock().expect("pending lock");
            if let Some(sender) = pending.get(&request_key) {
                self.metrics
                    .coalesced_requests_total
                    .with_label_values(&[provider_name])
                    .inc();
                sender.subscribe()
            } else {
                let (tx, rx) = broadcast::channel(4);
                pending.insert(request_key.clone(), tx.clone());
                self.spawn_origin_call(provider, op, tx, request_key.clone());
                rx
            }
        };

        match tokio::time::timeout(COALESCE_TIMEOUT, rx.recv()).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MarketDataError::Network {
                message: "in-flight request dropped its waiters".to_string(),
            }),
            Err(_) => {
                // Stale in-flight entry; clear it so the next caller retries.
                let mut pending = self.pending.lock().expect("pending lock");
                pending.remove(&request_key);
                Err(MarketDataError::Network {
                    message: format!("request timed out after {:?}", COALESCE_TIMEOUT),
                })
            }
        }
    }

    /// Run the vendor call on a detached task: rate-limit gate, dispatch,
    /// cache write, backoff bookkeeping, then broadcast to all waiters.
    fn spawn_origin_call(
        &self,
        provider: &Arc<dyn MarketDataProvider>,
        op: QueueOp,
        tx: broadcast::Sender<Result<Payload, MarketDataError>>,
        request_key: String,
    ) {
        let provider = Arc::clone(provider);
        let cache = Arc::clone(&self.cache);
        let pending = Arc::clone(&self.pending);
        let backoffs = Arc::clone(&self.backoffs);
        let metrics = self.metrics.clone();
        let rate_wait = self.reserve_rate_slot(provider.name());

        tokio::spawn(async move {
            let provider_name = provider.name();
            if rate_wait > Duration::ZERO {
                debug!(
                    "Rate window full for {}, sleeping {:?}",
                    provider_name, rate_wait
                );
                tokio::time::sleep(rate_wait).await;
            }

            metrics
                .upstream_calls_total
                .with_label_values(&[provider_name])
                .inc();
            let mut result = dispatch(&provider, &op).await;

            if matches!(&result, Err(e) if e.is_rate_limit()) {
                let backoff_secs = enter_backoff(&backoffs, provider_name);
                metrics
                    .backoffs_total
                    .with_label_values(&[provider_name])
                    .inc();
                warn!(
                    "Provider {} rate-limited, backing off {}s",
                    provider_name, backoff_secs
                );
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;

                // One retry after the backoff window.
                metrics
                    .upstream_calls_total
                    .with_label_values(&[provider_name])
                    .inc();
                result = dispatch(&provider, &op).await;
                if matches!(&result, Err(e) if e.is_rate_limit()) {
                    enter_backoff(&backoffs, provider_name);
                }
            }

            if let Ok(payload) = &result {
                {
                    let mut map = backoffs.lock().expect("backoff lock");
                    if let Some(state) = map.get_mut(provider_name) {
                        state.consecutive_failures = 0;
                        state.backoff_until = None;
                    }
                }
                if let Ok(value) = serde_json::to_value(payload) {
                    cache
                        .set(op.cache_kind(), op.symbol(), op.interval().as_deref(), value)
                        .await;
                }
            }

            {
                let mut map = pending.lock().expect("pending lock");
                map.remove(&request_key);
            }
            let _ = tx.send(result);
        });
    }

    /// Record the upcoming request in the provider's window and return how
    /// long the caller must wait first.
    fn reserve_rate_slot(&self, provider_name: &str) -> Duration {
        let limit = self
            .rate_limits
            .get(provider_name)
            .copied()
            .unwrap_or(self.default_rate_limit);
        let mut trackers = self.rate_trackers.lock().expect("rate tracker lock");
        let tracker = trackers
            .entry(provider_name.to_string())
            .or_insert_with(|| RateTracker::new(limit));
        let now = Instant::now();
        let wait = tracker.wait_time(now);
        tracker.record(now + wait);
        wait
    }
}

/// Bump the failure counter and open a backoff window; returns its length.
fn enter_backoff(
    backoffs: &Arc<Mutex<HashMap<String, BackoffState>>>,
    provider_name: &str,
) -> u64 {
    let mut map = backoffs.lock().expect("backoff lock");
    let state = map.entry(provider_name.to_string()).or_default();
    state.consecutive_failures += 1;
    let secs = (1u64 << state.consecutive_failures.min(6)).min(MAX_BACKOFF_SECS);
    state.backoff_until = Some(Instant::now() + Duration::from_secs(secs));
    secs
}

async fn dispatch(
    provider: &Arc<dyn MarketDataProvider>,
    op: &QueueOp,
) -> Result<Payload, MarketDataError> {
    match op {
        QueueOp::Price { symbol } => provider.price(symbol).await.map(Payload::Price),
        QueueOp::Candles(request) => provider.candles(request).await.map(Payload::Candles),
        QueueOp::Sentiment { symbol } => provider.sentiment(symbol).await.map(Payload::Sentiment),
        QueueOp::Volatility { symbol } => {
            provider.volatility(symbol).await.map(Payload::Volatility)
        }
        QueueOp::AssetDetails { symbol } => {
            provider.asset_details(symbol).await.map(Payload::AssetDetails)
        }
    }
}

fn unexpected_payload(expected: &str, got: &Payload) -> MarketDataError {
    MarketDataError::InvalidRequest {
        message: format!("expected {} payload, got {:?}", expected, got),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::Capabilities;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockProvider {
        calls: AtomicUsize,
        fail_rate_limited: bool,
        delay: Duration,
    }

    impl MockProvider {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_rate_limited: false,
                delay: Duration::from_millis(50),
            }
        }

        fn rate_limited() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_rate_limited: true,
                delay: Duration::ZERO,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MarketDataProvider for MockProvider {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                price: true,
                candles: true,
                ..Default::default()
            }
        }

        async fn price(&self, symbol: &str) -> Result<PriceSnapshot, MarketDataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_rate_limited {
                return Err(MarketDataError::RateLimited {
                    provider: "mock".to_string(),
                    retry_after_secs: 60,
                });
            }
            tokio::time::sleep(self.delay).await;
            Ok(PriceSnapshot {
                symbol: symbol.to_string(),
                price: dec!(123.45),
                change_pct: 0.5,
                timestamp: Utc::now(),
                provider: "mock".to_string(),
            })
        }

        async fn candles(
            &self,
            request: &CandleRequest,
        ) -> Result<Vec<Candle>, MarketDataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = request;
            Ok(Vec::new())
        }
    }

    fn queue_with(limit: usize) -> (Arc<RequestQueue>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MarketDataCache::new(dir.path(), 100));
        let queue = Arc::new(
            RequestQueue::new(cache, Metrics::new().unwrap()).with_rate_limit("mock", limit),
        );
        (queue, dir)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_requests_hit_upstream_once() {
        let (queue, _dir) = queue_with(60);
        let mock = Arc::new(MockProvider::new());
        let provider: Arc<dyn MarketDataProvider> = mock.clone();

        let q1 = Arc::clone(&queue);
        let p1 = Arc::clone(&provider);
        let a = tokio::spawn(async move { q1.price(&p1, "AAPL").await });
        let q2 = Arc::clone(&queue);
        let p2 = Arc::clone(&provider);
        let b = tokio::spawn(async move { q2.price(&p2, "AAPL").await });

        let (ra, rb) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(ra.price, rb.price);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_short_circuits_second_request() {
        let (queue, _dir) = queue_with(60);
        let mock = Arc::new(MockProvider::new());
        let provider: Arc<dyn MarketDataProvider> = mock.clone();

        queue.price(&provider, "AAPL").await.unwrap();
        queue.price(&provider, "AAPL").await.unwrap();
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window_delays_excess_requests() {
        let (queue, _dir) = queue_with(2);
        let mock = Arc::new(MockProvider::new());
        let provider: Arc<dyn MarketDataProvider> = mock.clone();

        let started = Instant::now();
        queue.price(&provider, "A").await.unwrap();
        queue.price(&provider, "B").await.unwrap();
        // Third distinct request must wait for the window to roll over.
        queue.price(&provider, "C").await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(59));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_errors_enter_backoff() {
        let (queue, _dir) = queue_with(60);
        let mock = Arc::new(MockProvider::rate_limited());
        let provider: Arc<dyn MarketDataProvider> = mock.clone();

        let result = queue.price(&provider, "AAPL").await;
        assert!(result.is_err());

        // Initial call plus one retry, both rate limited.
        assert_eq!(mock.call_count(), 2);
        let (failures, remaining) = queue.backoff_state("mock");
        assert!(failures >= 2);
        assert!(remaining.is_some());
    }
}
