//! Composite market context: one snapshot combining price, volume,
//! realized volatility, recent changes, sentiment and regime. Serves the
//! context surface and the streaming layer; every failure degrades to
//! safe defaults instead of erroring.

use std::sync::Arc;
use chrono::Utc;
use tracing::debug;

use crate::application::brain::regime::RegimeDetector;
use crate::domain::market::types::{CandleRequest, MarketContext, SentimentLabel, closes, volumes};
use crate::domain::market::Timeframe;
use crate::infrastructure::market_data::ProviderRouter;
use crate::infrastructure::market_data::sentiment::SentimentService;
use rust_decimal::prelude::ToPrimitive;

pub struct MarketContextService {
    router: Arc<ProviderRouter>,
    sentiment: Arc<SentimentService>,
    regime: Arc<RegimeDetector>,
}

impl MarketContextService {
    pub fn new(
        router: Arc<ProviderRouter>,
        sentiment: Arc<SentimentService>,
        regime: Arc<RegimeDetector>,
    ) -> Self {
        Self {
            router,
            sentiment,
            regime,
        }
    }

    pub async fn context(&self, symbol: &str) -> MarketContext {
        let mut context = MarketContext::degraded(symbol);
        context.timestamp = Utc::now();

        match self.router.price(symbol).await {
            Ok(snapshot) => {
                context.price = snapshot.price.to_f64().unwrap_or(0.0);
                context.change_24h = snapshot.change_pct;
            }
            Err(e) => debug!("Context price unavailable for {}: {}", symbol, e),
        }

        let request = CandleRequest::historical(symbol, Timeframe::OneDay, 60, None, None);
        let candles = self.router.candles_or_empty(&request).await;
        if candles.len() >= 2 {
            let close_prices = closes(&candles);
            let vols = volumes(&candles);

            context.volume = if vols.len() >= 20 {
                vols[vols.len() - 20..].iter().sum::<f64>() / 20.0
            } else {
                *vols.last().unwrap_or(&0.0)
            };

            let last = close_prices[close_prices.len() - 1];
            let prev = close_prices[close_prices.len() - 2];
            if context.change_24h == 0.0 && prev > 0.0 {
                context.change_24h = (last / prev - 1.0) * 100.0;
            }
            if close_prices.len() >= 7 {
                let week_ago = close_prices[close_prices.len() - 7];
                if week_ago > 0.0 {
                    context.change_7d = (last / week_ago - 1.0) * 100.0;
                }
            } else {
                context.change_7d = context.change_24h;
            }

            if close_prices.len() >= 20 {
                let returns: Vec<f64> = close_prices[close_prices.len() - 20..]
                    .windows(2)
                    .filter(|w| w[0] > 0.0)
                    .map(|w| w[1] / w[0] - 1.0)
                    .collect();
                if returns.len() > 1 {
                    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
                    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
                        / (returns.len() - 1) as f64;
                    context.annualized_volatility = variance.sqrt() * (252.0f64).sqrt() * 100.0;
                }
            }
        }

        // Price-derived sentiment is the floor; headline sentiment can
        // override it when available.
        context.sentiment = if context.change_24h > 2.0 || context.change_7d > 5.0 {
            SentimentLabel::Bullish
        } else if context.change_24h < -2.0 || context.change_7d < -5.0 {
            SentimentLabel::Bearish
        } else {
            SentimentLabel::Neutral
        };
        let headline = self.sentiment.analyze(symbol).await;
        if headline.source != "fallback" {
            context.sentiment = headline.label;
        }

        let assessment = self.regime.assess(symbol).await;
        context.regime = assessment.regime.to_string();
        context.regime_confidence = assessment.confidence;

        context
    }
}
